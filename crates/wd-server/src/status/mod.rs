//! Status reconciliation and conflict diagnostics

mod conflict;
mod reconciler;

pub use conflict::{
    analyze, ConflictAnalyzer, ConflictFlag, ConflictKind, ConflictReport, ConflictWindows,
    Transition,
};
pub use reconciler::{HookOutcome, HookSignal, StatusReconciler};
