//! Decoding of encoded project directory names
//!
//! Agent session stores name each project folder after its source path with
//! every `/` and `.` replaced by `-` (so `/home/me/.cfg/my-app` becomes
//! `-home-me--cfg-my-app`). The mapping is lossy: a `-` in the encoded name may
//! have been a separator, a dash, a dot or an underscore in the original.
//!
//! [`decode_project_dir`] is therefore best-effort. It first tries the naive
//! reading, then walks the filesystem choosing segment boundaries that exist
//! on disk, and finally falls back to the naive reading marked as unverified.
//! Callers must not treat an unverified result as the original path.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Characters that the encoder collapsed into `-` inside one path segment
const SEGMENT_JOINERS: &[char] = &['-', '.', '_'];

/// Result of decoding an encoded directory name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedPath {
    pub path: PathBuf,
    /// The path was confirmed to exist on this machine
    pub verified: bool,
}

/// One indexed project folder
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectEntry {
    pub encoded: String,
    pub decoded: DecodedPath,
    /// Number of `.jsonl` session files in the folder
    pub session_count: usize,
}

/// Encode a path the way session stores name their folders
pub fn encode_project_dir(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect()
}

/// Decode an encoded project folder name back to a directory path.
pub fn decode_project_dir(encoded: &str) -> DecodedPath {
    decode_project_dir_from(Path::new("/"), encoded)
}

/// Decode relative to an explicit root (the root is not part of the name).
pub fn decode_project_dir_from(root: &Path, encoded: &str) -> DecodedPath {
    let tokens = tokenize(encoded);
    let naive = tokens.iter().fold(root.to_path_buf(), |p, t| p.join(t));

    if naive.is_dir() {
        return DecodedPath {
            path: naive,
            verified: true,
        };
    }

    if let Some(path) = walk(root, &tokens) {
        return DecodedPath {
            path,
            verified: true,
        };
    }

    tracing::debug!("Could not verify decoded path for {}", encoded);
    DecodedPath {
        path: naive,
        verified: false,
    }
}

/// Index every encoded project folder directly under `root`.
pub fn scan_project_dirs(root: &Path) -> io::Result<Vec<ProjectEntry>> {
    let mut entries = Vec::new();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let encoded = entry.file_name().to_string_lossy().into_owned();
        let session_count = std::fs::read_dir(entry.path())?
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "jsonl"))
            .count();

        entries.push(ProjectEntry {
            decoded: decode_project_dir(&encoded),
            encoded,
            session_count,
        });
    }

    entries.sort_by(|a, b| a.encoded.cmp(&b.encoded));
    Ok(entries)
}

/// Split on `-`, turning `--x` (an encoded `/.`) into a `.x` token.
fn tokenize(encoded: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut hidden = false;

    for part in encoded.trim_start_matches('-').split('-') {
        if part.is_empty() {
            hidden = true;
            continue;
        }
        if hidden {
            tokens.push(format!(".{}", part));
            hidden = false;
        } else {
            tokens.push(part.to_string());
        }
    }

    tokens
}

/// Depth-first search for a segmentation of `tokens` that exists under `base`.
/// Longer segments are tried first so `my-app` beats `my/app`.
fn walk(base: &Path, tokens: &[String]) -> Option<PathBuf> {
    if tokens.is_empty() {
        return base.is_dir().then(|| base.to_path_buf());
    }

    for span in (1..=tokens.len()).rev() {
        let head = &tokens[..span];
        let joiners: &[char] = if span == 1 { &['-'] } else { SEGMENT_JOINERS };

        for joiner in joiners {
            let segment = head.join(joiner.to_string().as_str());
            let candidate = base.join(&segment);
            if !candidate.is_dir() {
                continue;
            }
            if let Some(found) = walk(&candidate, &tokens[span..]) {
                return Some(found);
            }
        }
    }

    None
}
