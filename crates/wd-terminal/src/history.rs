//! Bounded output history
//!
//! Keeps the most recent bytes a session produced so a viewer that attaches
//! late can replay them. Oldest chunks are evicted first.

use std::collections::VecDeque;

use bytes::Bytes;

/// Byte-bounded ring of output chunks
#[derive(Debug)]
pub struct OutputHistory {
    chunks: VecDeque<Bytes>,
    len: usize,
    capacity: usize,
}

impl OutputHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            len: 0,
            capacity,
        }
    }

    /// Append a chunk, evicting from the front until within capacity.
    ///
    /// A chunk larger than the whole capacity keeps only its tail.
    pub fn push(&mut self, chunk: Bytes) {
        if self.capacity == 0 || chunk.is_empty() {
            return;
        }

        let chunk = if chunk.len() > self.capacity {
            self.chunks.clear();
            self.len = 0;
            chunk.slice(chunk.len() - self.capacity..)
        } else {
            chunk
        };

        self.len += chunk.len();
        self.chunks.push_back(chunk);

        while self.len > self.capacity {
            let Some(front) = self.chunks.pop_front() else {
                break;
            };
            let excess = self.len - self.capacity;
            if front.len() > excess {
                // Trim the partially evicted chunk instead of dropping all of it
                self.len -= excess;
                self.chunks.push_front(front.slice(excess..));
            } else {
                self.len -= front.len();
            }
        }
    }

    /// Contiguous copy of the retained bytes, oldest first
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}
