//! PSH-boundary-aware receive buffer (§3 "Receive buffer", §4.5).
//!
//! `read()` on a stream socket must not return data past a PSH boundary
//! until the caller actually asks for that much — `can_get(n)` is the
//! predicate the worker's read-wait loop blocks on.

use std::collections::VecDeque;

/// One contiguous run of bytes delivered in-order, tagged with whether the
/// segment that ended it carried PSH.
#[derive(Debug)]
struct Chunk {
    data: VecDeque<u8>,
    pushed: bool,
}

#[derive(Debug, Default)]
pub struct RecvBuffer {
    chunks: VecDeque<Chunk>,
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self { chunks: VecDeque::new() }
    }

    /// Appends newly-received, in-order bytes. `pushed` marks the segment
    /// boundary they arrived on as a PSH boundary.
    pub fn push(&mut self, data: &[u8], pushed: bool) {
        if data.is_empty() && !pushed {
            return;
        }
        self.chunks.push_back(Chunk { data: data.iter().copied().collect(), pushed });
    }

    pub fn total_len(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// `canGet(n)` (§3): true once either `n` bytes are available, or a PSH
    /// boundary has been reached with at least one byte available — reading
    /// must not block forever waiting for more than the sender actually
    /// pushed.
    pub fn can_get(&self, n: usize) -> bool {
        let mut seen = 0usize;
        for chunk in &self.chunks {
            seen += chunk.data.len();
            if seen >= n {
                return true;
            }
            if chunk.pushed && seen > 0 {
                return true;
            }
        }
        false
    }

    /// Drains up to `n` bytes, stopping early at a PSH boundary it has
    /// reached. Returns fewer than `n` bytes only when the buffer runs dry
    /// at such a boundary.
    pub fn get(&mut self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n.min(self.total_len()));
        while out.len() < n {
            let Some(front) = self.chunks.front_mut() else { break };
            let need = n - out.len();
            let take = need.min(front.data.len());
            out.extend(front.data.drain(..take));
            if front.data.is_empty() {
                let pushed = front.pushed;
                self.chunks.pop_front();
                if pushed {
                    break;
                }
            } else {
                break;
            }
        }
        out
    }
}
