//! Per-session scratch memory.

use crate::types::{bit_get, Key};

/// Reusable output region handed to every engine call.
///
/// An arena is owned by one session slot: the request pipeline passes it
/// to the engine, exports the filled buffers into the response batch, and
/// then either resets it (non-transactional calls) or retains it with the
/// transaction. Buffers keep their capacity across [`reset`](Self::reset),
/// so a warm session performs no allocation on repeat calls.
///
/// Engine operations that produce output reset the arena on entry and
/// fill the subset of buffers their reply shape needs:
///
/// | Operation | `presences` | `offsets` | `lengths` | `bytes` | `keys` | `counts` | `ids` |
/// |-----------|-------------|-----------|-----------|---------|--------|----------|-------|
/// | `read`    | ✓ | ✓ (`n+1`) | ✓ | ✓ | | | |
/// | `scan` / `sample` | | ✓ (`n+1`) | | | ✓ | ✓ | |
/// | `collection_list` | | ✓ (`n+1`) | | names | | | ✓ |
/// | `snapshot_list`   | | | | | | | ✓ |
#[derive(Debug, Default)]
pub struct Arena {
    /// Contiguous variable-length payloads: values, concatenated names.
    pub bytes: Vec<u8>,
    /// Prefix offsets into `bytes` or `keys`, one more than the task count.
    pub offsets: Vec<u32>,
    /// Per-task value lengths; [`MISSING_LENGTH`](crate::MISSING_LENGTH)
    /// marks an absent key.
    pub lengths: Vec<u32>,
    /// LSB-first presence bitmap, `⌈n/8⌉` bytes.
    pub presences: Vec<u8>,
    /// Flat result keys for scans and samples.
    pub keys: Vec<Key>,
    /// Per-task result counts for scans and samples.
    pub counts: Vec<u32>,
    /// Collection or snapshot ids for listings.
    pub ids: Vec<u64>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every buffer, keeping capacity.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.offsets.clear();
        self.lengths.clear();
        self.presences.clear();
        self.keys.clear();
        self.counts.clear();
        self.ids.clear();
    }

    /// Append one read-reply entry: sets the presence bit, length and
    /// value bytes for task `i` and advances the offsets. The presence
    /// bitmap must already be sized for the batch.
    pub fn push_value(&mut self, i: usize, value: Option<&[u8]>) {
        match value {
            Some(v) => {
                crate::types::bit_set(&mut self.presences, i, true);
                self.lengths.push(v.len() as u32);
                self.bytes.extend_from_slice(v);
            }
            None => self.lengths.push(crate::MISSING_LENGTH),
        }
        self.offsets.push(self.bytes.len() as u32);
    }

    /// Presence bit for task `i`.
    pub fn presence(&self, i: usize) -> bool {
        bit_get(&self.presences, i)
    }

    /// Value slice for task `i` of a `read` reply, `None` when absent.
    pub fn value(&self, i: usize) -> Option<&[u8]> {
        if !self.presence(i) {
            return None;
        }
        let lo = self.offsets[i] as usize;
        let hi = self.offsets[i + 1] as usize;
        Some(&self.bytes[lo..hi])
    }

    /// UTF-8 entry `i` of a listing reply (e.g. a collection name).
    pub fn utf8(&self, i: usize) -> &str {
        let lo = self.offsets[i] as usize;
        let hi = self.offsets[i + 1] as usize;
        std::str::from_utf8(&self.bytes[lo..hi]).unwrap_or("")
    }

    /// Keys of task `i` in a `scan`/`sample` reply.
    pub fn task_keys(&self, i: usize) -> &[Key] {
        let lo = self.offsets[i] as usize;
        let hi = self.offsets[i + 1] as usize;
        &self.keys[lo..hi]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::bit_set;

    #[test]
    fn reset_keeps_capacity() {
        let mut arena = Arena::new();
        arena.bytes.extend_from_slice(&[0u8; 1024]);
        let cap = arena.bytes.capacity();
        arena.reset();
        assert!(arena.bytes.is_empty());
        assert_eq!(arena.bytes.capacity(), cap);
    }

    #[test]
    fn value_accessor_respects_presence() {
        let mut arena = Arena::new();
        arena.presences = vec![0u8; 1];
        bit_set(&mut arena.presences, 0, true);
        arena.offsets = vec![0, 3, 3];
        arena.bytes = b"abc".to_vec();
        assert_eq!(arena.value(0), Some(&b"abc"[..]));
        assert_eq!(arena.value(1), None);
    }
}
