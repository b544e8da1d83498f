//! Adjacency record codec.
//!
//! A vertex record is a sequence of fixed-stride entries, three
//! little-endian `i64` words each: `(neighbor, edge_id, direction)`.
//! The fixed stride allows in-place append, cheap degree counting and a
//! stable iteration order.

use basalt_engine::{EngineError, Key, Result};

/// Bytes per adjacency entry.
pub const ENTRY_BYTES: usize = 24;

/// Edge id stored for edges inserted without an explicit id.
pub const EDGE_ID_NONE: Key = Key::MIN;

/// Which endpoint of the edge this record entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The record's vertex is the edge source.
    Out,
    /// The record's vertex is the edge target.
    In,
}

/// One entry of a vertex record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdjEntry {
    pub neighbor: Key,
    pub edge_id: Key,
    pub direction: Direction,
}

fn word(chunk: &[u8]) -> i64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(chunk);
    i64::from_le_bytes(raw)
}

/// Decode a vertex record blob.
pub fn decode(bytes: &[u8]) -> Result<Vec<AdjEntry>> {
    if bytes.len() % ENTRY_BYTES != 0 {
        return Err(EngineError::engine(format!(
            "adjacency record length {} is not a multiple of {ENTRY_BYTES}",
            bytes.len()
        )));
    }
    let mut entries = Vec::with_capacity(bytes.len() / ENTRY_BYTES);
    for chunk in bytes.chunks_exact(ENTRY_BYTES) {
        let direction = match word(&chunk[16..24]) {
            0 => Direction::Out,
            1 => Direction::In,
            other => {
                return Err(EngineError::engine(format!(
                    "adjacency entry carries unknown direction {other}"
                )))
            }
        };
        entries.push(AdjEntry {
            neighbor: word(&chunk[0..8]),
            edge_id: word(&chunk[8..16]),
            direction,
        });
    }
    Ok(entries)
}

/// Encode entries back into a record blob.
pub fn encode(entries: &[AdjEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * ENTRY_BYTES);
    for entry in entries {
        out.extend_from_slice(&entry.neighbor.to_le_bytes());
        out.extend_from_slice(&entry.edge_id.to_le_bytes());
        let direction: i64 = match entry.direction {
            Direction::Out => 0,
            Direction::In => 1,
        };
        out.extend_from_slice(&direction.to_le_bytes());
    }
    out
}

/// Append `entry` unless an identical entry is already present.
/// Returns whether the record changed.
pub fn append_unique(entries: &mut Vec<AdjEntry>, entry: AdjEntry) -> bool {
    if entries.contains(&entry) {
        return false;
    }
    entries.push(entry);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(neighbor: Key, edge_id: Key, direction: Direction) -> AdjEntry {
        AdjEntry { neighbor, edge_id, direction }
    }

    #[test]
    fn encode_decode_round_trips() {
        let entries = vec![
            entry(2, 9, Direction::Out),
            entry(3, EDGE_ID_NONE, Direction::In),
            entry(-5, 0, Direction::Out),
        ];
        let blob = encode(&entries);
        assert_eq!(blob.len(), 3 * ENTRY_BYTES);
        assert_eq!(decode(&blob).unwrap(), entries);
    }

    #[test]
    fn empty_record_decodes_to_no_entries() {
        assert!(decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn truncated_record_is_rejected() {
        let blob = encode(&[entry(1, 2, Direction::Out)]);
        assert!(decode(&blob[..ENTRY_BYTES - 1]).is_err());
    }

    #[test]
    fn unknown_direction_is_rejected() {
        let mut blob = encode(&[entry(1, 2, Direction::Out)]);
        blob[16] = 7;
        assert!(decode(&blob).is_err());
    }

    #[test]
    fn append_unique_deduplicates() {
        let mut entries = Vec::new();
        assert!(append_unique(&mut entries, entry(2, 9, Direction::Out)));
        assert!(!append_unique(&mut entries, entry(2, 9, Direction::Out)));
        // Same neighbor, other direction is a distinct entry (self-loop
        // bookkeeping relies on this).
        assert!(append_unique(&mut entries, entry(2, 9, Direction::In)));
        assert_eq!(entries.len(), 2);
    }
}
