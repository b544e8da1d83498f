//! # basalt-graph
//!
//! Graph modality over the BasaltDB KV substrate: labeled directed edges
//! projected onto per-vertex adjacency records.
//!
//! A vertex is a key; its value is a fixed-stride record listing every
//! incident edge once per endpoint, so the blob under key `v` answers
//! degree and neighborhood queries for `v` without touching any other
//! key. Every multi-record mutation goes through a single engine write
//! batch under the caller's transaction (if any), which keeps the two
//! copies of each edge in step.

pub mod graph;
pub mod record;

pub use graph::{Edge, GraphCollection};
pub use record::{AdjEntry, Direction, EDGE_ID_NONE, ENTRY_BYTES};
