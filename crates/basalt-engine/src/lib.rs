//! # basalt-engine
//!
//! The transactional key-value substrate underneath every BasaltDB
//! modality. Higher layers (graph, paths, the Flight request pipeline)
//! depend only on the [`Engine`] trait; the physical backends live behind
//! it:
//!
//! | Backend | Module | Notes |
//! |---------|--------|-------|
//! | In-memory ordered set with MVCC | [`mem`] | reference backend, full contract |
//! | Persistent LSM tree (RocksDB)   | [`lsm`] | one column family per collection |
//!
//! All batched operations exchange data through an [`Arena`], a scratch
//! region owned by the caller's session slot and reused across calls.
//! Once its buffers reach their high-water mark the hot path performs no
//! per-request allocation.

pub mod arena;
pub mod engine;
pub mod error;
pub mod types;

mod txn;

pub mod lsm;
pub mod mem;

pub use arena::Arena;
pub use engine::{
    Engine, ReadRequest, SampleRequest, ScanRequest, WriteRequest,
};
pub use error::{EngineError, Result};
pub use types::{
    bit_get, bit_set, bitmap_bytes, CallContext, CollectionId, DropMode, Key,
    OpOptions, SnapshotId, Strided, TxnHandle, ValuesView, MAIN_COLLECTION,
    MISSING_LENGTH,
};

pub use lsm::LsmEngine;
pub use mem::MemEngine;
