//! The engine contract every backend implements.

use crate::arena::Arena;
use crate::error::Result;
use crate::types::{
    CallContext, CollectionId, DropMode, Key, OpOptions, SnapshotId, Strided,
    TxnHandle, ValuesView,
};

/// Batched point lookups.
#[derive(Debug, Clone)]
pub struct ReadRequest<'a> {
    pub collections: Strided<'a, CollectionId>,
    pub keys: Strided<'a, Key>,
    pub tasks: usize,
}

/// Batched upserts and deletions. `values == None` deletes every
/// addressed key; otherwise each cleared validity bit deletes its key.
#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    pub collections: Strided<'a, CollectionId>,
    pub keys: Strided<'a, Key>,
    pub values: Option<ValuesView<'a>>,
    pub tasks: usize,
}

/// Batched ordered range heads: per task, up to `count_limits[i]` keys
/// `≥ start_keys[i]` in ascending order.
#[derive(Debug, Clone)]
pub struct ScanRequest<'a> {
    pub collections: Strided<'a, CollectionId>,
    pub start_keys: Strided<'a, Key>,
    pub count_limits: Strided<'a, u32>,
    pub tasks: usize,
}

/// Batched uniform sampling without replacement.
#[derive(Debug, Clone)]
pub struct SampleRequest<'a> {
    pub collections: Strided<'a, CollectionId>,
    pub count_limits: Strided<'a, u32>,
    pub tasks: usize,
}

/// The abstract transactional KV store the whole server is built on.
///
/// Implementations are internally synchronized and shared for the process
/// lifetime. Transactions, however, are **not** thread-safe: the session
/// layer guarantees at most one in-flight call per transaction handle, and
/// backends may rely on that.
///
/// Reply buffers are written into the caller's [`Arena`]; output-producing
/// calls reset it on entry. See [`Arena`] for the shape each operation
/// fills.
pub trait Engine: Send + Sync + 'static {
    // ── Batched data plane ────────────────────────────────────────────

    /// Look up `tasks` keys. Fills presence bitmap, offsets, lengths and
    /// the value blob. A transactional read records each key in the
    /// transaction's watch set unless `dont_watch` is set.
    fn read(&self, ctx: CallContext, req: ReadRequest<'_>, arena: &mut Arena) -> Result<()>;

    /// Apply `tasks` upserts/deletions as one atomic batch: buffered
    /// when a transaction is active, linearized as a singleton commit
    /// otherwise.
    fn write(&self, ctx: CallContext, req: WriteRequest<'_>) -> Result<()>;

    /// Ascending key ranges. Transactional scans merge the transaction's
    /// own writes over committed state.
    fn scan(&self, ctx: CallContext, req: ScanRequest<'_>, arena: &mut Arena) -> Result<()>;

    /// Uniform key samples without replacement, drawn from committed
    /// state.
    fn sample(&self, ctx: CallContext, req: SampleRequest<'_>, arena: &mut Arena) -> Result<()>;

    // ── Collections ───────────────────────────────────────────────────

    /// Find or create a named collection. The empty name resolves to the
    /// main collection.
    fn collection_create(&self, name: &str, config: &str) -> Result<CollectionId>;

    /// Drop collection state according to `mode`.
    fn collection_drop(&self, id: CollectionId, mode: DropMode) -> Result<()>;

    /// List collections ordered by id; fills `ids`, name `bytes` and
    /// `offsets`. Returns the collection count.
    fn collection_list(&self, arena: &mut Arena) -> Result<usize>;

    // ── Snapshots ─────────────────────────────────────────────────────

    /// Freeze the current committed state under a fresh id.
    fn snapshot_create(&self) -> Result<SnapshotId>;

    fn snapshot_drop(&self, id: SnapshotId) -> Result<()>;

    /// List live snapshot ids into `arena.ids`; returns the count.
    fn snapshot_list(&self, arena: &mut Arena) -> Result<usize>;

    // ── Transactions ──────────────────────────────────────────────────

    /// Open a transaction with an empty write and watch set.
    fn txn_begin(&self, options: OpOptions) -> Result<TxnHandle>;

    /// Validate the watch set and publish the write set atomically.
    /// The handle is consumed whether the commit succeeds or fails with
    /// [`ConflictingWrite`](crate::EngineError::ConflictingWrite).
    fn txn_commit(&self, txn: TxnHandle, options: OpOptions) -> Result<()>;

    /// Discard a transaction without committing. Unknown handles are
    /// ignored.
    fn txn_free(&self, txn: TxnHandle);
}
