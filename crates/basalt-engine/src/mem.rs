//! In-memory engine backend.
//!
//! One ordered map per collection, deep-frozen copies for snapshots, and
//! optimistic transaction bookkeeping from [`crate::txn`]. This is the
//! reference backend: it implements the full contract and is what the
//! request-pipeline and modality tests run against.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use tracing::debug;

use crate::arena::Arena;
use crate::engine::{Engine, ReadRequest, SampleRequest, ScanRequest, WriteRequest};
use crate::error::{EngineError, Result};
use crate::txn::{TxnState, TxnTable};
use crate::types::{
    bitmap_bytes, CallContext, CollectionId, DropMode, Key, OpOptions,
    SnapshotId, TxnHandle, MAIN_COLLECTION,
};

type Data = BTreeMap<Key, Vec<u8>>;
type Frozen = BTreeMap<CollectionId, Data>;

struct Collection {
    name: String,
    #[allow(dead_code)]
    config: String,
    data: Data,
}

#[derive(Default)]
struct Inner {
    collections: BTreeMap<CollectionId, Collection>,
    names: HashMap<String, CollectionId>,
    next_collection: CollectionId,
    snapshots: BTreeMap<SnapshotId, Frozen>,
    next_snapshot: SnapshotId,
    txns: TxnTable,
}

/// In-memory ordered KV store with MVCC-style snapshots and optimistic
/// transactions.
pub struct MemEngine {
    inner: Mutex<Inner>,
}

impl Default for MemEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemEngine {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        inner.collections.insert(
            MAIN_COLLECTION,
            Collection { name: String::new(), config: String::new(), data: Data::new() },
        );
        inner.names.insert(String::new(), MAIN_COLLECTION);
        Self { inner: Mutex::new(inner) }
    }
}

fn check_exclusive(ctx: &CallContext) -> Result<()> {
    if ctx.txn.is_some() && ctx.snapshot.is_some() {
        return Err(EngineError::args(
            "transaction and snapshot are mutually exclusive",
        ));
    }
    Ok(())
}

impl Engine for MemEngine {
    fn read(&self, ctx: CallContext, req: ReadRequest<'_>, arena: &mut Arena) -> Result<()> {
        check_exclusive(&ctx)?;
        arena.reset();
        arena.presences.resize(bitmap_bytes(req.tasks), 0);
        arena.offsets.push(0);

        let mut guard = self.inner.lock();
        let Inner { collections, snapshots, txns, .. } = &mut *guard;

        for i in 0..req.tasks {
            let col = req.collections.get(i);
            let key = req.keys.get(i);

            if let Some(snap) = ctx.snapshot {
                let frozen = snapshots
                    .get(&snap)
                    .ok_or_else(|| EngineError::args(format!("unknown snapshot {snap}")))?;
                let value = frozen.get(&col).and_then(|data| data.get(&key));
                arena.push_value(i, value.map(|v| v.as_slice()));
                continue;
            }

            let data = &collections
                .get(&col)
                .ok_or_else(|| EngineError::args(format!("unknown collection {col}")))?
                .data;

            match ctx.txn {
                Some(txn) => match txns.observe(txn, col, key, ctx.options)? {
                    // The transaction's own buffered write wins.
                    Some(buffered) => arena.push_value(i, buffered.as_deref()),
                    None => arena.push_value(i, data.get(&key).map(|v| v.as_slice())),
                },
                None => arena.push_value(i, data.get(&key).map(|v| v.as_slice())),
            }
        }
        Ok(())
    }

    fn write(&self, ctx: CallContext, req: WriteRequest<'_>) -> Result<()> {
        if ctx.snapshot.is_some() {
            return Err(EngineError::args("writes cannot target a snapshot"));
        }
        let mut guard = self.inner.lock();
        let Inner { collections, txns, .. } = &mut *guard;

        // Validate the whole batch before touching anything: the batch
        // is all-or-nothing.
        for i in 0..req.tasks {
            let col = req.collections.get(i);
            if !collections.contains_key(&col) {
                return Err(EngineError::args(format!("unknown collection {col}")));
            }
        }

        match ctx.txn {
            Some(txn) => {
                let state = txns.state_mut(txn)?;
                for i in 0..req.tasks {
                    let value = req.values.as_ref().and_then(|v| v.get(i));
                    state
                        .writes
                        .insert((req.collections.get(i), req.keys.get(i)), value.map(<[u8]>::to_vec));
                }
            }
            None => {
                // Non-transactional writes linearize as singleton commits.
                let stamp = txns.tick();
                for i in 0..req.tasks {
                    let col = req.collections.get(i);
                    let key = req.keys.get(i);
                    if let Some(collection) = collections.get_mut(&col) {
                        match req.values.as_ref().and_then(|v| v.get(i)) {
                            Some(value) => {
                                collection.data.insert(key, value.to_vec());
                            }
                            None => {
                                collection.data.remove(&key);
                            }
                        }
                    }
                    txns.touch(col, key, stamp);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, ctx: CallContext, req: ScanRequest<'_>, arena: &mut Arena) -> Result<()> {
        check_exclusive(&ctx)?;
        arena.reset();
        arena.offsets.push(0);

        let guard = self.inner.lock();
        let Inner { collections, snapshots, txns, .. } = &*guard;
        let txn_state: Option<&TxnState> = match ctx.txn {
            Some(txn) => Some(txns.state(txn)?),
            None => None,
        };
        let empty = Data::new();

        for i in 0..req.tasks {
            let col = req.collections.get(i);
            let start = req.start_keys.get(i);
            let limit = req.count_limits.get(i) as usize;

            let data = if let Some(snap) = ctx.snapshot {
                let frozen = snapshots
                    .get(&snap)
                    .ok_or_else(|| EngineError::args(format!("unknown snapshot {snap}")))?;
                frozen.get(&col).unwrap_or(&empty)
            } else {
                &collections
                    .get(&col)
                    .ok_or_else(|| EngineError::args(format!("unknown collection {col}")))?
                    .data
            };

            let mut count = 0u32;
            let mut committed = data.range(start..).map(|(k, _)| *k).peekable();
            match txn_state {
                None => {
                    for key in committed.by_ref().take(limit) {
                        arena.keys.push(key);
                        count += 1;
                    }
                }
                Some(state) => {
                    // Merge the transaction's buffered writes over
                    // committed keys; buffered deletions hide keys.
                    let mut overlay = state
                        .writes
                        .range((col, start)..=(col, Key::MAX))
                        .map(|((_, k), v)| (*k, v.is_some()))
                        .peekable();
                    while (count as usize) < limit {
                        let next = match (committed.peek().copied(), overlay.peek().copied()) {
                            (None, None) => break,
                            (Some(ck), None) => {
                                committed.next();
                                Some(ck)
                            }
                            (None, Some((ok, present))) => {
                                overlay.next();
                                present.then_some(ok)
                            }
                            (Some(ck), Some((ok, present))) => {
                                if ck < ok {
                                    committed.next();
                                    Some(ck)
                                } else {
                                    if ck == ok {
                                        committed.next();
                                    }
                                    overlay.next();
                                    present.then_some(ok)
                                }
                            }
                        };
                        if let Some(key) = next {
                            arena.keys.push(key);
                            count += 1;
                        }
                    }
                }
            }
            arena.counts.push(count);
            arena.offsets.push(arena.keys.len() as u32);
        }
        Ok(())
    }

    fn sample(&self, ctx: CallContext, req: SampleRequest<'_>, arena: &mut Arena) -> Result<()> {
        check_exclusive(&ctx)?;
        arena.reset();
        arena.offsets.push(0);

        let guard = self.inner.lock();
        let Inner { collections, snapshots, .. } = &*guard;
        let empty = Data::new();
        let mut rng = rand::thread_rng();

        for i in 0..req.tasks {
            let col = req.collections.get(i);
            let limit = req.count_limits.get(i) as usize;

            let data = if let Some(snap) = ctx.snapshot {
                let frozen = snapshots
                    .get(&snap)
                    .ok_or_else(|| EngineError::args(format!("unknown snapshot {snap}")))?;
                frozen.get(&col).unwrap_or(&empty)
            } else {
                &collections
                    .get(&col)
                    .ok_or_else(|| EngineError::args(format!("unknown collection {col}")))?
                    .data
            };

            let amount = limit.min(data.len());
            let mut picked = rand::seq::index::sample(&mut rng, data.len(), amount).into_vec();
            picked.sort_unstable();

            let mut keys = data.keys();
            let mut consumed = 0usize;
            for index in picked {
                if let Some(key) = keys.nth(index - consumed) {
                    arena.keys.push(*key);
                }
                consumed = index + 1;
            }
            arena.counts.push(amount as u32);
            arena.offsets.push(arena.keys.len() as u32);
        }
        Ok(())
    }

    fn collection_create(&self, name: &str, config: &str) -> Result<CollectionId> {
        if name.is_empty() {
            return Ok(MAIN_COLLECTION);
        }
        let mut inner = self.inner.lock();
        if let Some(id) = inner.names.get(name) {
            return Ok(*id);
        }
        inner.next_collection += 1;
        let id = inner.next_collection;
        inner.collections.insert(
            id,
            Collection { name: name.to_owned(), config: config.to_owned(), data: Data::new() },
        );
        inner.names.insert(name.to_owned(), id);
        debug!(collection = name, id, "collection created");
        Ok(id)
    }

    fn collection_drop(&self, id: CollectionId, mode: DropMode) -> Result<()> {
        let mut guard = self.inner.lock();
        let Inner { collections, names, txns, .. } = &mut *guard;
        let collection = collections
            .get_mut(&id)
            .ok_or_else(|| EngineError::args(format!("unknown collection {id}")))?;

        let touched: Vec<Key> = collection.data.keys().copied().collect();
        match mode {
            DropMode::Values => {
                collection.data.values_mut().for_each(Vec::clear);
            }
            DropMode::Contents => {
                collection.data.clear();
            }
            DropMode::Handle => {
                if id == MAIN_COLLECTION {
                    return Err(EngineError::args("cannot drop the main collection"));
                }
                let name = collection.name.clone();
                collections.remove(&id);
                names.remove(&name);
            }
        }

        // Every erased key counts as an overwrite for watchers.
        let stamp = txns.tick();
        for key in touched {
            txns.touch(id, key, stamp);
        }
        debug!(collection = id, ?mode, "collection dropped");
        Ok(())
    }

    fn collection_list(&self, arena: &mut Arena) -> Result<usize> {
        arena.reset();
        arena.offsets.push(0);
        let inner = self.inner.lock();
        for (id, collection) in &inner.collections {
            arena.ids.push(*id);
            arena.bytes.extend_from_slice(collection.name.as_bytes());
            arena.offsets.push(arena.bytes.len() as u32);
        }
        Ok(inner.collections.len())
    }

    fn snapshot_create(&self) -> Result<SnapshotId> {
        let mut inner = self.inner.lock();
        inner.next_snapshot += 1;
        let id = inner.next_snapshot;
        let frozen: Frozen = inner
            .collections
            .iter()
            .map(|(col, c)| (*col, c.data.clone()))
            .collect();
        inner.snapshots.insert(id, frozen);
        debug!(snapshot = id, "snapshot created");
        Ok(id)
    }

    fn snapshot_drop(&self, id: SnapshotId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .snapshots
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| EngineError::args(format!("unknown snapshot {id}")))
    }

    fn snapshot_list(&self, arena: &mut Arena) -> Result<usize> {
        arena.reset();
        let inner = self.inner.lock();
        arena.ids.extend(inner.snapshots.keys().copied());
        Ok(inner.snapshots.len())
    }

    fn txn_begin(&self, options: OpOptions) -> Result<TxnHandle> {
        Ok(self.inner.lock().txns.begin(options))
    }

    fn txn_commit(&self, txn: TxnHandle, _options: OpOptions) -> Result<()> {
        let mut guard = self.inner.lock();
        let Inner { collections, txns, .. } = &mut *guard;
        let state = txns.take_validated(txn)?;
        let stamp = txns.tick();
        for ((col, key), value) in state.writes {
            // A collection dropped mid-transaction has nothing left to
            // publish into.
            if let Some(collection) = collections.get_mut(&col) {
                match value {
                    Some(v) => {
                        collection.data.insert(key, v);
                    }
                    None => {
                        collection.data.remove(&key);
                    }
                }
                txns.touch(col, key, stamp);
            }
        }
        Ok(())
    }

    fn txn_free(&self, txn: TxnHandle) {
        self.inner.lock().txns.free(txn);
    }
}
