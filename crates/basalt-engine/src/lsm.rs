//! Persistent LSM-tree engine backend.
//!
//! Backed by RocksDB with one column family per collection plus a `meta`
//! column family holding the collection catalog. Keys are stored
//! big-endian with the sign bit flipped so the byte order of the tree
//! matches the numeric order of [`Key`].
//!
//! Transactions reuse the optimistic bookkeeping from [`crate::txn`]:
//! writes are buffered in memory and published as a single RocksDB
//! `WriteBatch` at commit. The committed-version table lives in memory,
//! so watch conflicts are detected within a process lifetime only.
//! Snapshots are not supported by this backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, Direction,
    IteratorMode, MultiThreaded, Options, WriteBatch,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::arena::Arena;
use crate::engine::{Engine, ReadRequest, SampleRequest, ScanRequest, WriteRequest};
use crate::error::{EngineError, Result};
use crate::txn::TxnTable;
use crate::types::{
    bitmap_bytes, CallContext, CollectionId, DropMode, Key, OpOptions,
    SnapshotId, TxnHandle, MAIN_COLLECTION,
};

type Db = DBWithThreadMode<MultiThreaded>;

const CF_MAIN: &str = "default";
const CF_META: &str = "meta";
const CATALOG_KEY: &[u8] = b"catalog";

const SIGN_FLIP: u64 = 1 << 63;

fn encode_key(key: Key) -> [u8; 8] {
    ((key as u64) ^ SIGN_FLIP).to_be_bytes()
}

fn decode_key(bytes: &[u8]) -> Result<Key> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| EngineError::engine("malformed key in column family"))?;
    Ok((u64::from_be_bytes(raw) ^ SIGN_FLIP) as Key)
}

fn storage_err(e: rocksdb::Error) -> EngineError {
    EngineError::engine(e.to_string())
}

fn no_snapshots() -> EngineError {
    EngineError::engine("snapshots are not supported by the lsm backend")
}

/// Collection catalog persisted in the `meta` column family.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Catalog {
    next_collection: CollectionId,
    /// `(id, name)` for every named collection; main is implicit.
    collections: Vec<(CollectionId, String)>,
}

struct LsmState {
    names: HashMap<String, CollectionId>,
    cf_names: HashMap<CollectionId, String>,
    next_collection: CollectionId,
    txns: TxnTable,
}

/// RocksDB-backed engine.
pub struct LsmEngine {
    db: Db,
    state: Mutex<LsmState>,
}

impl LsmEngine {
    /// Open (or create) the database under `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut cf_names = Db::list_cf(&Options::default(), path).unwrap_or_default();
        for required in [CF_MAIN, CF_META] {
            if !cf_names.iter().any(|n| n == required) {
                cf_names.push(required.to_owned());
            }
        }
        let descriptors: Vec<ColumnFamilyDescriptor> = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&opts, path, descriptors).map_err(storage_err)?;

        let catalog = {
            let meta = db
                .cf_handle(CF_META)
                .ok_or_else(|| EngineError::engine("meta column family missing"))?;
            match db.get_cf(&meta, CATALOG_KEY).map_err(storage_err)? {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map_err(|e| EngineError::engine(format!("corrupt catalog: {e}")))?,
                None => Catalog::default(),
            }
        };

        let mut names = HashMap::new();
        let mut ids = HashMap::new();
        names.insert(String::new(), MAIN_COLLECTION);
        ids.insert(MAIN_COLLECTION, CF_MAIN.to_owned());
        for (id, name) in &catalog.collections {
            names.insert(name.clone(), *id);
            ids.insert(*id, format!("c{id}"));
        }

        info!(
            path = %path.display(),
            collections = catalog.collections.len() + 1,
            "lsm engine opened"
        );
        Ok(Self {
            db,
            state: Mutex::new(LsmState {
                names,
                cf_names: ids,
                next_collection: catalog.next_collection,
                txns: TxnTable::default(),
            }),
        })
    }

    fn handle(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| EngineError::engine(format!("missing column family '{name}'")))
    }

    fn persist_catalog(&self, state: &LsmState) -> Result<()> {
        let catalog = Catalog {
            next_collection: state.next_collection,
            collections: state
                .names
                .iter()
                .filter(|(name, _)| !name.is_empty())
                .map(|(name, id)| (*id, name.clone()))
                .collect(),
        };
        let bytes = serde_json::to_vec(&catalog)
            .map_err(|e| EngineError::engine(format!("serialize catalog: {e}")))?;
        let meta = self.handle(CF_META)?;
        self.db.put_cf(&meta, CATALOG_KEY, bytes).map_err(storage_err)
    }
}

impl Engine for LsmEngine {
    fn read(&self, ctx: CallContext, req: ReadRequest<'_>, arena: &mut Arena) -> Result<()> {
        if ctx.snapshot.is_some() {
            return Err(no_snapshots());
        }
        arena.reset();
        arena.presences.resize(bitmap_bytes(req.tasks), 0);
        arena.offsets.push(0);

        let mut state = self.state.lock();
        for i in 0..req.tasks {
            let col = req.collections.get(i);
            let key = req.keys.get(i);
            let cf_name = state
                .cf_names
                .get(&col)
                .ok_or_else(|| EngineError::args(format!("unknown collection {col}")))?
                .clone();

            let buffered = match ctx.txn {
                Some(txn) => state.txns.observe(txn, col, key, ctx.options)?,
                None => None,
            };
            match buffered {
                Some(own) => arena.push_value(i, own.as_deref()),
                None => {
                    let cf = self.handle(&cf_name)?;
                    let found = self.db.get_cf(&cf, encode_key(key)).map_err(storage_err)?;
                    arena.push_value(i, found.as_deref());
                }
            }
        }
        Ok(())
    }

    fn write(&self, ctx: CallContext, req: WriteRequest<'_>) -> Result<()> {
        if ctx.snapshot.is_some() {
            return Err(EngineError::args("writes cannot target a snapshot"));
        }
        let mut state = self.state.lock();
        for i in 0..req.tasks {
            let col = req.collections.get(i);
            if !state.cf_names.contains_key(&col) {
                return Err(EngineError::args(format!("unknown collection {col}")));
            }
        }

        match ctx.txn {
            Some(txn) => {
                let txn_state = state.txns.state_mut(txn)?;
                for i in 0..req.tasks {
                    let value = req.values.as_ref().and_then(|v| v.get(i));
                    txn_state
                        .writes
                        .insert((req.collections.get(i), req.keys.get(i)), value.map(<[u8]>::to_vec));
                }
            }
            None => {
                let mut batch = WriteBatch::default();
                for i in 0..req.tasks {
                    let col = req.collections.get(i);
                    let cf_name = state
                        .cf_names
                        .get(&col)
                        .ok_or_else(|| EngineError::args(format!("unknown collection {col}")))?;
                    let cf = self.handle(cf_name)?;
                    match req.values.as_ref().and_then(|v| v.get(i)) {
                        Some(value) => batch.put_cf(&cf, encode_key(req.keys.get(i)), value),
                        None => batch.delete_cf(&cf, encode_key(req.keys.get(i))),
                    }
                }
                self.db.write(batch).map_err(storage_err)?;
                if ctx.options.flush {
                    self.db.flush().map_err(storage_err)?;
                }
                let stamp = state.txns.tick();
                for i in 0..req.tasks {
                    state.txns.touch(req.collections.get(i), req.keys.get(i), stamp);
                }
            }
        }
        Ok(())
    }

    fn scan(&self, ctx: CallContext, req: ScanRequest<'_>, arena: &mut Arena) -> Result<()> {
        if ctx.snapshot.is_some() {
            return Err(no_snapshots());
        }
        arena.reset();
        arena.offsets.push(0);

        let state = self.state.lock();
        for i in 0..req.tasks {
            let col = req.collections.get(i);
            let start = req.start_keys.get(i);
            let limit = req.count_limits.get(i) as usize;
            let cf_name = state
                .cf_names
                .get(&col)
                .ok_or_else(|| EngineError::args(format!("unknown collection {col}")))?;
            let cf = self.handle(cf_name)?;

            let start_bytes = encode_key(start);
            let mut committed = self
                .db
                .iterator_cf(&cf, IteratorMode::From(&start_bytes, Direction::Forward))
                .peekable();
            let mut overlay = match ctx.txn {
                Some(txn) => Some(
                    state
                        .txns
                        .state(txn)?
                        .writes
                        .range((col, start)..=(col, Key::MAX))
                        .map(|((_, k), v)| (*k, v.is_some()))
                        .peekable(),
                ),
                None => None,
            };

            let mut count = 0u32;
            while (count as usize) < limit {
                let next_committed = match committed.peek() {
                    Some(Ok((bytes, _))) => Some(decode_key(bytes)?),
                    Some(Err(e)) => return Err(EngineError::engine(e.to_string())),
                    None => None,
                };
                let next_overlay = overlay.as_mut().and_then(|o| o.peek().copied());

                let next = match (next_committed, next_overlay) {
                    (None, None) => break,
                    (Some(ck), None) => {
                        committed.next();
                        Some(ck)
                    }
                    (None, Some((ok, present))) => {
                        if let Some(o) = overlay.as_mut() {
                            o.next();
                        }
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
                            if let Some(o) = overlay.as_mut() {
                                o.next();
                            }
                            present.then_some(ok)
                        }
                    }
                };
                if let Some(key) = next {
                    arena.keys.push(key);
                    count += 1;
                }
            }
            arena.counts.push(count);
            arena.offsets.push(arena.keys.len() as u32);
        }
        Ok(())
    }

    fn sample(&self, ctx: CallContext, req: SampleRequest<'_>, arena: &mut Arena) -> Result<()> {
        if ctx.snapshot.is_some() {
            return Err(no_snapshots());
        }
        arena.reset();
        arena.offsets.push(0);

        let state = self.state.lock();
        let mut rng = rand::thread_rng();
        for i in 0..req.tasks {
            let col = req.collections.get(i);
            let limit = req.count_limits.get(i) as usize;
            let cf_name = state
                .cf_names
                .get(&col)
                .ok_or_else(|| EngineError::args(format!("unknown collection {col}")))?;
            let cf = self.handle(cf_name)?;

            // Reservoir sampling over one full pass of the family.
            let mut reservoir: Vec<Key> = Vec::new();
            for (seen, item) in self.db.iterator_cf(&cf, IteratorMode::Start).enumerate() {
                let (bytes, _) = item.map_err(storage_err)?;
                let key = decode_key(&bytes)?;
                if reservoir.len() < limit {
                    reservoir.push(key);
                } else {
                    let slot = rng.gen_range(0..=seen);
                    if slot < limit {
                        reservoir[slot] = key;
                    }
                }
            }
            arena.counts.push(reservoir.len() as u32);
            arena.keys.extend_from_slice(&reservoir);
            arena.offsets.push(arena.keys.len() as u32);
        }
        Ok(())
    }

    fn collection_create(&self, name: &str, config: &str) -> Result<CollectionId> {
        if name.is_empty() {
            return Ok(MAIN_COLLECTION);
        }
        let mut state = self.state.lock();
        if let Some(id) = state.names.get(name) {
            return Ok(*id);
        }
        state.next_collection += 1;
        let id = state.next_collection;
        let cf_name = format!("c{id}");
        self.db
            .create_cf(&cf_name, &Options::default())
            .map_err(storage_err)?;
        state.names.insert(name.to_owned(), id);
        state.cf_names.insert(id, cf_name);
        self.persist_catalog(&state)?;
        debug!(collection = name, id, config, "collection created");
        Ok(id)
    }

    fn collection_drop(&self, id: CollectionId, mode: DropMode) -> Result<()> {
        let mut state = self.state.lock();
        let cf_name = state
            .cf_names
            .get(&id)
            .ok_or_else(|| EngineError::args(format!("unknown collection {id}")))?
            .clone();
        if id == MAIN_COLLECTION && mode == DropMode::Handle {
            return Err(EngineError::args("cannot drop the main collection"));
        }

        let cf = self.handle(&cf_name)?;
        let mut touched = Vec::new();
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (bytes, _) = item.map_err(storage_err)?;
            touched.push(decode_key(&bytes)?);
            match mode {
                DropMode::Values => batch.put_cf(&cf, &bytes, []),
                DropMode::Contents => batch.delete_cf(&cf, &bytes),
                DropMode::Handle => {}
            }
        }
        match mode {
            DropMode::Handle => {
                drop(cf);
                self.db.drop_cf(&cf_name).map_err(storage_err)?;
                state.cf_names.remove(&id);
                state.names.retain(|_, v| *v != id);
                self.persist_catalog(&state)?;
            }
            _ => {
                self.db.write(batch).map_err(storage_err)?;
            }
        }

        let stamp = state.txns.tick();
        for key in touched {
            state.txns.touch(id, key, stamp);
        }
        debug!(collection = id, ?mode, "collection dropped");
        Ok(())
    }

    fn collection_list(&self, arena: &mut Arena) -> Result<usize> {
        arena.reset();
        arena.offsets.push(0);
        let state = self.state.lock();
        let mut listing: Vec<(CollectionId, &str)> = state
            .names
            .iter()
            .map(|(name, id)| (*id, name.as_str()))
            .collect();
        listing.sort_by_key(|(id, _)| *id);
        for (id, name) in &listing {
            arena.ids.push(*id);
            arena.bytes.extend_from_slice(name.as_bytes());
            arena.offsets.push(arena.bytes.len() as u32);
        }
        Ok(listing.len())
    }

    fn snapshot_create(&self) -> Result<SnapshotId> {
        Err(no_snapshots())
    }

    fn snapshot_drop(&self, _id: SnapshotId) -> Result<()> {
        Err(no_snapshots())
    }

    fn snapshot_list(&self, arena: &mut Arena) -> Result<usize> {
        arena.reset();
        Ok(0)
    }

    fn txn_begin(&self, options: OpOptions) -> Result<TxnHandle> {
        Ok(self.state.lock().txns.begin(options))
    }

    fn txn_commit(&self, txn: TxnHandle, options: OpOptions) -> Result<()> {
        let mut state = self.state.lock();
        let txn_state = state.txns.take_validated(txn)?;

        let mut batch = WriteBatch::default();
        let mut touched = Vec::with_capacity(txn_state.writes.len());
        for ((col, key), value) in txn_state.writes {
            // A collection dropped mid-transaction has nothing left to
            // publish into.
            let Some(cf_name) = state.cf_names.get(&col) else { continue };
            let cf = self.handle(cf_name)?;
            match value {
                Some(v) => batch.put_cf(&cf, encode_key(key), v),
                None => batch.delete_cf(&cf, encode_key(key)),
            }
            touched.push((col, key));
        }
        self.db.write(batch).map_err(storage_err)?;
        if options.flush {
            self.db.flush().map_err(storage_err)?;
        }

        let stamp = state.txns.tick();
        for (col, key) in touched {
            state.txns.touch(col, key, stamp);
        }
        Ok(())
    }

    fn txn_free(&self, txn: TxnHandle) {
        self.state.lock().txns.free(txn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Strided, ValuesView};
    use tempfile::TempDir;

    fn open_temp() -> (LsmEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let engine = LsmEngine::open(dir.path()).unwrap();
        (engine, dir)
    }

    fn put(engine: &LsmEngine, ctx: CallContext, col: CollectionId, pairs: &[(Key, &[u8])]) {
        let keys: Vec<Key> = pairs.iter().map(|(k, _)| *k).collect();
        let mut offsets = vec![0i32];
        let mut bytes = Vec::new();
        for (_, v) in pairs {
            bytes.extend_from_slice(v);
            offsets.push(bytes.len() as i32);
        }
        let values = ValuesView::new(&offsets, &bytes, None).unwrap();
        engine
            .write(
                ctx,
                WriteRequest {
                    collections: Strided::Broadcast(col),
                    keys: Strided::Slice(&keys),
                    values: Some(values),
                    tasks: keys.len(),
                },
            )
            .unwrap();
    }

    fn get(engine: &LsmEngine, ctx: CallContext, col: CollectionId, keys: &[Key]) -> Vec<Option<Vec<u8>>> {
        let mut arena = Arena::new();
        engine
            .read(
                ctx,
                ReadRequest {
                    collections: Strided::Broadcast(col),
                    keys: Strided::Slice(keys),
                    tasks: keys.len(),
                },
                &mut arena,
            )
            .unwrap();
        (0..keys.len()).map(|i| arena.value(i).map(<[u8]>::to_vec)).collect()
    }

    #[test]
    fn key_encoding_preserves_order() {
        let keys = [Key::MIN, -100, -1, 0, 1, 100, Key::MAX];
        let encoded: Vec<[u8; 8]> = keys.iter().map(|k| encode_key(*k)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        for k in keys {
            assert_eq!(decode_key(&encode_key(k)).unwrap(), k);
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let (engine, _dir) = open_temp();
        let ctx = CallContext::plain();
        put(&engine, ctx, MAIN_COLLECTION, &[(34, b"X"), (35, b"Y")]);
        assert_eq!(
            get(&engine, ctx, MAIN_COLLECTION, &[34, 35, 36]),
            vec![Some(b"X".to_vec()), Some(b"Y".to_vec()), None]
        );
    }

    #[test]
    fn scan_returns_numeric_order_across_signs() {
        let (engine, _dir) = open_temp();
        let ctx = CallContext::plain();
        put(&engine, ctx, MAIN_COLLECTION, &[(5, b"a"), (-3, b"b"), (0, b"c"), (-80, b"d")]);

        let mut arena = Arena::new();
        engine
            .scan(
                ctx,
                ScanRequest {
                    collections: Strided::Broadcast(MAIN_COLLECTION),
                    start_keys: Strided::Broadcast(Key::MIN),
                    count_limits: Strided::Broadcast(10),
                    tasks: 1,
                },
                &mut arena,
            )
            .unwrap();
        assert_eq!(arena.task_keys(0), &[-80, -3, 0, 5]);
    }

    #[test]
    fn named_collections_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id;
        {
            let engine = LsmEngine::open(dir.path()).unwrap();
            id = engine.collection_create("events", "").unwrap();
            put(&engine, CallContext::plain(), id, &[(1, b"payload")]);
        }
        {
            let engine = LsmEngine::open(dir.path()).unwrap();
            assert_eq!(engine.collection_create("events", "").unwrap(), id);
            assert_eq!(
                get(&engine, CallContext::plain(), id, &[1]),
                vec![Some(b"payload".to_vec())]
            );
        }
    }

    #[test]
    fn transaction_commit_publishes_batch() {
        let (engine, _dir) = open_temp();
        let txn = engine.txn_begin(OpOptions::default()).unwrap();
        put(&engine, CallContext::with_txn(txn), MAIN_COLLECTION, &[(7, b"x"), (8, b"y")]);
        assert_eq!(
            get(&engine, CallContext::plain(), MAIN_COLLECTION, &[7, 8]),
            vec![None, None]
        );
        engine.txn_commit(txn, OpOptions::default()).unwrap();
        assert_eq!(
            get(&engine, CallContext::plain(), MAIN_COLLECTION, &[7, 8]),
            vec![Some(b"x".to_vec()), Some(b"y".to_vec())]
        );
    }

    #[test]
    fn watched_read_conflicts_with_later_write() {
        let (engine, _dir) = open_temp();
        let ctx = CallContext::plain();
        put(&engine, ctx, MAIN_COLLECTION, &[(10, b"v0")]);

        let txn = engine.txn_begin(OpOptions::default()).unwrap();
        get(&engine, CallContext::with_txn(txn), MAIN_COLLECTION, &[10]);
        put(&engine, ctx, MAIN_COLLECTION, &[(10, b"v1")]);

        assert!(matches!(
            engine.txn_commit(txn, OpOptions::default()),
            Err(EngineError::ConflictingWrite)
        ));
    }

    #[test]
    fn drop_contents_and_handle() {
        let (engine, _dir) = open_temp();
        let ctx = CallContext::plain();
        let col = engine.collection_create("tmp", "").unwrap();
        put(&engine, ctx, col, &[(1, b"a"), (2, b"b")]);

        engine.collection_drop(col, DropMode::Contents).unwrap();
        assert_eq!(get(&engine, ctx, col, &[1, 2]), vec![None, None]);

        engine.collection_drop(col, DropMode::Handle).unwrap();
        let mut arena = Arena::new();
        assert_eq!(engine.collection_list(&mut arena).unwrap(), 1);
    }

    #[test]
    fn snapshots_are_rejected() {
        let (engine, _dir) = open_temp();
        assert!(matches!(engine.snapshot_create(), Err(EngineError::EngineFailure(_))));
    }
}
