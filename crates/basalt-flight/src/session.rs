//! Session, arena and transaction slot management.
//!
//! A *session* is the pair `(client id, transaction id)`; transaction id
//! zero marks the transient session of a single non-transactional call.
//! The manager owns a bounded pool of arenas (capacity = maximum live
//! sessions) and an `active` table of held transactions. Idle
//! transactional sessions are evicted LRU once the pool runs dry, so a
//! client that goes mute cannot pin memory or transaction slots forever.
//!
//! Locking a session yields a [`SessionGuard`], a move-only handle whose
//! drop returns everything it borrowed: transactional guards re-insert
//! their `(txn, arena)` slot into the active table, plain guards hand the
//! arena back to the free pool. Client disconnects mid-call therefore
//! leak nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use basalt_engine::{
    Arena, CallContext, Engine, EngineError, OpOptions, Result, SnapshotId,
    TxnHandle,
};

/// Hash of the peer address, identifying one client.
pub type ClientId = u64;

/// Index of an active resource slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub client: ClientId,
    /// `0` denotes "no transaction".
    pub txn_id: u64,
}

impl SessionId {
    pub fn new(client: ClientId, txn_id: u64) -> Self {
        Self { client, txn_id }
    }

    pub fn is_txn(&self) -> bool {
        self.txn_id != 0
    }
}

/// Pool sizing and eviction policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum concurrently live sessions (arenas in circulation).
    pub capacity: usize,
    /// Minimum idle age before a held transaction may be evicted.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        // The 30s idle cut-off matches what mainstream servers use for
        // abandoned sessions.
        Self { capacity: 4096, idle_timeout: Duration::from_secs(30) }
    }
}

struct ActiveSession {
    /// Present while the session is idle; taken by the guard while a
    /// call executes.
    slot: Option<(TxnHandle, Arena)>,
    last_access: Instant,
    executing: bool,
}

struct PoolState {
    free_arenas: Vec<Arena>,
    active: HashMap<SessionId, ActiveSession>,
}

/// Bounded pool of `(arena, transaction)` slots keyed by session id.
pub struct SessionManager {
    engine: Arc<dyn Engine>,
    config: SessionConfig,
    state: Mutex<PoolState>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn Engine>, config: SessionConfig) -> Arc<Self> {
        let free_arenas = (0..config.capacity).map(|_| Arena::new()).collect();
        Arc::new(Self {
            engine,
            config,
            state: Mutex::new(PoolState { free_arenas, active: HashMap::new() }),
        })
    }

    /// Arenas currently in the free pool (observability hook).
    pub fn available(&self) -> usize {
        self.state.lock().free_arenas.len()
    }

    /// Lock a session for one call.
    ///
    /// Transactional ids must refer to a held transaction: unknown ids
    /// fail (`ArgsWrong`, the transaction was committed or evicted), and
    /// ids currently executing another call fail (`ArgsWrong`, a
    /// transaction is single-threaded by contract).
    pub fn lock(self: &Arc<Self>, id: SessionId) -> Result<SessionGuard> {
        let mut state = self.state.lock();
        if id.is_txn() {
            let entry = state.active.get_mut(&id).ok_or_else(|| {
                EngineError::args("transaction was terminated, start a new one")
            })?;
            let Some((txn, arena)) = entry.slot.take() else {
                return Err(EngineError::args(
                    "transaction cannot be used by concurrent calls",
                ));
            };
            entry.executing = true;
            entry.last_access = Instant::now();
            Ok(SessionGuard::new(Arc::clone(self), id, Some(txn), arena))
        } else {
            let arena = self.take_arena(&mut state)?;
            Ok(SessionGuard::new(Arc::clone(self), id, None, arena))
        }
    }

    /// Open a transaction under `id` and return its executing guard.
    /// Fails when the id is already in use; client-chosen ids collide
    /// at their owner's risk.
    pub fn begin_txn(self: &Arc<Self>, id: SessionId, options: OpOptions) -> Result<SessionGuard> {
        if !id.is_txn() {
            return Err(EngineError::args("transaction id must be non-zero"));
        }
        let arena = {
            let mut state = self.state.lock();
            if state.active.contains_key(&id) {
                return Err(EngineError::args(
                    "such a transaction is already running, continue using it",
                ));
            }
            let arena = self.take_arena(&mut state)?;
            // Reserve the id before releasing the mutex; the placeholder
            // rejects concurrent use until the guard drops.
            state.active.insert(
                id,
                ActiveSession { slot: None, last_access: Instant::now(), executing: true },
            );
            arena
        };

        match self.engine.txn_begin(options) {
            Ok(txn) => {
                debug!(client = id.client, txn_id = id.txn_id, "transaction started");
                Ok(SessionGuard::new(Arc::clone(self), id, Some(txn), arena))
            }
            Err(e) => {
                let mut state = self.state.lock();
                state.active.remove(&id);
                state.free_arenas.push(arena);
                Err(e)
            }
        }
    }

    /// Commit the guard's transaction. The slot is recycled on success
    /// and on failure alike; a failed commit leaves no usable
    /// transaction behind.
    pub fn commit(&self, guard: SessionGuard, options: OpOptions) -> Result<()> {
        let (id, txn, mut arena) = guard.dissolve();
        let txn = txn.ok_or_else(|| EngineError::args("session holds no transaction"))?;
        let result = self.engine.txn_commit(txn, options);

        let mut state = self.state.lock();
        state.active.remove(&id);
        arena.reset();
        state.free_arenas.push(arena);
        debug!(
            client = id.client,
            txn_id = id.txn_id,
            ok = result.is_ok(),
            "transaction finished"
        );
        result
    }

    // ── Pool internals ────────────────────────────────────────────────

    fn take_arena(&self, state: &mut PoolState) -> Result<Arena> {
        if let Some(arena) = state.free_arenas.pop() {
            return Ok(arena);
        }
        self.evict(state)
    }

    /// Evict the least-recently-used *idle* session. Entries executing a
    /// call are never candidates; a pool of executing sessions, or one
    /// whose oldest idle entry is still fresh, is genuine overload.
    fn evict(&self, state: &mut PoolState) -> Result<Arena> {
        let overload = || EngineError::Unknown("too many concurrent sessions".to_owned());
        let oldest = state
            .active
            .iter()
            .filter(|(_, s)| !s.executing && s.slot.is_some())
            .min_by_key(|(_, s)| s.last_access)
            .map(|(id, s)| (*id, s.last_access));
        let Some((id, last_access)) = oldest else { return Err(overload()) };
        if last_access.elapsed() < self.config.idle_timeout {
            return Err(overload());
        }

        let Some(entry) = state.active.remove(&id) else { return Err(overload()) };
        let Some((txn, mut arena)) = entry.slot else { return Err(overload()) };
        self.engine.txn_free(txn);
        arena.reset();
        warn!(client = id.client, txn_id = id.txn_id, "evicted idle transaction");
        Ok(arena)
    }

    fn hold(&self, id: SessionId, txn: TxnHandle, arena: Arena) {
        let mut state = self.state.lock();
        let entry = state.active.entry(id).or_insert(ActiveSession {
            slot: None,
            last_access: Instant::now(),
            executing: false,
        });
        entry.slot = Some((txn, arena));
        entry.executing = false;
        entry.last_access = Instant::now();
    }

    fn release(&self, mut arena: Arena) {
        arena.reset();
        self.state.lock().free_arenas.push(arena);
    }
}

/// Scoped lock over one session's resources.
///
/// Holds the arena (and transaction handle, when transactional) for the
/// duration of a call. Dropping the guard returns the resources to the
/// manager; [`SessionManager::commit`] consumes it instead.
pub struct SessionGuard {
    manager: Arc<SessionManager>,
    id: SessionId,
    txn: Option<TxnHandle>,
    arena: Arena,
    released: bool,
}

impl SessionGuard {
    fn new(manager: Arc<SessionManager>, id: SessionId, txn: Option<TxnHandle>, arena: Arena) -> Self {
        Self { manager, id, txn, arena, released: false }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn txn(&self) -> Option<TxnHandle> {
        self.txn
    }

    pub fn arena(&self) -> &Arena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena {
        &mut self.arena
    }

    /// Call context for this session with per-call additions.
    pub fn context(&self, snapshot: Option<SnapshotId>, options: OpOptions) -> CallContext {
        CallContext { txn: self.txn, snapshot, options }
    }

    /// Take the resources out, defusing the drop handler.
    fn dissolve(mut self) -> (SessionId, Option<TxnHandle>, Arena) {
        self.released = true;
        (self.id, self.txn.take(), std::mem::take(&mut self.arena))
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let arena = std::mem::take(&mut self.arena);
        match self.txn.take() {
            Some(txn) => self.manager.hold(self.id, txn, arena),
            None => self.manager.release(arena),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_engine::MemEngine;

    fn manager(capacity: usize, idle_timeout: Duration) -> Arc<SessionManager> {
        let engine: Arc<dyn Engine> = Arc::new(MemEngine::new());
        SessionManager::new(engine, SessionConfig { capacity, idle_timeout })
    }

    fn session(txn_id: u64) -> SessionId {
        SessionId::new(1, txn_id)
    }

    #[test]
    fn plain_guard_returns_arena_on_drop() {
        let mgr = manager(2, Duration::ZERO);
        assert_eq!(mgr.available(), 2);
        {
            let _guard = mgr.lock(session(0)).unwrap();
            assert_eq!(mgr.available(), 1);
        }
        assert_eq!(mgr.available(), 2);
    }

    #[test]
    fn txn_lifecycle_holds_and_frees_the_slot() {
        let mgr = manager(2, Duration::ZERO);
        let guard = mgr.begin_txn(session(7), OpOptions::default()).unwrap();
        assert_eq!(mgr.available(), 1);
        drop(guard);
        // Held, not freed: the arena stays with the transaction.
        assert_eq!(mgr.available(), 1);

        let guard = mgr.lock(session(7)).unwrap();
        mgr.commit(guard, OpOptions::default()).unwrap();
        assert_eq!(mgr.available(), 2);

        // The id is gone after commit.
        let err = mgr.lock(session(7)).unwrap_err();
        assert!(err.to_string().contains("terminated"), "{err}");
    }

    #[test]
    fn duplicate_begin_is_rejected() {
        let mgr = manager(4, Duration::ZERO);
        let _guard = mgr.begin_txn(session(7), OpOptions::default()).unwrap();
        assert!(mgr.begin_txn(session(7), OpOptions::default()).is_err());
    }

    #[test]
    fn concurrent_use_of_one_txn_is_rejected() {
        let mgr = manager(4, Duration::ZERO);
        let first = mgr.begin_txn(session(7), OpOptions::default()).unwrap();
        let err = mgr.lock(session(7)).unwrap_err();
        assert!(err.to_string().contains("concurrent"), "{err}");
        drop(first);
        assert!(mgr.lock(session(7)).is_ok());
    }

    #[test]
    fn lru_eviction_terminates_the_oldest_idle_txn() {
        let mgr = manager(2, Duration::ZERO);
        drop(mgr.begin_txn(session(1), OpOptions::default()).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        drop(mgr.begin_txn(session(2), OpOptions::default()).unwrap());
        std::thread::sleep(Duration::from_millis(5));

        // Pool exhausted: the third transaction evicts the oldest.
        drop(mgr.begin_txn(session(3), OpOptions::default()).unwrap());

        let err = mgr.lock(session(1)).unwrap_err();
        assert!(err.to_string().contains("terminated"), "{err}");
        assert!(mgr.lock(session(2)).is_ok());
        assert!(mgr.lock(session(3)).is_ok());
    }

    #[test]
    fn executing_sessions_are_never_evicted() {
        let mgr = manager(1, Duration::ZERO);
        let _busy = mgr.begin_txn(session(1), OpOptions::default()).unwrap();
        let err = mgr.begin_txn(session(2), OpOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::Unknown(_)), "{err}");
        assert!(err.to_string().contains("too many"), "{err}");
    }

    #[test]
    fn fresh_sessions_are_not_evicted_before_the_idle_timeout() {
        let mgr = manager(1, Duration::from_secs(3600));
        drop(mgr.begin_txn(session(1), OpOptions::default()).unwrap());
        let err = mgr.begin_txn(session(2), OpOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::Unknown(_)), "{err}");
        // The survivor is still usable.
        assert!(mgr.lock(session(1)).is_ok());
    }

    #[test]
    fn zero_txn_id_cannot_begin() {
        let mgr = manager(1, Duration::ZERO);
        assert!(mgr.begin_txn(session(0), OpOptions::default()).is_err());
    }

    #[test]
    fn failed_commit_still_recycles_the_slot() {
        use basalt_engine::{CallContext, ReadRequest, Strided, ValuesView, WriteRequest};

        let engine: Arc<dyn Engine> = Arc::new(MemEngine::new());
        let mgr = SessionManager::new(
            Arc::clone(&engine),
            SessionConfig { capacity: 2, idle_timeout: Duration::ZERO },
        );

        let put = |value: &[u8]| {
            let offsets = [0i32, value.len() as i32];
            let view = ValuesView::new(&offsets, value, None).unwrap();
            engine
                .write(
                    CallContext::plain(),
                    WriteRequest {
                        collections: Strided::Broadcast(0),
                        keys: Strided::Slice(&[5]),
                        values: Some(view),
                        tasks: 1,
                    },
                )
                .unwrap();
        };
        put(b"v0");

        // The transaction watches key 5, then another writer overwrites
        // it before commit.
        let mut guard = mgr.begin_txn(session(9), OpOptions::default()).unwrap();
        let ctx = guard.context(None, OpOptions::default());
        engine
            .read(
                ctx,
                ReadRequest {
                    collections: Strided::Broadcast(0),
                    keys: Strided::Slice(&[5]),
                    tasks: 1,
                },
                guard.arena_mut(),
            )
            .unwrap();
        put(b"v1");

        let err = mgr.commit(guard, OpOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::ConflictingWrite));
        // Slot recycled regardless; the id is gone.
        assert_eq!(mgr.available(), 2);
        assert!(mgr.lock(session(9)).is_err());
    }
}
