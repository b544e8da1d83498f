//! Transaction bookkeeping shared by the backends.
//!
//! Both backends buffer transactional writes in memory and detect
//! conflicts optimistically: every watched read records the key's
//! committed version, and commit revalidates those versions under the
//! backend's write lock before publishing the write set.

use std::collections::{BTreeMap, HashMap};

use crate::error::{EngineError, Result};
use crate::types::{CollectionId, Key, OpOptions, TxnHandle};

pub(crate) type ColKey = (CollectionId, Key);

/// Buffered state of one live transaction.
#[derive(Debug, Default)]
pub(crate) struct TxnState {
    /// Key → value, `None` marking a buffered deletion.
    pub writes: BTreeMap<ColKey, Option<Vec<u8>>>,
    /// Key → committed version observed when the key was read.
    pub watches: HashMap<ColKey, u64>,
    /// Transaction-wide opt-out recorded at begin.
    pub dont_watch: bool,
}

/// Registry of live transactions plus the committed-version table used
/// for conflict detection.
#[derive(Debug, Default)]
pub(crate) struct TxnTable {
    txns: HashMap<u64, TxnState>,
    versions: HashMap<ColKey, u64>,
    next_handle: u64,
    clock: u64,
}

impl TxnTable {
    pub fn begin(&mut self, options: OpOptions) -> TxnHandle {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.txns.insert(
            handle,
            TxnState { dont_watch: options.dont_watch, ..TxnState::default() },
        );
        TxnHandle(handle)
    }

    pub fn free(&mut self, txn: TxnHandle) {
        self.txns.remove(&txn.0);
    }

    pub fn state(&self, txn: TxnHandle) -> Result<&TxnState> {
        self.txns
            .get(&txn.0)
            .ok_or_else(|| EngineError::args("unknown transaction handle"))
    }

    pub fn state_mut(&mut self, txn: TxnHandle) -> Result<&mut TxnState> {
        self.txns
            .get_mut(&txn.0)
            .ok_or_else(|| EngineError::args("unknown transaction handle"))
    }

    /// Transactional lookup: records a watch (unless opted out) and
    /// returns the transaction's own buffered write for the key, if any.
    pub fn observe(
        &mut self,
        txn: TxnHandle,
        col: CollectionId,
        key: Key,
        options: OpOptions,
    ) -> Result<Option<Option<Vec<u8>>>> {
        let version = self.version(col, key);
        let state = self.state_mut(txn)?;
        if !state.dont_watch && !options.dont_watch {
            state.watches.entry((col, key)).or_insert(version);
        }
        Ok(state.writes.get(&(col, key)).cloned())
    }

    /// Remove the transaction and validate its watch set. On conflict the
    /// state is discarded and `ConflictingWrite` returned; a failed
    /// commit never leaves a usable transaction behind.
    pub fn take_validated(&mut self, txn: TxnHandle) -> Result<TxnState> {
        let state = self
            .txns
            .remove(&txn.0)
            .ok_or_else(|| EngineError::args("unknown transaction handle"))?;
        for (&(col, key), &seen) in &state.watches {
            if self.version(col, key) != seen {
                return Err(EngineError::ConflictingWrite);
            }
        }
        Ok(state)
    }

    /// Committed version of a key; never-written keys report 0.
    pub fn version(&self, col: CollectionId, key: Key) -> u64 {
        self.versions.get(&(col, key)).copied().unwrap_or(0)
    }

    /// Advance the commit clock and return the new stamp.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Record that `key` was overwritten at `stamp`.
    pub fn touch(&mut self, col: CollectionId, key: Key, stamp: u64) {
        self.versions.insert((col, key), stamp);
    }
}
