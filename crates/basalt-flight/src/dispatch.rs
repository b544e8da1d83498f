//! Endpoint routing: URI + record batch in, engine calls, record batch
//! out.
//!
//! | Verb | Commands |
//! |------|----------|
//! | `DoAction` | `col_open`, `col_drop`, `snap_open`, `snap_drop`, `txn_begin`, `txn_commit` |
//! | `DoGet` | `list_cols`, `list_snaps` |
//! | `DoPut` | `write`, `write_path` |
//! | `DoExchange` | `read`, `read_path`, `match_path`, `scan`, `sample` |
//!
//! Every handler locks the session first and builds its reply from the
//! guard's arena before the guard drops, so response buffers live
//! exactly as long as the slot that owns them.

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use tracing::debug;

use basalt_engine::{
    CollectionId, Engine, EngineError, ReadRequest, Result, SampleRequest,
    ScanRequest, Strided, WriteRequest, MAIN_COLLECTION,
};
use basalt_paths::PathCollection;

use crate::codec;
use crate::session::{ClientId, SessionGuard, SessionId, SessionManager};
use crate::uri::{self, ReadPart, SessionParams};

/// Reply of a `DoAction` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionReply {
    /// A single little-endian `u64` result body.
    Scalar(u64),
    /// A stream yielding zero results.
    Empty,
}

/// Routes parsed commands to the engine through a locked session.
pub struct Dispatcher {
    engine: Arc<dyn Engine>,
    sessions: Arc<SessionManager>,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn Engine>, sessions: Arc<SessionManager>) -> Self {
        Self { engine, sessions }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    fn lock(&self, client: ClientId, params: &SessionParams) -> Result<SessionGuard> {
        self.sessions.lock(SessionId::new(client, params.txn_id))
    }

    // ── DoAction ──────────────────────────────────────────────────────

    pub fn do_action(&self, client: ClientId, uri: &str, body: &[u8]) -> Result<ActionReply> {
        let cmd = uri::parse(uri);
        let params = uri::session_params(&cmd)?;
        debug!(client, verb = cmd.verb(), "action");

        match cmd.verb() {
            "col_open" => {
                let name = params
                    .collection_name
                    .as_deref()
                    .ok_or_else(|| EngineError::args("missing collection name argument"))?;
                let config = std::str::from_utf8(body)
                    .map_err(|_| EngineError::args("collection config must be utf-8"))?
                    .trim_end_matches('\0');
                let id = self.engine.collection_create(name, config)?;
                Ok(ActionReply::Scalar(id))
            }
            "col_drop" => {
                let id = params
                    .collection
                    .ok_or_else(|| EngineError::args("missing collection id argument"))?;
                self.engine.collection_drop(id, params.drop_mode)?;
                Ok(ActionReply::Empty)
            }
            "snap_open" => Ok(ActionReply::Scalar(self.engine.snapshot_create()?)),
            "snap_drop" => {
                let id = params
                    .snapshot
                    .ok_or_else(|| EngineError::args("missing snapshot id argument"))?;
                self.engine.snapshot_drop(id)?;
                Ok(ActionReply::Empty)
            }
            "txn_begin" => {
                // The server picks a random id when the client leaves the
                // choice open; collisions with a live id fail either way.
                let txn_id = if params.txn_id != 0 {
                    params.txn_id
                } else {
                    loop {
                        let candidate: u64 = rand::random();
                        if candidate != 0 {
                            break candidate;
                        }
                    }
                };
                let guard = self
                    .sessions
                    .begin_txn(SessionId::new(client, txn_id), params.options)?;
                drop(guard);
                Ok(ActionReply::Scalar(txn_id))
            }
            "txn_commit" => {
                if params.txn_id == 0 {
                    return Err(EngineError::args("missing transaction id argument"));
                }
                let guard = self.lock(client, &params)?;
                self.sessions.commit(guard, params.options)?;
                Ok(ActionReply::Empty)
            }
            other => Err(EngineError::args(format!("unknown action '{other}'"))),
        }
    }

    // ── DoGet ─────────────────────────────────────────────────────────

    pub fn do_get(&self, client: ClientId, ticket: &str) -> Result<RecordBatch> {
        let cmd = uri::parse(ticket);
        let params = uri::session_params(&cmd)?;
        debug!(client, verb = cmd.verb(), "get");

        let mut guard = self.lock(client, &params)?;
        match cmd.verb() {
            "list_cols" => {
                self.engine.collection_list(guard.arena_mut())?;
                codec::collections_batch(guard.arena_mut())
            }
            "list_snaps" => {
                self.engine.snapshot_list(guard.arena_mut())?;
                codec::snapshots_batch(guard.arena_mut())
            }
            other => Err(EngineError::args(format!("unknown ticket '{other}'"))),
        }
    }

    // ── DoPut ─────────────────────────────────────────────────────────

    pub fn do_put(&self, client: ClientId, command: &str, batch: &RecordBatch) -> Result<()> {
        let cmd = uri::parse(command);
        let params = uri::session_params(&cmd)?;
        let tasks = batch.num_rows();
        debug!(client, verb = cmd.verb(), tasks, "put");

        match cmd.verb() {
            "write" => {
                let keys = codec::key_column(batch, "keys")?;
                let collections = resolve_collections(&params, batch)?;
                let values = codec::values_column(batch, "vals")?;

                let guard = self.lock(client, &params)?;
                self.engine.write(
                    guard.context(params.snapshot, params.options),
                    WriteRequest { collections, keys, values, tasks },
                )
            }
            "write_path" => {
                let paths = codec::string_column(batch, "paths")?;
                let values = codec::values_column(batch, "vals")?;
                let collection = single_collection(&params)?;

                let guard = self.lock(client, &params)?;
                let modality = PathCollection::new(Arc::clone(&self.engine), collection);
                modality.write_paths(
                    guard.context(params.snapshot, params.options),
                    &paths,
                    values.as_ref(),
                )
            }
            other => Err(EngineError::args(format!("unknown put command '{other}'"))),
        }
    }

    // ── DoExchange ────────────────────────────────────────────────────

    pub fn do_exchange(
        &self,
        client: ClientId,
        command: &str,
        batch: &RecordBatch,
    ) -> Result<RecordBatch> {
        let cmd = uri::parse(command);
        let params = uri::session_params(&cmd)?;
        let tasks = batch.num_rows();
        debug!(client, verb = cmd.verb(), tasks, "exchange");

        match cmd.verb() {
            "read" => {
                let keys = codec::key_column(batch, "keys")?;
                let collections = resolve_collections(&params, batch)?;

                let mut guard = self.lock(client, &params)?;
                let ctx = guard.context(params.snapshot, params.options);
                self.engine.read(ctx, ReadRequest { collections, keys, tasks }, guard.arena_mut())?;
                read_reply(&params, &guard, tasks)
            }
            "read_path" => {
                let paths = codec::string_column(batch, "paths")?;
                let collection = single_collection(&params)?;

                let mut guard = self.lock(client, &params)?;
                let ctx = guard.context(params.snapshot, params.options);
                let modality = PathCollection::new(Arc::clone(&self.engine), collection);
                modality.read_paths(ctx, guard.arena_mut(), &paths)?;
                read_reply(&params, &guard, tasks)
            }
            "match_path" => {
                let patterns = codec::string_column(batch, "patterns")?;
                let previous = codec::string_column_opt(batch, "previous")?;
                let limits = codec::limit_column_or(batch, "count_limits", u32::MAX)?;
                let collection = single_collection(&params)?;

                let mut guard = self.lock(client, &params)?;
                let ctx = guard.context(params.snapshot, params.options);
                let modality = PathCollection::new(Arc::clone(&self.engine), collection);
                let matches = modality.match_paths(
                    ctx,
                    guard.arena_mut(),
                    &patterns,
                    previous.as_deref(),
                    limits,
                )?;
                match params.part {
                    ReadPart::Lengths => codec::match_counts_batch(&matches),
                    _ => codec::path_lists_batch(&matches),
                }
            }
            "scan" => {
                let start_keys = codec::key_column(batch, "scan_starts")?;
                let count_limits = codec::limit_column(batch, "count_limits")?;
                let collections = resolve_collections(&params, batch)?;

                let mut guard = self.lock(client, &params)?;
                let ctx = guard.context(params.snapshot, params.options);
                self.engine.scan(
                    ctx,
                    ScanRequest { collections, start_keys, count_limits, tasks },
                    guard.arena_mut(),
                )?;
                codec::key_lists_batch(guard.arena_mut(), "keys")
            }
            "sample" => {
                let count_limits = codec::limit_column(batch, "count_limits")?;
                let collections = resolve_collections(&params, batch)?;

                let mut guard = self.lock(client, &params)?;
                let ctx = guard.context(params.snapshot, params.options);
                self.engine.sample(
                    ctx,
                    SampleRequest { collections, count_limits, tasks },
                    guard.arena_mut(),
                )?;
                codec::key_lists_batch(guard.arena_mut(), "keys")
            }
            other => Err(EngineError::args(format!(
                "unknown exchange command '{other}'"
            ))),
        }
    }
}

/// `col=` parameter broadcast over the batch, else the `cols` column,
/// else the main collection.
fn resolve_collections<'a>(
    params: &SessionParams,
    batch: &'a RecordBatch,
) -> Result<Strided<'a, CollectionId>> {
    if let Some(id) = params.collection {
        return Ok(Strided::Broadcast(id));
    }
    if let Some(cols) = codec::collection_column(batch, "cols")? {
        return Ok(cols);
    }
    Ok(Strided::Broadcast(MAIN_COLLECTION))
}

/// Path endpoints address one collection per call.
fn single_collection(params: &SessionParams) -> Result<CollectionId> {
    Ok(params.collection.unwrap_or(MAIN_COLLECTION))
}

fn read_reply(params: &SessionParams, guard: &SessionGuard, tasks: usize) -> Result<RecordBatch> {
    match params.part {
        ReadPart::Content => codec::values_batch(guard.arena(), tasks),
        ReadPart::Lengths => codec::lengths_batch(guard.arena(), tasks),
        ReadPart::Presences => codec::presences_batch(guard.arena()),
    }
}
