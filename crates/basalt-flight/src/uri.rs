//! Command URI grammar: `<verb>?<k=v>(&<k=v>)*`.
//!
//! Identifiers travel as text: transaction and collection ids in
//! lowercase hex (an optional `0x` prefix is accepted), snapshot ids in
//! decimal. Bare parameter names (`flush`, `dont_watch`) are flags.

use basalt_engine::{
    CollectionId, DropMode, EngineError, OpOptions, Result, SnapshotId,
};

/// A parsed command URI.
#[derive(Debug, Clone, Copy)]
pub struct Command<'a> {
    verb: &'a str,
    query: &'a str,
}

/// Split a URI into its verb and query part.
pub fn parse(uri: &str) -> Command<'_> {
    match uri.split_once('?') {
        Some((verb, query)) => Command { verb, query },
        None => Command { verb: uri, query: "" },
    }
}

impl<'a> Command<'a> {
    pub fn verb(&self) -> &'a str {
        self.verb
    }

    /// Value of `name`, with `Some("")` for a bare flag.
    pub fn param(&self, name: &str) -> Option<&'a str> {
        for pair in self.query.split('&') {
            match pair.split_once('=') {
                Some((key, value)) if key == name => return Some(value),
                None if pair == name => return Some(""),
                _ => {}
            }
        }
        None
    }

    pub fn flag(&self, name: &str) -> bool {
        self.param(name).is_some()
    }
}

/// Which part of a read reply the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPart {
    /// Full values (the default).
    Content,
    /// Per-task lengths only.
    Lengths,
    /// Packed presence bits only.
    Presences,
}

/// Session-scoped parameters shared by every endpoint.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// `0` means non-transactional.
    pub txn_id: u64,
    pub snapshot: Option<SnapshotId>,
    pub collection: Option<CollectionId>,
    pub collection_name: Option<String>,
    pub drop_mode: DropMode,
    pub part: ReadPart,
    pub options: OpOptions,
}

/// Parse a `u64` in hex with optional `0x` prefix.
pub fn parse_hex(text: &str, what: &str) -> Result<u64> {
    let digits = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")).unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|_| EngineError::args(format!("malformed {what} '{text}'")))
}

fn parse_dec(text: &str, what: &str) -> Result<u64> {
    text.parse::<u64>()
        .map_err(|_| EngineError::args(format!("malformed {what} '{text}'")))
}

/// Extract the session parameters of a command.
pub fn session_params(cmd: &Command<'_>) -> Result<SessionParams> {
    let txn_id = match cmd.param("txn") {
        Some(text) if !text.is_empty() => parse_hex(text, "transaction id")?,
        _ => 0,
    };
    let snapshot = match cmd.param("snap") {
        Some(text) if !text.is_empty() => Some(parse_dec(text, "snapshot id")?),
        Some(_) => None,
        None => None,
    };
    let collection = match cmd.param("col") {
        Some(text) if !text.is_empty() => Some(parse_hex(text, "collection id")?),
        Some(_) => None,
        None => None,
    };
    let drop_mode = match cmd.param("drop_mode") {
        Some("values") => DropMode::Values,
        Some("contents") => DropMode::Contents,
        Some("handle") | Some("") | None => DropMode::Handle,
        Some(other) => {
            return Err(EngineError::args(format!("unknown drop mode '{other}'")))
        }
    };
    let part = match cmd.param("part") {
        Some("lengths") => ReadPart::Lengths,
        Some("presences") => ReadPart::Presences,
        Some("") | None => ReadPart::Content,
        Some(other) => return Err(EngineError::args(format!("unknown read part '{other}'"))),
    };

    Ok(SessionParams {
        txn_id,
        snapshot,
        collection,
        collection_name: cmd.param("col_name").map(str::to_owned),
        drop_mode,
        part,
        options: OpOptions {
            flush: cmd.flag("flush"),
            dont_watch: cmd.flag("dont_watch"),
            shared_mem: cmd.flag("shared_mem"),
        },
    })
}
