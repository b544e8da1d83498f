//! # basalt-paths
//!
//! Path modality: string keys projected onto the KV substrate.
//!
//! A path maps to its [`Key`] through the first eight bytes of a SHA-256
//! digest. The stored blob keeps the path alongside the value
//! (`[path_len: u32 LE][path bytes][value bytes]`), so reads verify that
//! the hashed slot really belongs to the requested path and digest
//! collisions surface as errors instead of silent aliasing.
//!
//! Matching is literal-prefix only and runs as a collection scan; richer
//! pattern languages stay with the client.

use std::sync::Arc;

use sha2::{Digest, Sha256};

use basalt_engine::{
    bit_set, bitmap_bytes, Arena, CallContext, CollectionId, Engine,
    EngineError, Key, ReadRequest, Result, ScanRequest, Strided, ValuesView,
    WriteRequest,
};

/// Per-task reply of [`PathCollection::match_paths`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PathMatches {
    /// Matched paths in lexicographic order.
    pub paths: Vec<String>,
}

/// String-keyed view over one collection of the engine.
pub struct PathCollection {
    engine: Arc<dyn Engine>,
    collection: CollectionId,
}

impl PathCollection {
    pub fn new(engine: Arc<dyn Engine>, collection: CollectionId) -> Self {
        Self { engine, collection }
    }

    /// Derive the engine key of a path.
    pub fn key_of(path: &str) -> Key {
        let digest = Sha256::digest(path.as_bytes());
        let mut word = [0u8; 8];
        word.copy_from_slice(&digest[..8]);
        i64::from_le_bytes(word)
    }

    /// Write values under string paths; a cleared validity bit deletes
    /// the path. The batch is one atomic engine write.
    pub fn write_paths(
        &self,
        ctx: CallContext,
        paths: &[&str],
        values: Option<&ValuesView<'_>>,
    ) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let keys: Vec<Key> = paths.iter().map(|p| Self::key_of(p)).collect();
        let mut presences = vec![0u8; bitmap_bytes(paths.len())];
        let mut offsets = vec![0i32];
        let mut bytes = Vec::new();
        for (i, path) in paths.iter().enumerate() {
            let value = match values {
                Some(view) => view.get(i),
                None => None,
            };
            if let Some(value) = value {
                bit_set(&mut presences, i, true);
                bytes.extend_from_slice(&(path.len() as u32).to_le_bytes());
                bytes.extend_from_slice(path.as_bytes());
                bytes.extend_from_slice(value);
            }
            offsets.push(bytes.len() as i32);
        }
        let blob = ValuesView::new(&offsets, &bytes, Some(presences))?;
        self.engine.write(
            ctx,
            WriteRequest {
                collections: Strided::Broadcast(self.collection),
                keys: Strided::Slice(&keys),
                values: Some(blob),
                tasks: paths.len(),
            },
        )
    }

    /// Read values under string paths. The arena ends up in the same
    /// shape an engine read produces: presence bitmap, offsets, lengths
    /// and the concatenated values (paths stripped).
    pub fn read_paths(&self, ctx: CallContext, arena: &mut Arena, paths: &[&str]) -> Result<()> {
        let keys: Vec<Key> = paths.iter().map(|p| Self::key_of(p)).collect();
        self.engine.read(
            ctx,
            ReadRequest {
                collections: Strided::Broadcast(self.collection),
                keys: Strided::Slice(&keys),
                tasks: paths.len(),
            },
            arena,
        )?;

        let mut values: Vec<Option<Vec<u8>>> = Vec::with_capacity(paths.len());
        for (i, path) in paths.iter().enumerate() {
            match arena.value(i) {
                Some(blob) => values.push(Some(strip_path(blob, path)?.to_vec())),
                None => values.push(None),
            }
        }

        arena.reset();
        arena.presences.resize(bitmap_bytes(paths.len()), 0);
        arena.offsets.push(0);
        for (i, value) in values.iter().enumerate() {
            arena.push_value(i, value.as_deref());
        }
        Ok(())
    }

    /// Match literal prefixes against every stored path.
    ///
    /// Matches come back in lexicographic order; a non-empty `previous`
    /// entry resumes strictly after that path. Patterns containing
    /// regex metacharacters are rejected: only literal prefixes are
    /// supported here.
    pub fn match_paths(
        &self,
        ctx: CallContext,
        arena: &mut Arena,
        patterns: &[&str],
        previous: Option<&[&str]>,
        limits: Strided<'_, u32>,
    ) -> Result<Vec<PathMatches>> {
        for pattern in patterns {
            if pattern.chars().any(|c| "^$.*+?()[]{}|\\".contains(c)) {
                return Err(EngineError::args(format!(
                    "only literal prefix patterns are supported, got '{pattern}'"
                )));
            }
        }

        let stored = self.all_paths(ctx, arena)?;
        let mut replies = Vec::with_capacity(patterns.len());
        for (i, pattern) in patterns.iter().enumerate() {
            let resume = previous.and_then(|p| p.get(i)).copied().unwrap_or("");
            let limit = limits.get(i) as usize;
            let paths: Vec<String> = stored
                .iter()
                .filter(|p| p.starts_with(pattern))
                .filter(|p| resume.is_empty() || p.as_str() > resume)
                .take(limit)
                .cloned()
                .collect();
            replies.push(PathMatches { paths });
        }
        Ok(replies)
    }

    /// Every stored path, lexicographically sorted. Full scan; the hash
    /// destroys key order, so the paths themselves are the only order.
    fn all_paths(&self, ctx: CallContext, arena: &mut Arena) -> Result<Vec<String>> {
        self.engine.scan(
            ctx,
            ScanRequest {
                collections: Strided::Broadcast(self.collection),
                start_keys: Strided::Broadcast(Key::MIN),
                count_limits: Strided::Broadcast(u32::MAX),
                tasks: 1,
            },
            arena,
        )?;
        let keys = arena.task_keys(0).to_vec();
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        self.engine.read(
            ctx,
            ReadRequest {
                collections: Strided::Broadcast(self.collection),
                keys: Strided::Slice(&keys),
                tasks: keys.len(),
            },
            arena,
        )?;
        let mut paths = Vec::with_capacity(keys.len());
        for i in 0..keys.len() {
            if let Some(blob) = arena.value(i) {
                paths.push(stored_path(blob)?.to_owned());
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn stored_path(blob: &[u8]) -> Result<&str> {
    if blob.len() < 4 {
        return Err(EngineError::engine("path record too short"));
    }
    let mut word = [0u8; 4];
    word.copy_from_slice(&blob[..4]);
    let len = u32::from_le_bytes(word) as usize;
    if blob.len() < 4 + len {
        return Err(EngineError::engine("path record truncated"));
    }
    std::str::from_utf8(&blob[4..4 + len])
        .map_err(|_| EngineError::engine("path record is not utf-8"))
}

/// Validate the stored path and return the value part of the blob.
fn strip_path<'a>(blob: &'a [u8], expected: &str) -> Result<&'a [u8]> {
    let stored = stored_path(blob)?;
    if stored != expected {
        return Err(EngineError::engine(format!(
            "path hash collision: '{expected}' landed on slot of '{stored}'"
        )));
    }
    Ok(&blob[4 + stored.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_engine::MemEngine;

    fn paths() -> (PathCollection, Arena) {
        let engine: Arc<dyn Engine> = Arc::new(MemEngine::new());
        (PathCollection::new(engine, 0), Arena::new())
    }

    fn values_of(items: &[&[u8]]) -> (Vec<i32>, Vec<u8>) {
        let mut offsets = vec![0i32];
        let mut bytes = Vec::new();
        for item in items {
            bytes.extend_from_slice(item);
            offsets.push(bytes.len() as i32);
        }
        (offsets, bytes)
    }

    #[test]
    fn write_then_read_round_trips() {
        let (pc, mut arena) = paths();
        let ctx = CallContext::plain();
        let (offsets, bytes) = values_of(&[b"v1", b"v2"]);
        let view = ValuesView::new(&offsets, &bytes, None).unwrap();
        pc.write_paths(ctx, &["a/b", "a/c"], Some(&view)).unwrap();

        pc.read_paths(ctx, &mut arena, &["a/b", "a/c", "a/d"]).unwrap();
        assert_eq!(arena.value(0), Some(&b"v1"[..]));
        assert_eq!(arena.value(1), Some(&b"v2"[..]));
        assert_eq!(arena.value(2), None);
    }

    #[test]
    fn cleared_presence_deletes_a_path() {
        let (pc, mut arena) = paths();
        let ctx = CallContext::plain();
        let (offsets, bytes) = values_of(&[b"v1"]);
        let view = ValuesView::new(&offsets, &bytes, None).unwrap();
        pc.write_paths(ctx, &["a/b"], Some(&view)).unwrap();
        pc.write_paths(ctx, &["a/b"], None).unwrap();

        pc.read_paths(ctx, &mut arena, &["a/b"]).unwrap();
        assert_eq!(arena.value(0), None);
    }

    #[test]
    fn prefix_match_is_sorted_and_paginated() {
        let (pc, mut arena) = paths();
        let ctx = CallContext::plain();
        let stored = ["usr/bin/cat", "usr/bin/ls", "usr/lib/libc", "var/log"];
        let (offsets, bytes) = values_of(&[b"1", b"2", b"3", b"4"]);
        let view = ValuesView::new(&offsets, &bytes, None).unwrap();
        pc.write_paths(ctx, &stored, Some(&view)).unwrap();

        let replies = pc
            .match_paths(ctx, &mut arena, &["usr/"], None, Strided::Broadcast(10))
            .unwrap();
        assert_eq!(replies[0].paths, vec!["usr/bin/cat", "usr/bin/ls", "usr/lib/libc"]);

        // Resume strictly after the first result.
        let replies = pc
            .match_paths(
                ctx,
                &mut arena,
                &["usr/"],
                Some(&["usr/bin/cat"]),
                Strided::Broadcast(1),
            )
            .unwrap();
        assert_eq!(replies[0].paths, vec!["usr/bin/ls"]);
    }

    #[test]
    fn regex_metacharacters_are_rejected() {
        let (pc, mut arena) = paths();
        assert!(pc
            .match_paths(
                CallContext::plain(),
                &mut arena,
                &["usr/.*"],
                None,
                Strided::Broadcast(10),
            )
            .is_err());
    }

    #[test]
    fn empty_value_survives_the_blob_framing() {
        let (pc, mut arena) = paths();
        let ctx = CallContext::plain();
        let (offsets, bytes) = values_of(&[b""]);
        let view = ValuesView::new(&offsets, &bytes, None).unwrap();
        pc.write_paths(ctx, &["empty"], Some(&view)).unwrap();

        pc.read_paths(ctx, &mut arena, &["empty"]).unwrap();
        assert_eq!(arena.value(0), Some(&b""[..]));
    }

    #[test]
    fn key_derivation_is_stable() {
        assert_eq!(PathCollection::key_of("a/b"), PathCollection::key_of("a/b"));
        assert_ne!(PathCollection::key_of("a/b"), PathCollection::key_of("a/c"));
    }
}
