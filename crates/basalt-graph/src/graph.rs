//! Directed graph operations over one engine collection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::debug;

use basalt_engine::{
    bit_set, bitmap_bytes, Arena, CallContext, CollectionId, Engine, Key,
    ReadRequest, Result, ScanRequest, Strided, ValuesView, WriteRequest,
};

use crate::record::{self, AdjEntry, Direction, EDGE_ID_NONE};

/// A directed labeled edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub source: Key,
    pub target: Key,
    pub id: Key,
}

impl Edge {
    pub fn new(source: Key, target: Key, id: Key) -> Self {
        Self { source, target, id }
    }

    /// An edge without an explicit id; stored under the
    /// [`EDGE_ID_NONE`] sentinel.
    pub fn between(source: Key, target: Key) -> Self {
        Self { source, target, id: EDGE_ID_NONE }
    }

    fn matches(&self, entry: &AdjEntry, direction: Direction) -> bool {
        let neighbor = match direction {
            Direction::Out => self.target,
            Direction::In => self.source,
        };
        entry.direction == direction
            && entry.neighbor == neighbor
            && (self.id == EDGE_ID_NONE || entry.edge_id == self.id)
    }
}

/// Graph view over one collection of the engine.
///
/// All mutations perform batched read-modify-write cycles and publish
/// every touched record in a single [`Engine::write`], so they are atomic
/// under the caller's transaction.
pub struct GraphCollection {
    engine: Arc<dyn Engine>,
    collection: CollectionId,
}

impl GraphCollection {
    pub fn new(engine: Arc<dyn Engine>, collection: CollectionId) -> Self {
        Self { engine, collection }
    }

    pub fn collection(&self) -> CollectionId {
        self.collection
    }

    // ── Mutations ─────────────────────────────────────────────────────

    /// Insert edges, deduplicating `(source, target, id)` repeats.
    /// Entries append to each endpoint record in input order.
    pub fn upsert_edges(&self, ctx: CallContext, arena: &mut Arena, edges: &[Edge]) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let vertices = touched_vertices(edges);
        let mut records = self.load_records(ctx, arena, &vertices)?;

        for edge in edges {
            if let Some(entries) = records.get_mut(&edge.source) {
                record::append_unique(
                    entries.get_or_insert_with(Vec::new),
                    AdjEntry {
                        neighbor: edge.target,
                        edge_id: edge.id,
                        direction: Direction::Out,
                    },
                );
            }
            if let Some(entries) = records.get_mut(&edge.target) {
                record::append_unique(
                    entries.get_or_insert_with(Vec::new),
                    AdjEntry {
                        neighbor: edge.source,
                        edge_id: edge.id,
                        direction: Direction::In,
                    },
                );
            }
        }

        let writes: Vec<(Key, Option<Vec<u8>>)> = vertices
            .iter()
            .map(|v| {
                let entries = records.remove(v).flatten().unwrap_or_default();
                (*v, Some(record::encode(&entries)))
            })
            .collect();
        debug!(edges = edges.len(), records = writes.len(), "graph upsert");
        self.store_records(ctx, &writes)
    }

    /// Remove edges from both endpoint records. An [`EDGE_ID_NONE`] id
    /// matches every edge between the endpoints. Vertices stay present
    /// even when their record becomes empty.
    pub fn remove_edges(&self, ctx: CallContext, arena: &mut Arena, edges: &[Edge]) -> Result<()> {
        if edges.is_empty() {
            return Ok(());
        }
        let vertices = touched_vertices(edges);
        let mut records = self.load_records(ctx, arena, &vertices)?;

        for edge in edges {
            if let Some(Some(entries)) = records.get_mut(&edge.source) {
                entries.retain(|e| !edge.matches(e, Direction::Out));
            }
            if let Some(Some(entries)) = records.get_mut(&edge.target) {
                entries.retain(|e| !edge.matches(e, Direction::In));
            }
        }

        // Only vertices that exist are written back.
        let writes: Vec<(Key, Option<Vec<u8>>)> = vertices
            .iter()
            .filter_map(|v| match records.remove(v) {
                Some(Some(entries)) => Some((*v, Some(record::encode(&entries)))),
                _ => None,
            })
            .collect();
        self.store_records(ctx, &writes)
    }

    /// Delete vertices and cascade: reciprocal entries disappear from
    /// every surviving neighbor, then the vertex keys themselves are
    /// removed, all in one write batch.
    pub fn remove_vertices(&self, ctx: CallContext, arena: &mut Arena, keys: &[Key]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let victims: HashSet<Key> = keys.iter().copied().collect();
        let records = self.load_records(ctx, arena, keys)?;

        let mut neighbors: Vec<Key> = Vec::new();
        let mut seen = victims.clone();
        for entries in records.values().flatten() {
            for entry in entries {
                if seen.insert(entry.neighbor) {
                    neighbors.push(entry.neighbor);
                }
            }
        }

        let neighbor_records = self.load_records(ctx, arena, &neighbors)?;
        let mut writes: Vec<(Key, Option<Vec<u8>>)> = Vec::new();
        for neighbor in &neighbors {
            if let Some(Some(entries)) = neighbor_records.get(neighbor) {
                let kept: Vec<AdjEntry> = entries
                    .iter()
                    .copied()
                    .filter(|e| !victims.contains(&e.neighbor))
                    .collect();
                writes.push((*neighbor, Some(record::encode(&kept))));
            }
        }
        for key in keys {
            writes.push((*key, None));
        }
        debug!(vertices = keys.len(), neighbors = neighbors.len(), "graph vertex removal");
        self.store_records(ctx, &writes)
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Whether the vertex key exists (presence bit of its record).
    pub fn contains(&self, ctx: CallContext, arena: &mut Arena, key: Key) -> Result<bool> {
        self.engine.read(
            ctx,
            ReadRequest {
                collections: Strided::Broadcast(self.collection),
                keys: Strided::Slice(std::slice::from_ref(&key)),
                tasks: 1,
            },
            arena,
        )?;
        Ok(arena.presence(0))
    }

    /// Number of record entries matching the direction filter. Without a
    /// filter this is out-degree plus in-degree.
    pub fn degree(
        &self,
        ctx: CallContext,
        arena: &mut Arena,
        key: Key,
        direction: Option<Direction>,
    ) -> Result<usize> {
        let entries = self.load_one(ctx, arena, key)?.unwrap_or_default();
        Ok(entries
            .iter()
            .filter(|e| direction.map_or(true, |d| e.direction == d))
            .count())
    }

    /// Edges incident to `key`, filtered by direction. `Out` yields
    /// edges with `key` as source, `In` edges with `key` as target,
    /// `None` both.
    pub fn edges_of(
        &self,
        ctx: CallContext,
        arena: &mut Arena,
        key: Key,
        direction: Option<Direction>,
    ) -> Result<Vec<Edge>> {
        let entries = self.load_one(ctx, arena, key)?.unwrap_or_default();
        Ok(entries
            .iter()
            .filter(|e| direction.map_or(true, |d| e.direction == d))
            .map(|e| project(key, e))
            .collect())
    }

    /// Edges running from `a` to `b`.
    pub fn edges_between(
        &self,
        ctx: CallContext,
        arena: &mut Arena,
        a: Key,
        b: Key,
    ) -> Result<Vec<Edge>> {
        let mut edges = self.edges_of(ctx, arena, a, Some(Direction::Out))?;
        edges.retain(|e| e.target == b);
        Ok(edges)
    }

    /// Enumerate the whole collection by scanning vertex records.
    ///
    /// Every edge appears exactly twice, once per endpoint record;
    /// deduplicate by `(source, target, id)` for the set of distinct
    /// edges.
    pub fn all_edges(&self, ctx: CallContext, arena: &mut Arena) -> Result<Vec<Edge>> {
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
        let vertices = arena.task_keys(0).to_vec();
        let records = self.load_records(ctx, arena, &vertices)?;

        let mut edges = Vec::new();
        for vertex in &vertices {
            if let Some(Some(entries)) = records.get(vertex) {
                edges.extend(entries.iter().map(|e| project(*vertex, e)));
            }
        }
        Ok(edges)
    }

    // ── Record plumbing ───────────────────────────────────────────────

    fn load_one(&self, ctx: CallContext, arena: &mut Arena, key: Key) -> Result<Option<Vec<AdjEntry>>> {
        self.engine.read(
            ctx,
            ReadRequest {
                collections: Strided::Broadcast(self.collection),
                keys: Strided::Slice(std::slice::from_ref(&key)),
                tasks: 1,
            },
            arena,
        )?;
        match arena.value(0) {
            Some(bytes) => Ok(Some(record::decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Batched record fetch; `None` marks an absent vertex.
    fn load_records(
        &self,
        ctx: CallContext,
        arena: &mut Arena,
        keys: &[Key],
    ) -> Result<HashMap<Key, Option<Vec<AdjEntry>>>> {
        let mut records = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(records);
        }
        self.engine.read(
            ctx,
            ReadRequest {
                collections: Strided::Broadcast(self.collection),
                keys: Strided::Slice(keys),
                tasks: keys.len(),
            },
            arena,
        )?;
        for (i, key) in keys.iter().enumerate() {
            let entries = match arena.value(i) {
                Some(bytes) => Some(record::decode(bytes)?),
                None => None,
            };
            records.insert(*key, entries);
        }
        Ok(records)
    }

    /// Publish record updates (`None` value deletes the vertex key) as
    /// one engine write batch.
    fn store_records(&self, ctx: CallContext, writes: &[(Key, Option<Vec<u8>>)]) -> Result<()> {
        if writes.is_empty() {
            return Ok(());
        }
        let keys: Vec<Key> = writes.iter().map(|(k, _)| *k).collect();
        let mut presences = vec![0u8; bitmap_bytes(writes.len())];
        let mut offsets = vec![0i32];
        let mut bytes = Vec::new();
        for (i, (_, blob)) in writes.iter().enumerate() {
            if let Some(blob) = blob {
                bit_set(&mut presences, i, true);
                bytes.extend_from_slice(blob);
            }
            offsets.push(bytes.len() as i32);
        }
        let values = ValuesView::new(&offsets, &bytes, Some(presences))?;
        self.engine.write(
            ctx,
            WriteRequest {
                collections: Strided::Broadcast(self.collection),
                keys: Strided::Slice(&keys),
                values: Some(values),
                tasks: keys.len(),
            },
        )
    }
}

fn project(vertex: Key, entry: &AdjEntry) -> Edge {
    match entry.direction {
        Direction::Out => Edge::new(vertex, entry.neighbor, entry.edge_id),
        Direction::In => Edge::new(entry.neighbor, vertex, entry.edge_id),
    }
}

/// Unique endpoint keys of `edges` in first-touch order.
fn touched_vertices(edges: &[Edge]) -> Vec<Key> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    for edge in edges {
        if seen.insert(edge.source) {
            order.push(edge.source);
        }
        if seen.insert(edge.target) {
            order.push(edge.target);
        }
    }
    order
}
