//! Columnar import/export between record batches and engine buffers.
//!
//! Import side: look up named columns, validate their arrow types against
//! the expected argument kind, and hand the engine borrowed views over
//! the column data buffers. Export side: wrap the arena's reply buffers
//! into a fresh record batch.
//!
//! Variable-length results whose per-task counts differ (scan, sample,
//! path matching) export as list columns: a record batch cannot carry
//! sibling columns of unequal length, and arrow's list offsets *are* the
//! reply's offsets array in the format's native nesting.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BinaryArray, Int64Array, ListArray, ListBuilder,
    StringArray, StringBuilder, UInt32Array, UInt64Array, UInt8Array,
};
use arrow::buffer::{BooleanBuffer, Buffer, NullBuffer, OffsetBuffer, ScalarBuffer};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;

use basalt_engine::{
    bit_set, bitmap_bytes, Arena, CollectionId, EngineError, Key, Result,
    Strided, ValuesView,
};
use basalt_paths::PathMatches;

fn arrow_err(e: ArrowError) -> EngineError {
    EngineError::engine(format!("arrow: {e}"))
}

// ── Import ────────────────────────────────────────────────────────────

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    batch
        .column_by_name(name)
        .ok_or_else(|| EngineError::args(format!("missing column '{name}'")))
}

fn typed<'a, T: Array + 'static>(
    batch: &'a RecordBatch,
    name: &str,
    expected: &str,
) -> Result<&'a T> {
    let array = column(batch, name)?;
    array.as_any().downcast_ref::<T>().ok_or_else(|| {
        EngineError::args(format!(
            "column '{name}' must be {expected}, got {}",
            array.data_type()
        ))
    })
}

fn no_nulls(array: &dyn Array, name: &str) -> Result<()> {
    if array.null_count() != 0 {
        return Err(EngineError::args(format!(
            "column '{name}' must not contain nulls"
        )));
    }
    Ok(())
}

/// Required `int64` column (`keys`, `scan_starts`).
pub fn key_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<Strided<'a, Key>> {
    let array: &Int64Array = typed(batch, name, "int64")?;
    no_nulls(array, name)?;
    Ok(Strided::Slice(array.values()))
}

/// Optional `uint64` collection column.
pub fn collection_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<Option<Strided<'a, CollectionId>>> {
    if batch.column_by_name(name).is_none() {
        return Ok(None);
    }
    let array: &UInt64Array = typed(batch, name, "uint64")?;
    no_nulls(array, name)?;
    Ok(Some(Strided::Slice(array.values())))
}

/// Required `uint32` column (`count_limits`).
pub fn limit_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<Strided<'a, u32>> {
    let array: &UInt32Array = typed(batch, name, "uint32")?;
    no_nulls(array, name)?;
    Ok(Strided::Slice(array.values()))
}

/// Optional `uint32` column, broadcasting `fallback` when absent.
pub fn limit_column_or<'a>(
    batch: &'a RecordBatch,
    name: &str,
    fallback: u32,
) -> Result<Strided<'a, u32>> {
    if batch.column_by_name(name).is_none() {
        return Ok(Strided::Broadcast(fallback));
    }
    limit_column(batch, name)
}

/// Optional `binary` values column; null entries mark deletions.
pub fn values_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<Option<ValuesView<'a>>> {
    if batch.column_by_name(name).is_none() {
        return Ok(None);
    }
    let array: &BinaryArray = typed(batch, name, "binary")?;
    let presences = array.nulls().map(|nulls| {
        let mut bits = vec![0u8; bitmap_bytes(array.len())];
        for i in 0..array.len() {
            if nulls.is_valid(i) {
                bit_set(&mut bits, i, true);
            }
        }
        bits
    });
    Ok(Some(ValuesView::new(
        array.value_offsets(),
        array.value_data(),
        presences,
    )?))
}

/// Required `utf8` column (`paths`, `patterns`).
pub fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<Vec<&'a str>> {
    let array: &StringArray = typed(batch, name, "utf8")?;
    no_nulls(array, name)?;
    Ok((0..array.len()).map(|i| array.value(i)).collect())
}

/// Optional `utf8` column.
pub fn string_column_opt<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<Option<Vec<&'a str>>> {
    if batch.column_by_name(name).is_none() {
        return Ok(None);
    }
    string_column(batch, name).map(Some)
}

// ── Export ────────────────────────────────────────────────────────────

fn batch_of(columns: Vec<(&str, ArrayRef, bool)>) -> Result<RecordBatch> {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array, nullable)| Field::new(*name, array.data_type().clone(), *nullable))
        .collect();
    let arrays: Vec<ArrayRef> = columns.into_iter().map(|(_, array, _)| array).collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).map_err(arrow_err)
}

fn reply_offsets(offsets: &[u32]) -> Result<OffsetBuffer<i32>> {
    let mut converted = Vec::with_capacity(offsets.len());
    for &offset in offsets {
        if offset > i32::MAX as u32 {
            return Err(EngineError::engine("reply exceeds the 2 GiB batch limit"));
        }
        converted.push(offset as i32);
    }
    Ok(OffsetBuffer::new(ScalarBuffer::from(converted)))
}

fn presence_nulls(presences: &[u8], len: usize) -> Option<NullBuffer> {
    if len == 0 {
        return None;
    }
    let bits = BooleanBuffer::new(Buffer::from_slice_ref(presences), 0, len);
    Some(NullBuffer::new(bits))
}

/// `vals` reply: nullable binary values from a read.
pub fn values_batch(arena: &Arena, tasks: usize) -> Result<RecordBatch> {
    let array = BinaryArray::try_new(
        reply_offsets(&arena.offsets)?,
        Buffer::from_vec(arena.bytes.clone()),
        presence_nulls(&arena.presences, tasks),
    )
    .map_err(arrow_err)?;
    batch_of(vec![("vals", Arc::new(array) as ArrayRef, true)])
}

/// `lengths` reply: per-task value lengths, null for absent keys.
pub fn lengths_batch(arena: &Arena, tasks: usize) -> Result<RecordBatch> {
    let array = UInt32Array::try_new(
        ScalarBuffer::from(arena.lengths.clone()),
        presence_nulls(&arena.presences, tasks),
    )
    .map_err(arrow_err)?;
    batch_of(vec![("lengths", Arc::new(array) as ArrayRef, true)])
}

/// `presences` reply: validity bits packed into `⌈n/8⌉` bytes.
pub fn presences_batch(arena: &Arena) -> Result<RecordBatch> {
    let array = UInt8Array::from(arena.presences.clone());
    batch_of(vec![("presences", Arc::new(array) as ArrayRef, false)])
}

/// Scan/sample reply: one `list<int64>` row of keys per task.
pub fn key_lists_batch(arena: &Arena, name: &str) -> Result<RecordBatch> {
    let keys = Int64Array::from(arena.keys.clone());
    let field = Arc::new(Field::new("item", DataType::Int64, true));
    let array = ListArray::try_new(
        field,
        reply_offsets(&arena.offsets)?,
        Arc::new(keys) as ArrayRef,
        None,
    )
    .map_err(arrow_err)?;
    batch_of(vec![(name, Arc::new(array) as ArrayRef, false)])
}

/// Path-match reply: one `list<utf8>` row of matched paths per task.
pub fn path_lists_batch(matches: &[PathMatches]) -> Result<RecordBatch> {
    let mut builder = ListBuilder::new(StringBuilder::new());
    for reply in matches {
        for path in &reply.paths {
            builder.values().append_value(path);
        }
        builder.append(true);
    }
    let array = builder.finish();
    batch_of(vec![("paths", Arc::new(array) as ArrayRef, false)])
}

/// Path-match count reply (`part=lengths`).
pub fn match_counts_batch(matches: &[PathMatches]) -> Result<RecordBatch> {
    let counts: Vec<u32> = matches.iter().map(|r| r.paths.len() as u32).collect();
    let array = UInt32Array::from(counts);
    batch_of(vec![("lengths", Arc::new(array) as ArrayRef, false)])
}

/// `list_cols` reply: collection ids and names.
pub fn collections_batch(arena: &Arena) -> Result<RecordBatch> {
    let ids = UInt64Array::from(arena.ids.clone());
    let names = StringArray::try_new(
        reply_offsets(&arena.offsets)?,
        Buffer::from_vec(arena.bytes.clone()),
        None,
    )
    .map_err(arrow_err)?;
    batch_of(vec![
        ("cols", Arc::new(ids) as ArrayRef, false),
        ("names", Arc::new(names) as ArrayRef, false),
    ])
}

/// `list_snaps` reply: snapshot ids.
pub fn snapshots_batch(arena: &Arena) -> Result<RecordBatch> {
    let ids = UInt64Array::from(arena.ids.clone());
    batch_of(vec![("snaps", Arc::new(ids) as ArrayRef, false)])
}
