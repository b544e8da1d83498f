//! End-to-end dispatcher scenarios over record batches.

use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, AsArray, BinaryArray, Int64Array, ListArray, StringArray,
    UInt32Array, UInt64Array,
};
use arrow::datatypes::{Field, Schema, UInt32Type, UInt64Type};
use arrow::record_batch::RecordBatch;

use basalt_engine::{Engine, MemEngine};
use basalt_flight::{ActionReply, Dispatcher, SessionConfig, SessionManager};

const CLIENT: u64 = 42;

fn dispatcher() -> Dispatcher {
    let engine: Arc<dyn Engine> = Arc::new(MemEngine::new());
    let sessions = SessionManager::new(Arc::clone(&engine), SessionConfig::default());
    Dispatcher::new(engine, sessions)
}

fn batch(columns: Vec<(&str, ArrayRef)>) -> RecordBatch {
    let fields: Vec<Field> = columns
        .iter()
        .map(|(name, array)| Field::new(*name, array.data_type().clone(), true))
        .collect();
    let arrays = columns.into_iter().map(|(_, a)| a).collect();
    RecordBatch::try_new(Arc::new(Schema::new(fields)), arrays).unwrap()
}

fn keys_batch(keys: &[i64]) -> RecordBatch {
    batch(vec![("keys", Arc::new(Int64Array::from(keys.to_vec())) as ArrayRef)])
}

fn write_batch(keys: &[i64], vals: &[Option<&[u8]>]) -> RecordBatch {
    batch(vec![
        ("keys", Arc::new(Int64Array::from(keys.to_vec())) as ArrayRef),
        ("vals", Arc::new(BinaryArray::from_opt_vec(vals.to_vec())) as ArrayRef),
    ])
}

fn scalar(reply: ActionReply) -> u64 {
    match reply {
        ActionReply::Scalar(v) => v,
        ActionReply::Empty => panic!("expected a scalar reply"),
    }
}

fn read_vals(d: &Dispatcher, cmd: &str, keys: &[i64]) -> Vec<Option<Vec<u8>>> {
    let reply = d.do_exchange(CLIENT, cmd, &keys_batch(keys)).unwrap();
    let vals: &BinaryArray = reply.column_by_name("vals").unwrap().as_binary();
    (0..vals.len())
        .map(|i| (!vals.is_null(i)).then(|| vals.value(i).to_vec()))
        .collect()
}

fn list_names(d: &Dispatcher) -> Vec<String> {
    let reply = d.do_get(CLIENT, "list_cols").unwrap();
    let names: &StringArray = reply.column_by_name("names").unwrap().as_string();
    (0..names.len()).map(|i| names.value(i).to_owned()).collect()
}

#[test]
fn basic_round_trip_with_deletion_and_scan() {
    let d = dispatcher();
    let values: Vec<[u8; 8]> = [1u64, 2, 3].iter().map(|v| v.to_le_bytes()).collect();
    let vals: Vec<Option<&[u8]>> = values.iter().map(|v| Some(&v[..])).collect();
    d.do_put(CLIENT, "write", &write_batch(&[34, 35, 36], &vals)).unwrap();

    // Bit-exact read-back.
    assert_eq!(
        read_vals(&d, "read", &[34, 35, 36]),
        values.iter().map(|v| Some(v.to_vec())).collect::<Vec<_>>()
    );

    // Scan sees the keys in ascending order, nested as one list row.
    let scan = batch(vec![
        ("scan_starts", Arc::new(Int64Array::from(vec![i64::MIN])) as ArrayRef),
        ("count_limits", Arc::new(UInt32Array::from(vec![100u32])) as ArrayRef),
    ]);
    let reply = d.do_exchange(CLIENT, "scan", &scan).unwrap();
    let lists: &ListArray = reply.column_by_name("keys").unwrap().as_list();
    let row = lists.value(0);
    let row = row.as_primitive::<arrow::datatypes::Int64Type>();
    assert_eq!(&row.values()[..], &[34, 35, 36]);

    // Clearing the presence bit deletes; lengths then report null.
    d.do_put(CLIENT, "write", &write_batch(&[34, 35, 36], &[None, None, None]))
        .unwrap();
    let reply = d
        .do_exchange(CLIENT, "read?part=lengths", &keys_batch(&[34, 35, 36]))
        .unwrap();
    let lengths = reply
        .column_by_name("lengths")
        .unwrap()
        .as_primitive::<UInt32Type>();
    for i in 0..3 {
        assert!(lengths.is_null(i));
        assert_eq!(lengths.values()[i], u32::MAX);
    }
}

#[test]
fn named_collections_are_created_written_and_dropped() {
    let d = dispatcher();
    let col1 = scalar(d.do_action(CLIENT, "col_open?col_name=col1", b"").unwrap());
    let col2 = scalar(d.do_action(CLIENT, "col_open?col_name=col2", b"").unwrap());
    assert_ne!(col1, col2);

    let keys = [34i64, 35, 36];
    d.do_put(
        CLIENT,
        &format!("write?col={col1:x}"),
        &write_batch(&keys, &[Some(b"a1"), Some(b"b1"), Some(b"c1")]),
    )
    .unwrap();
    d.do_put(
        CLIENT,
        &format!("write?col={col2:x}"),
        &write_batch(&keys, &[Some(b"a2"), Some(b"b2"), Some(b"c2")]),
    )
    .unwrap();

    assert_eq!(
        read_vals(&d, &format!("read?col={col1:x}"), &keys)[0],
        Some(b"a1".to_vec())
    );
    assert_eq!(
        read_vals(&d, &format!("read?col={col2:x}"), &keys)[2],
        Some(b"c2".to_vec())
    );

    let names = list_names(&d);
    assert!(names.contains(&"col1".to_owned()));
    assert!(names.contains(&"col2".to_owned()));
    assert!(!names.contains(&"unknown".to_owned()));

    d.do_action(CLIENT, &format!("col_drop?col={col1:x}"), b"").unwrap();
    d.do_action(CLIENT, &format!("col_drop?col={col2:x}"), b"").unwrap();
    let names = list_names(&d);
    assert!(!names.contains(&"col1".to_owned()));
    assert!(!names.contains(&"col2".to_owned()));
}

#[test]
fn transactional_writes_publish_on_commit() {
    let d = dispatcher();
    let txn = scalar(d.do_action(CLIENT, "txn_begin", b"").unwrap());
    assert_ne!(txn, 0);

    let keys = [54i64, 55, 56];
    d.do_put(
        CLIENT,
        &format!("write?txn={txn:x}"),
        &write_batch(&keys, &[Some(b"x"), Some(b"y"), Some(b"z")]),
    )
    .unwrap();

    // The main (non-transactional) path sees nothing yet.
    assert_eq!(read_vals(&d, "read", &keys), vec![None, None, None]);
    // The transaction sees its own writes.
    assert_eq!(
        read_vals(&d, &format!("read?txn={txn:x}"), &keys)[0],
        Some(b"x".to_vec())
    );

    d.do_action(CLIENT, &format!("txn_commit?txn={txn:x}"), b"").unwrap();
    assert_eq!(
        read_vals(&d, "read", &keys),
        vec![Some(b"x".to_vec()), Some(b"y".to_vec()), Some(b"z".to_vec())]
    );

    // The id is gone after commit.
    let err = d
        .do_exchange(CLIENT, &format!("read?txn={txn:x}"), &keys_batch(&keys))
        .unwrap_err();
    assert!(err.to_string().contains("terminated"), "{err}");
}

#[test]
fn snapshots_freeze_reads() {
    let d = dispatcher();
    d.do_put(CLIENT, "write", &write_batch(&[1], &[Some(b"old")])).unwrap();
    let snap = scalar(d.do_action(CLIENT, "snap_open", b"").unwrap());
    d.do_put(CLIENT, "write", &write_batch(&[1], &[Some(b"new")])).unwrap();

    assert_eq!(read_vals(&d, "read", &[1]), vec![Some(b"new".to_vec())]);
    assert_eq!(
        read_vals(&d, &format!("read?snap={snap}"), &[1]),
        vec![Some(b"old".to_vec())]
    );

    let reply = d.do_get(CLIENT, "list_snaps").unwrap();
    let snaps = reply
        .column_by_name("snaps")
        .unwrap()
        .as_primitive::<UInt64Type>();
    assert_eq!(&snaps.values()[..], &[snap]);

    d.do_action(CLIENT, &format!("snap_drop?snap={snap}"), b"").unwrap();
    let reply = d.do_get(CLIENT, "list_snaps").unwrap();
    assert_eq!(reply.num_rows(), 0);
}

#[test]
fn presences_part_packs_bits() {
    let d = dispatcher();
    d.do_put(
        CLIENT,
        "write",
        &write_batch(&[1, 3], &[Some(b"a"), Some(b"b")]),
    )
    .unwrap();

    let reply = d
        .do_exchange(
            CLIENT,
            "read?part=presences",
            &keys_batch(&[1, 2, 3, 4, 5, 6, 7, 8, 9]),
        )
        .unwrap();
    // Nine tasks pack into two bytes.
    assert_eq!(reply.num_rows(), 2);
    let bits = reply
        .column_by_name("presences")
        .unwrap()
        .as_primitive::<arrow::datatypes::UInt8Type>();
    assert_eq!(bits.values()[0], 0b0000_0101);
    assert_eq!(bits.values()[1], 0);
}

#[test]
fn empty_key_set_reads_an_empty_batch() {
    let d = dispatcher();
    let reply = d.do_exchange(CLIENT, "read", &keys_batch(&[])).unwrap();
    assert_eq!(reply.num_rows(), 0);
}

#[test]
fn sample_respects_limits() {
    let d = dispatcher();
    let keys: Vec<i64> = (0..30).collect();
    let values: Vec<Option<&[u8]>> = keys.iter().map(|_| Some(&b"v"[..])).collect();
    d.do_put(CLIENT, "write", &write_batch(&keys, &values)).unwrap();

    let request = batch(vec![(
        "count_limits",
        Arc::new(UInt32Array::from(vec![10u32])) as ArrayRef,
    )]);
    let reply = d.do_exchange(CLIENT, "sample", &request).unwrap();
    let lists: &ListArray = reply.column_by_name("keys").unwrap().as_list();
    assert_eq!(lists.value(0).len(), 10);
}

#[test]
fn paths_write_read_and_match() {
    let d = dispatcher();
    let paths = StringArray::from(vec!["usr/bin/ls", "usr/lib/libc", "var/log"]);
    let vals = BinaryArray::from_opt_vec(vec![Some(&b"1"[..]), Some(b"2"), Some(b"3")]);
    let put = batch(vec![
        ("paths", Arc::new(paths) as ArrayRef),
        ("vals", Arc::new(vals) as ArrayRef),
    ]);
    d.do_put(CLIENT, "write_path", &put).unwrap();

    let request = batch(vec![(
        "paths",
        Arc::new(StringArray::from(vec!["usr/lib/libc", "usr/missing"])) as ArrayRef,
    )]);
    let reply = d.do_exchange(CLIENT, "read_path", &request).unwrap();
    let vals: &BinaryArray = reply.column_by_name("vals").unwrap().as_binary();
    assert_eq!(vals.value(0), b"2");
    assert!(vals.is_null(1));

    let request = batch(vec![(
        "patterns",
        Arc::new(StringArray::from(vec!["usr/"])) as ArrayRef,
    )]);
    let reply = d.do_exchange(CLIENT, "match_path", &request).unwrap();
    let lists: &ListArray = reply.column_by_name("paths").unwrap().as_list();
    let row = lists.value(0);
    let row: &StringArray = row.as_string();
    assert_eq!(row.len(), 2);
    assert_eq!(row.value(0), "usr/bin/ls");
    assert_eq!(row.value(1), "usr/lib/libc");

    let reply = d
        .do_exchange(CLIENT, "match_path?part=lengths", &request)
        .unwrap();
    let counts = reply
        .column_by_name("lengths")
        .unwrap()
        .as_primitive::<UInt32Type>();
    assert_eq!(&counts.values()[..], &[2]);
}

#[test]
fn missing_mandatory_columns_are_invalid() {
    let d = dispatcher();
    let no_keys = batch(vec![(
        "vals",
        Arc::new(BinaryArray::from_opt_vec(vec![Some(&b"v"[..])])) as ArrayRef,
    )]);
    let err = d.do_put(CLIENT, "write", &no_keys).unwrap_err();
    assert!(err.to_string().contains("keys"), "{err}");

    let err = d
        .do_exchange(CLIENT, "scan", &keys_batch(&[1]))
        .unwrap_err();
    assert!(err.to_string().contains("scan_starts"), "{err}");
}

#[test]
fn unknown_verbs_are_rejected() {
    let d = dispatcher();
    assert!(d.do_action(CLIENT, "col_rename?col=1", b"").is_err());
    assert!(d.do_get(CLIENT, "list_everything").is_err());
    assert!(d.do_exchange(CLIENT, "query", &keys_batch(&[1])).is_err());
}
