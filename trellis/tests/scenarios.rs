//! End-to-end statement flows against in-process mock backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tokio::io::{AsyncWriteExt, DuplexStream};
use trellis::{
    create_locator, AccessIntent, CancelToken, CombineKind, Datum, DistributionPolicy,
    FabricError, FabricOptions, InMemorySequencer, KeyType, NodeId, NodeRole, RelationLocInfo,
    RemoteQuery, Session, Tuple,
};
use trellis_wire::NodeHandle;

fn framed(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

fn command_ok(tag: &str, txn: u8) -> Vec<u8> {
    let mut out = framed(b'C', format!("{tag}\0").as_bytes());
    out.extend_from_slice(&framed(b'Z', &[txn]));
    out
}

fn row_desc() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1i16.to_be_bytes());
    payload.extend_from_slice(b"n\0");
    payload.extend_from_slice(&0u32.to_be_bytes());
    payload.extend_from_slice(&0i16.to_be_bytes());
    payload.extend_from_slice(&23u32.to_be_bytes());
    payload.extend_from_slice(&4i16.to_be_bytes());
    payload.extend_from_slice(&(-1i32).to_be_bytes());
    payload.extend_from_slice(&0i16.to_be_bytes());
    framed(b'T', &payload)
}

fn data_row(value: i64) -> Vec<u8> {
    let text = value.to_string();
    let mut payload = Vec::new();
    payload.extend_from_slice(&1i16.to_be_bytes());
    payload.extend_from_slice(&(text.len() as i32).to_be_bytes());
    payload.extend_from_slice(text.as_bytes());
    framed(b'D', &payload)
}

fn error_response(code: &str, message: &str) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.push(b'C');
    payload.extend_from_slice(code.as_bytes());
    payload.push(0);
    payload.push(b'M');
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    payload.push(0);
    framed(b'E', &payload)
}

fn first_col(tuple: &Tuple) -> i64 {
    let len = i32::from_be_bytes(tuple.data[2..6].try_into().unwrap()) as usize;
    std::str::from_utf8(&tuple.data[6..6 + len])
        .unwrap()
        .parse()
        .unwrap()
}

fn session(nodes: &[u32]) -> (Session<InMemorySequencer>, Vec<DuplexStream>) {
    let mut session = Session::new(1, FabricOptions::default(), InMemorySequencer::new());
    let mut fars = Vec::new();
    for &n in nodes {
        let (handle, far) = NodeHandle::duplex(NodeRole::Data, NodeId(n));
        session.attach_handle(handle);
        fars.push(far);
    }
    (session, fars)
}

/// Replicated write over three nodes with node 2 as the primary: the
/// primary is written first, all three prepare and commit.
#[tokio::test]
async fn replicated_write_with_primary_commits_on_all_nodes() {
    let mut info =
        RelationLocInfo::new(DistributionPolicy::Replicated, [1u32, 2, 3]).with_primary(2);
    let mut locator = create_locator(&mut info, AccessIntent::Insert, None, &[]).unwrap();
    let placement = locator.locate(None).unwrap();
    assert_eq!(placement.primary, &[2]);
    assert_eq!(placement.nodes, &[1, 3]);
    let targets: Vec<NodeId> = placement.all().map(NodeId).collect();
    assert_eq!(targets, vec![NodeId(2), NodeId(1), NodeId(3)]);

    let (mut session, mut fars) = session(&[1, 2, 3]);
    for far in &mut fars {
        far.write_all(&command_ok("START TRANSACTION", b'T')).await.unwrap();
        far.write_all(&command_ok("INSERT 0 1", b'T')).await.unwrap();
        far.write_all(&command_ok("PREPARE TRANSACTION", b'I')).await.unwrap();
        far.write_all(&command_ok("COMMIT PREPARED", b'I')).await.unwrap();
    }

    let processed = session
        .execute_command(
            &targets,
            "INSERT INTO t VALUES (1, 'x')",
            CombineKind::Same,
            true,
        )
        .await
        .unwrap();
    assert_eq!(processed, 1);

    // the primary was registered (and will be prepared/committed) first
    let writers: Vec<NodeId> = session.xact().write_nodes().iter().map(|n| n.node).collect();
    assert_eq!(writers, vec![NodeId(2), NodeId(1), NodeId(3)]);

    session.commit().await.unwrap();
    assert_eq!(session.sequencer().in_doubt_count(), 0);
    // all handles were drained and returned
    assert!(session.handles_mut().is_empty());
}

/// Hash-distributed single-row INSERT: the int4 key routes to exactly one
/// node and exactly one row is reported.
#[tokio::test]
async fn hash_insert_routes_to_one_node() {
    let mut info = RelationLocInfo::new(DistributionPolicy::Hash, [1u32, 2, 3, 4])
        .with_partition_attr("c");
    let mut locator =
        create_locator(&mut info, AccessIntent::Insert, Some(KeyType::Int4), &[]).unwrap();
    // hash_int4(42) = 0x59FCFEC8, and 0x59FCFEC8 mod 4 = 0
    let placement = locator.locate(Some(&Datum::Int4(42))).unwrap();
    assert_eq!(placement.nodes, &[1]);
    let targets: Vec<NodeId> = placement.all().map(NodeId).collect();

    let (mut session, mut fars) = session(&[1, 2, 3, 4]);
    fars[0]
        .write_all(&command_ok("START TRANSACTION", b'T'))
        .await
        .unwrap();
    fars[0].write_all(&command_ok("INSERT 0 1", b'T')).await.unwrap();

    let processed = session
        .execute_command(&targets, "INSERT INTO t (c) VALUES (42)", CombineKind::Sum, true)
        .await
        .unwrap();
    assert_eq!(processed, 1);
    assert_eq!(session.xact().write_nodes().len(), 1);
}

/// ORDER BY over two data nodes, 100 sorted rows each: the merged output is
/// exactly 200 rows in global order, tape marks stay inside the buffer, and
/// both tapes end nil.
#[tokio::test]
async fn merge_sort_two_nodes_hundred_rows_each() {
    let (mut session, mut fars) = session(&[1, 2]);
    for (i, far) in fars.iter_mut().enumerate() {
        far.write_all(&command_ok("START TRANSACTION", b'T')).await.unwrap();
        far.write_all(&row_desc()).await.unwrap();
        // node 1 gets 1,3,5..199; node 2 gets 2,4,..200
        for k in 0..100i64 {
            far.write_all(&data_row(2 * k + 1 + i as i64)).await.unwrap();
        }
        far.write_all(&command_ok("SELECT 100", b'T')).await.unwrap();
    }

    let targets = vec![NodeId(1), NodeId(2)];
    let mut combiner = session
        .execute(
            &targets,
            RemoteQuery::Simple {
                sql: "SELECT n FROM t ORDER BY n".into(),
            },
            CombineKind::None,
            false,
        )
        .await
        .unwrap();
    combiner.enable_merge_sort(Box::new(|a, b| first_col(a).cmp(&first_col(b))));

    let mut values = Vec::new();
    while let Some(tuple) = combiner
        .fetch_tuple(session.handles_mut())
        .await
        .unwrap()
    {
        assert!(combiner.row_buffer_valid());
        values.push(first_col(&tuple));
    }
    assert_eq!(values.len(), 200);
    assert!(values.windows(2).all(|w| w[0] < w[1]));
    assert!(combiner.all_tapes_done());
    assert!(combiner
        .fetch_tuple(session.handles_mut())
        .await
        .unwrap()
        .is_none());

    combiner.close(session.handles_mut()).await.unwrap();
}

/// Cancel mid-query: the out-of-band token fires on every node without
/// touching the main sockets; the coordinator then drains each stream to
/// its error + ready and surfaces the first SQLSTATE.
#[tokio::test]
async fn cancel_mid_query_surfaces_query_canceled() {
    let (mut session, mut fars) = session(&[1, 2, 3]);
    let fired = Arc::new(AtomicUsize::new(0));
    for key in session.handles_mut().keys() {
        let fired = Arc::clone(&fired);
        session
            .handles_mut()
            .get_mut(key)
            .unwrap()
            .set_cancel_token(CancelToken::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
    }
    for far in &mut fars {
        far.write_all(&command_ok("START TRANSACTION", b'T')).await.unwrap();
        far.write_all(&row_desc()).await.unwrap();
        for k in 0..20i64 {
            far.write_all(&data_row(k)).await.unwrap();
        }
        far.write_all(&error_response("57014", "canceling statement due to user request"))
            .await
            .unwrap();
        far.write_all(&framed(b'Z', b"E")).await.unwrap();
        // the abort path will roll the errored transaction back
        far.write_all(&command_ok("ROLLBACK", b'I')).await.unwrap();
    }

    let targets = vec![NodeId(1), NodeId(2), NodeId(3)];
    let mut combiner = session
        .execute(
            &targets,
            RemoteQuery::Simple {
                sql: "SELECT n FROM big".into(),
            },
            CombineKind::None,
            false,
        )
        .await
        .unwrap();

    // a few rows stream before the cancel lands
    let mut delivered = 0;
    for _ in 0..10 {
        assert!(combiner
            .fetch_tuple(session.handles_mut())
            .await
            .unwrap()
            .is_some());
        delivered += 1;
    }
    session.cancel_query();
    assert_eq!(fired.load(Ordering::SeqCst), 3);

    // the remaining stream drains; the error surfaces once, with the first
    // backend's SQLSTATE
    let err = loop {
        match combiner.fetch_tuple(session.handles_mut()).await {
            Ok(Some(_)) => delivered += 1,
            Ok(None) => panic!("expected the cancellation error to surface"),
            Err(e) => break e,
        }
    };
    match err {
        FabricError::Remote { sqlstate, .. } => assert_eq!(sqlstate.to_string(), "57014"),
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert!(delivered >= 10);

    session.abort().await;
}

/// A handle whose conversation turned ambiguous is destroyed even when the
/// session pins its connections; it must never be handed to a later
/// statement.
#[tokio::test]
async fn fenced_handles_are_destroyed_despite_pinned_connections() {
    let mut options = FabricOptions::default();
    options.persistent_connections = true;
    let mut session = Session::new(1, options, InMemorySequencer::new());
    let (handle, far) = NodeHandle::duplex(NodeRole::Data, NodeId(1));
    session.attach_handle(handle);
    // the backend dies before the statement goes out
    drop(far);

    let err = session
        .execute_command(&[NodeId(1)], "SELECT 1", CombineKind::None, false)
        .await
        .unwrap_err();
    assert!(
        matches!(err, FabricError::Connection { .. }),
        "expected a connection failure, got {err:?}"
    );

    session.abort().await;
    // the fenced handle is gone, not parked for the next statement
    assert!(session.handles_mut().is_empty());
    let err = session.acquire(&[NodeId(1)]).await.unwrap_err();
    assert!(matches!(err, FabricError::Connection { .. }));
}

/// A plain read over one node followed by a direct (no-2PC) commit.
#[tokio::test]
async fn single_node_read_commits_directly() {
    let (mut session, mut fars) = session(&[1]);
    fars[0]
        .write_all(&command_ok("START TRANSACTION", b'T'))
        .await
        .unwrap();
    fars[0].write_all(&row_desc()).await.unwrap();
    for k in 1..=3i64 {
        fars[0].write_all(&data_row(k)).await.unwrap();
    }
    fars[0].write_all(&command_ok("SELECT 3", b'T')).await.unwrap();
    fars[0].write_all(&command_ok("COMMIT", b'I')).await.unwrap();

    let targets = vec![NodeId(1)];
    let mut combiner = session
        .execute(
            &targets,
            RemoteQuery::Simple {
                sql: "SELECT n FROM t".into(),
            },
            CombineKind::None,
            false,
        )
        .await
        .unwrap();
    let mut rows = Vec::new();
    while let Some(tuple) = combiner.fetch_tuple(session.handles_mut()).await.unwrap() {
        rows.push(first_col(&tuple));
    }
    assert_eq!(rows, vec![1, 2, 3]);
    combiner.close(session.handles_mut()).await.unwrap();

    session.commit().await.unwrap();
    assert!(session.handles_mut().is_empty());
}
