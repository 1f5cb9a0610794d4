//! The tokio client driving the engine against a mock backend.

use docsync_engine::{Client, EmptyCredentialsProvider, EngineConfig, ListenOptions, MockConnection};
use docsync_model::{TargetId, User};
use docsync_protocol::{ListenResponse, TargetChangeKind, WriteResponse, WriteResult};
use docsync_storage::MemoryPersistence;
use docsync_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_secs(5);

fn start(connection: &Arc<MockConnection>) -> Client {
    init_tracing();
    Client::start(
        Arc::new(MemoryPersistence::new()),
        connection.clone(),
        Arc::new(EmptyCredentialsProvider),
        &EngineConfig::default(),
        User::UNAUTHENTICATED,
    )
    .unwrap()
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(TIMEOUT, async {
        while !condition() {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn listeners_receive_synced_snapshots() {
    let connection = Arc::new(MockConnection::new());
    let client = start(&connection);
    let mut subscription = client.listen(query("rooms"), ListenOptions::new()).await.unwrap();
    assert_eq!(connection.listen_stream_count(), 1);

    let sink = connection.listen_sink().unwrap();
    sink.on_open();
    sink.on_listen_message(ListenResponse::target_change(TargetChangeKind::Added, vec![TargetId(2)], token("")));
    sink.on_listen_message(ListenResponse::DocumentChange {
        document: wire_doc("rooms/eros", 7, [("n", 1_i64)]),
        target_ids: vec![TargetId(2)],
        removed_target_ids: Vec::new(),
    });
    sink.on_listen_message(ListenResponse::target_change(
        TargetChangeKind::Current,
        vec![TargetId(2)],
        token("resume-1"),
    ));
    sink.on_listen_message(ListenResponse::global_snapshot(version(7), token("resume-1")));

    let snapshot = timeout(TIMEOUT, subscription.snapshots.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!snapshot.from_cache);
    assert_eq!(snapshot.docs.len(), 1);
    assert!(snapshot.docs.contains(&key("rooms/eros")));

    client.unlisten(subscription.listener_id).await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn writes_complete_once_acknowledged() {
    let connection = Arc::new(MockConnection::new());
    let client = start(&connection);

    let backend = {
        let connection = connection.clone();
        async move {
            wait_until(|| connection.write_stream_count() == 1).await;
            let sink = connection.write_sink().unwrap();
            sink.on_open();
            sink.on_write_message(WriteResponse::handshake(token("stream-0")));
            sink.on_write_message(WriteResponse {
                stream_token: token("stream-1"),
                commit_time: Some(version(9)),
                write_results: vec![WriteResult {
                    update_time: Some(version(9)),
                    transform_results: None,
                }],
            });
        }
    };

    let (written, ()) = tokio::join!(
        timeout(TIMEOUT, client.write(vec![set_mutation("rooms/eros", [("n", 1_i64)])])),
        backend
    );
    written.expect("write never completed").unwrap();

    let local = client.read_document(key("rooms/eros")).await.unwrap().unwrap();
    assert_eq!(local.version(), version(9));
    assert!(local.has_committed_mutations());
    client.wait_for_pending_writes().await.unwrap();
    client.shutdown().await.unwrap();
}

#[tokio::test]
async fn pending_writes_waits_fail_on_shutdown() {
    let connection = Arc::new(MockConnection::new());
    let client = Arc::new(start(&connection));
    client.disable_network().await.unwrap();

    let writer = {
        let client = client.clone();
        tokio::spawn(async move { client.write(vec![set_mutation("rooms/eros", [("n", 1_i64)])]).await })
    };
    let wait = {
        let client = client.clone();
        tokio::spawn(async move {
            // Give the write a head start so the wait covers it.
            sleep(Duration::from_millis(20)).await;
            client.wait_for_pending_writes().await
        })
    };
    sleep(Duration::from_millis(50)).await;

    client.shutdown().await.unwrap();
    assert!(timeout(TIMEOUT, wait).await.unwrap().unwrap().is_err());
    assert!(timeout(TIMEOUT, writer).await.unwrap().unwrap().is_err());
    assert!(client.execute_query(query("rooms")).await.is_err());
}
