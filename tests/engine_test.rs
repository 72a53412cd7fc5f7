//! Integration tests for the tunnel engine
//!
//! Drives the engine directly (inbound messages in, outbound messages out)
//! against local TCP listeners:
//! - Resolution failure
//! - Refused connect
//! - Bidirectional data and peer close
//! - Write failure on a reset connection
//! - Full engine loop through the session store
//! - Engine exit on teardown, including teardown followed by a restart

use bytes::Bytes;
use http_tunnel::protocol::{Message, CONNECTED, FAILURE_CODE};
use http_tunnel::session::{MemoryStore, SessionId, SessionState, SessionStore};
use http_tunnel::transport::{Resolver, StaticResolver, SystemResolver};
use http_tunnel::tunnel::{EngineConfig, StreamState, TunnelEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn test_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(50),
        idle_backoff: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

fn new_engine(resolver: Arc<dyn Resolver>) -> TunnelEngine {
    TunnelEngine::new(
        SessionId::parse("engine-test").unwrap(),
        0,
        Arc::new(MemoryStore::new()),
        resolver,
        test_config(),
    )
}

/// Run multiplex passes, collecting output, until `done` holds for it
async fn pump_until<F>(engine: &mut TunnelEngine, mut done: F) -> Vec<Message>
where
    F: FnMut(&[Message]) -> bool,
{
    let mut collected = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while !done(&collected) {
            engine.multiplex().await;
            collected.extend(engine.take_outgoing());
        }
    })
    .await
    .expect("engine did not produce the expected messages in time");
    collected
}

fn sync_bytes(messages: &[Message], stream: u32) -> Vec<u8> {
    messages
        .iter()
        .filter_map(|msg| match msg {
            Message::Sync { id, data } if *id == stream => Some(data.to_vec()),
            _ => None,
        })
        .flatten()
        .collect()
}

/// Test that an unresolvable host fails before any socket exists
#[tokio::test]
async fn test_unresolvable_host() {
    let mut engine = new_engine(Arc::new(SystemResolver::new(Duration::from_secs(3))));

    engine.push_incoming([Message::connect(1, "nonexistent.invalid", 80)]);
    engine.digest_incoming().await;

    assert_eq!(engine.take_outgoing(), vec![Message::status(1, FAILURE_CODE)]);
    assert_eq!(engine.pending_count(), 0);
    assert_eq!(engine.open_count(), 0);
}

/// Test that a refused connect reports a nonzero code and forgets the stream
#[tokio::test]
async fn test_refused_connect() {
    let port = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let mut engine = new_engine(Arc::new(StaticResolver::new()));
    engine.push_incoming([Message::connect(2, "127.0.0.1", port)]);
    engine.digest_incoming().await;
    assert_eq!(engine.stream_state(2), Some(StreamState::Connecting));

    let out = pump_until(&mut engine, |out| !out.is_empty()).await;
    assert_eq!(out.len(), 1);
    match &out[0] {
        Message::Status { id, value } => {
            assert_eq!(*id, 2);
            assert_ne!(*value, CONNECTED);
        }
        other => panic!("unexpected message: {:?}", other),
    }
    assert_eq!(engine.stream_state(2), None);
    assert_eq!(engine.pending_count(), 0);
    assert_eq!(engine.open_count(), 0);
}

/// Test data in both directions and the terminal status on peer close
#[tokio::test]
async fn test_bidirectional_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let resolver = StaticResolver::new().with_host("backend", "127.0.0.1".parse().unwrap());
    let mut engine = new_engine(Arc::new(resolver));

    engine.push_incoming([Message::connect(3, "backend", port)]);
    engine.digest_incoming().await;

    let out = pump_until(&mut engine, |out| !out.is_empty()).await;
    assert_eq!(out, vec![Message::status(3, CONNECTED)]);
    assert_eq!(engine.stream_state(3), Some(StreamState::Open));

    let (mut peer, _) = listener.accept().await.unwrap();

    // Large enough to need several partial writes
    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let reader = tokio::spawn(async move {
        let mut received = vec![0u8; expected.len()];
        peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        peer
    });

    engine.push_incoming([Message::sync(3, Bytes::from(payload))]);
    engine.digest_incoming().await;
    assert!(engine.take_outgoing().is_empty());

    let mut peer = reader.await.unwrap();
    peer.write_all(b"hello from the far side").await.unwrap();

    let out = pump_until(&mut engine, |out| sync_bytes(out, 3).len() >= 23).await;
    assert_eq!(sync_bytes(&out, 3), b"hello from the far side");

    drop(peer);
    let out = pump_until(&mut engine, |out| {
        out.iter().any(|msg| matches!(msg, Message::Status { .. }))
    })
    .await;
    assert_eq!(out.last(), Some(&Message::status(3, FAILURE_CODE)));
    assert_eq!(engine.open_count(), 0);

    // Nothing refers to the stream after its terminal status
    engine.push_incoming([Message::sync(3, Bytes::from_static(b"too late"))]);
    engine.digest_incoming().await;
    engine.multiplex().await;
    assert!(engine.take_outgoing().is_empty());
}

/// Test that a write to a reset connection is reported once and the stream
/// is dropped on the next multiplex pass
#[tokio::test]
#[allow(deprecated)]
async fn test_write_failure_on_reset_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut engine = new_engine(Arc::new(StaticResolver::new()));
    engine.push_incoming([Message::connect(1, "127.0.0.1", port)]);
    engine.digest_incoming().await;

    let out = pump_until(&mut engine, |out| !out.is_empty()).await;
    assert_eq!(out, vec![Message::status(1, CONNECTED)]);

    // Abortive close: the peer answers with RST
    let (peer, _) = listener.accept().await.unwrap();
    peer.set_linger(Some(Duration::ZERO)).unwrap();
    drop(peer);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let chunk = Bytes::from(vec![0x5a; 1024 * 1024]);
    engine.push_incoming([Message::sync(1, chunk.clone()), Message::sync(1, chunk)]);
    engine.digest_incoming().await;

    assert_eq!(engine.take_outgoing(), vec![Message::status(1, FAILURE_CODE)]);
    assert_eq!(engine.stream_state(1), Some(StreamState::Closed));

    engine.multiplex().await;
    assert!(engine.take_outgoing().is_empty());
    assert_eq!(engine.stream_state(1), None);
    assert_eq!(engine.open_count(), 0);
}

/// Test several streams sharing one multiplex pass
#[tokio::test]
async fn test_many_streams() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut engine = new_engine(Arc::new(StaticResolver::new()));
    engine.push_incoming((10..14).map(|id| Message::connect(id, "127.0.0.1", port)));
    engine.digest_incoming().await;
    assert_eq!(engine.pending_count(), 4);

    let out = pump_until(&mut engine, |out| out.len() >= 4).await;
    let mut ids: Vec<u32> = out
        .iter()
        .map(|msg| match msg {
            Message::Status { id, value: CONNECTED } => *id,
            other => panic!("unexpected message: {:?}", other),
        })
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![10, 11, 12, 13]);
    assert_eq!(engine.open_count(), 4);
    assert_eq!(engine.pending_count(), 0);
}

/// Test the full loop: messages travel through the session store
#[tokio::test]
async fn test_engine_loop_through_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let store = Arc::new(MemoryStore::new());
    let session = SessionId::parse("loop").unwrap();
    let generation = store.create(&session, SessionState::new()).await.unwrap();

    let engine = TunnelEngine::new(
        session.clone(),
        generation,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        Arc::new(StaticResolver::new()),
        test_config(),
    );
    let handle = tokio::spawn(engine.run());

    {
        let mut txn = store.load_and_lock(&session).await.unwrap();
        txn.admit(0, vec![Message::connect(7, "127.0.0.1", port)]).unwrap();
        txn.commit().await;
    }

    let (mut peer, _) = listener.accept().await.unwrap();
    peer.write_all(b"banner").await.unwrap();

    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while sync_bytes(&seen, 7).len() < 6 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let mut txn = store.load_and_lock(&session).await.unwrap();
            if let http_tunnel::protocol::Reply::Sync { msgs, .. } = txn.next_page(64) {
                seen.extend(msgs);
            }
            txn.commit().await;
        }
    })
    .await
    .expect("banner never reached the session");

    assert_eq!(seen[0], Message::status(7, CONNECTED));
    assert_eq!(sync_bytes(&seen, 7), b"banner");

    let mut txn = store.load_and_lock(&session).await.unwrap();
    txn.stop();
    txn.commit().await;
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("engine did not stop")
        .unwrap();
}

/// Test that destroying the session ends the engine
#[tokio::test]
async fn test_engine_exits_on_teardown() {
    let store = Arc::new(MemoryStore::new());
    let session = SessionId::parse("teardown").unwrap();
    let generation = store.create(&session, SessionState::new()).await.unwrap();

    let engine = TunnelEngine::new(
        session.clone(),
        generation,
        Arc::clone(&store) as Arc<dyn SessionStore>,
        Arc::new(StaticResolver::new()),
        test_config(),
    );
    let handle = tokio::spawn(engine.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store.destroy(&session).await);

    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("engine did not exit after teardown")
        .unwrap();
}

/// Test that an engine exits when its session is torn down and started
/// again under the same id before the engine notices
#[tokio::test]
async fn test_engine_exits_when_session_restarted() {
    let store = Arc::new(MemoryStore::new());
    let session = SessionId::parse("restart").unwrap();
    let first = store.create(&session, SessionState::new()).await.unwrap();

    let spawn_engine = |generation| {
        let engine = TunnelEngine::new(
            session.clone(),
            generation,
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Arc::new(StaticResolver::new()),
            EngineConfig {
                poll_interval: Duration::from_millis(200),
                idle_backoff: Duration::from_millis(200),
                ..EngineConfig::default()
            },
        );
        tokio::spawn(engine.run())
    };

    let old = spawn_engine(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(store.destroy(&session).await);
    let second = store.create(&session, SessionState::new()).await.unwrap();
    assert_ne!(first, second);
    let new = spawn_engine(second);

    tokio::time::timeout(Duration::from_secs(2), old)
        .await
        .expect("old engine kept running against the new session")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!new.is_finished());

    // Only the new engine feeds the session's heartbeat
    let before = store.load_and_lock(&session).await.unwrap().control();
    tokio::time::sleep(Duration::from_millis(500)).await;
    let after = store.load_and_lock(&session).await.unwrap().control();
    assert!(after > before);

    store.destroy(&session).await;
    tokio::time::timeout(Duration::from_secs(2), new)
        .await
        .expect("new engine did not exit after teardown")
        .unwrap();
}
