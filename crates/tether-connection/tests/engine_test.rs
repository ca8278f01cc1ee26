//! Connection engine behaviour over in-memory transports

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_connection::{
    ConnectionEngine, EngineConfig, EngineEvent, EngineNotice, EngineState, QueueRejected,
    SendOutcome,
};
use tether_proto::{Command, CommandCodec};
use tether_transport::{memory_pair, Connector, MemoryAcceptor, MemoryDialer};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};

type Notices = Vec<(Duration, EngineNotice)>;

fn new_engine(config: EngineConfig) -> (ConnectionEngine, mpsc::UnboundedReceiver<EngineEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ConnectionEngine::new(1, config, tx), rx)
}

/// Feed events to the engine until `deadline`, recording notices with their offset from `origin`
async fn pump_until(
    engine: &mut ConnectionEngine,
    rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
    origin: Instant,
    deadline: Instant,
) -> Notices {
    let mut notices = Vec::new();
    loop {
        tokio::select! {
            biased;
            event = rx.recv() => {
                let Some(event) = event else { break };
                for notice in engine.handle_event(event) {
                    notices.push((origin.elapsed(), notice));
                }
            }
            _ = sleep_until(deadline) => break,
        }
    }
    notices
}

fn ids(items: &[tether_connection::PendingItem]) -> Vec<u32> {
    items.iter().map(|item| item.id).collect()
}

/// Record every frame the peer receives along with its arrival offset
fn record_frames(
    reader: tether_transport::BoxedReader,
    origin: Instant,
) -> Arc<Mutex<Vec<(Duration, Command)>>> {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    tokio::spawn(async move {
        let mut framed = FramedRead::new(reader, CommandCodec::default());
        while let Some(Ok(cmd)) = framed.next().await {
            sink.lock().unwrap().push((origin.elapsed(), cmd));
        }
    });
    frames
}

fn dialer_pair(capacity: usize) -> (MemoryAcceptor, Arc<dyn Connector>) {
    let (acceptor, dialer) = memory_pair(capacity);
    (acceptor, Arc::new(dialer))
}

#[tokio::test(start_paused = true)]
async fn test_never_opened_send_fails_once_on_liveness_timeout() {
    let origin = Instant::now();
    let (acceptor, connector) = dialer_pair(16);
    let (mut engine, mut rx) = new_engine(EngineConfig::default());

    engine.start(connector);
    assert_eq!(engine.state(), EngineState::Connecting);
    assert_eq!(
        engine.send(5, Bytes::from(vec![7u8; 64]), 1),
        Ok(SendOutcome::Queued)
    );

    // Peer accepts but never reads, so the write stays blocked
    let _peer = acceptor.connect().await.unwrap();

    let notices = pump_until(&mut engine, &mut rx, origin, origin + Duration::from_secs(10)).await;

    assert_eq!(notices.len(), 1, "unexpected notices: {:?}", notices);
    let (at, notice) = &notices[0];
    match notice {
        EngineNotice::ConnectionFailed(items) => assert_eq!(ids(items), vec![1]),
        other => panic!("expected ConnectionFailed, got {:?}", other),
    }
    assert!(*at >= Duration::from_secs(4) && *at <= Duration::from_millis(5100));
    assert_eq!(engine.state(), EngineState::Failed);
    assert_eq!(engine.send(5, Bytes::new(), 2), Err(QueueRejected::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_idle_open_connection_sends_single_ping() {
    let origin = Instant::now();
    let (acceptor, connector) = dialer_pair(1024);
    let (mut engine, mut rx) = new_engine(EngineConfig::default());

    engine.start(connector);
    engine
        .send(100, Bytes::from_static(b"hello"), 1)
        .unwrap();

    let peer = acceptor.connect().await.unwrap();
    let (reader, _writer) = peer.into_parts();
    let frames = record_frames(reader, origin);

    let notices = pump_until(
        &mut engine,
        &mut rx,
        origin,
        origin + Duration::from_millis(6500),
    )
    .await;

    let notices: Vec<EngineNotice> = notices.into_iter().map(|(_, n)| n).collect();
    assert_eq!(
        notices,
        vec![EngineNotice::ConnectComplete, EngineNotice::DataSent(1)]
    );

    let frames = frames.lock().unwrap().clone();
    assert_eq!(frames[0].1, Command::new(100, &b"hello"[..]));

    let pings: Vec<Duration> = frames
        .iter()
        .filter(|(_, cmd)| cmd.is_ping())
        .map(|(at, _)| *at)
        .collect();
    assert_eq!(pings.len(), 1, "frames: {:?}", frames);
    assert!(pings[0] >= Duration::from_secs(3));
    assert_eq!(engine.state(), EngineState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_queued_sends_delivered_in_order() {
    let origin = Instant::now();
    let (acceptor, connector) = dialer_pair(1024);
    let (mut engine, mut rx) = new_engine(EngineConfig::default());

    engine.start(connector);
    for id in 1..=5u32 {
        let outcome = engine.send(100, Bytes::from(id.to_string()), id).unwrap();
        assert_eq!(outcome, SendOutcome::Queued);
    }

    let peer = acceptor.connect().await.unwrap();
    let (reader, _writer) = peer.into_parts();
    let frames = record_frames(reader, origin);

    let notices = pump_until(
        &mut engine,
        &mut rx,
        origin,
        origin + Duration::from_millis(500),
    )
    .await;

    let sent: Vec<u32> = notices
        .iter()
        .filter_map(|(_, n)| match n {
            EngineNotice::DataSent(id) => Some(*id),
            _ => None,
        })
        .collect();
    assert_eq!(sent, vec![1, 2, 3, 4, 5]);
    assert_eq!(notices[0].1, EngineNotice::ConnectComplete);

    let payloads: Vec<Bytes> = frames
        .lock()
        .unwrap()
        .iter()
        .map(|(_, cmd)| cmd.payload.clone())
        .collect();
    let expected: Vec<Bytes> = (1..=5u32).map(|id| Bytes::from(id.to_string())).collect();
    assert_eq!(payloads, expected);
}

#[tokio::test(start_paused = true)]
async fn test_only_one_write_in_flight() {
    let origin = Instant::now();
    let (acceptor, connector) = dialer_pair(1024);
    let (mut engine, mut rx) = new_engine(EngineConfig::default());

    engine.start(connector);
    let peer = acceptor.connect().await.unwrap();
    let (reader, mut writer) = peer.into_parts();
    let _frames = record_frames(reader, origin);

    // Opening the channel from the peer side
    let mut framed = FramedWrite::new(&mut writer, CommandCodec::default());
    framed.send(Command::ping()).await.unwrap();
    let notices = pump_until(
        &mut engine,
        &mut rx,
        origin,
        origin + Duration::from_millis(100),
    )
    .await;
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].1, EngineNotice::ConnectComplete);
    assert!(engine.is_open());

    assert_eq!(engine.send(100, Bytes::new(), 1), Ok(SendOutcome::Started));
    assert_eq!(engine.send(100, Bytes::new(), 2), Ok(SendOutcome::Queued));
    assert_eq!(engine.send(100, Bytes::new(), 3), Ok(SendOutcome::Queued));
    assert!(engine.has_in_flight());
    assert_eq!(engine.queued(), 2);

    let notices = pump_until(
        &mut engine,
        &mut rx,
        origin,
        origin + Duration::from_millis(200),
    )
    .await;
    let notices: Vec<EngineNotice> = notices.into_iter().map(|(_, n)| n).collect();
    assert_eq!(
        notices,
        vec![
            EngineNotice::DataSent(1),
            EngineNotice::DataSent(2),
            EngineNotice::DataSent(3)
        ]
    );
    assert!(!engine.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_open_connection_lost_reports_all_leftovers_once() {
    let origin = Instant::now();
    let (acceptor, connector) = dialer_pair(16);
    let (mut engine, mut rx) = new_engine(EngineConfig::default());

    engine.start(connector);
    let peer = acceptor.connect().await.unwrap();
    let (_reader, mut writer) = peer.into_parts();

    let mut framed = FramedWrite::new(&mut writer, CommandCodec::default());
    framed.send(Command::new(100, &b"x"[..])).await.unwrap();

    let notices = pump_until(
        &mut engine,
        &mut rx,
        origin,
        origin + Duration::from_millis(100),
    )
    .await;
    let notices: Vec<EngineNotice> = notices.into_iter().map(|(_, n)| n).collect();
    assert_eq!(
        notices,
        vec![
            EngineNotice::ConnectComplete,
            EngineNotice::CommandReceived(Command::new(100, &b"x"[..]))
        ]
    );

    // Peer never reads: the first write blocks and the rest queue behind it
    assert_eq!(
        engine.send(100, Bytes::from(vec![0u8; 64]), 1),
        Ok(SendOutcome::Started)
    );
    engine.send(100, Bytes::from_static(b"b"), 2).unwrap();
    engine.send(100, Bytes::from_static(b"c"), 3).unwrap();

    let notices = pump_until(&mut engine, &mut rx, origin, origin + Duration::from_secs(15)).await;
    assert_eq!(notices.len(), 1, "unexpected notices: {:?}", notices);
    match &notices[0].1 {
        EngineNotice::ConnectionLost(items) => assert_eq!(ids(items), vec![1, 2, 3]),
        other => panic!("expected ConnectionLost, got {:?}", other),
    }
    assert_eq!(engine.state(), EngineState::Lost);
    assert_eq!(engine.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_peer_close_after_open_is_loss() {
    let origin = Instant::now();
    let (acceptor, connector) = dialer_pair(1024);
    let (mut engine, mut rx) = new_engine(EngineConfig::default());

    engine.start(connector);
    let peer = acceptor.connect().await.unwrap();
    let (reader, mut writer) = peer.into_parts();

    let mut framed = FramedWrite::new(&mut writer, CommandCodec::default());
    framed.send(Command::ping()).await.unwrap();
    drop(framed);
    drop(writer);
    drop(reader);

    let notices = pump_until(&mut engine, &mut rx, origin, origin + Duration::from_secs(1)).await;
    let notices: Vec<EngineNotice> = notices.into_iter().map(|(_, n)| n).collect();
    assert_eq!(
        notices,
        vec![
            EngineNotice::ConnectComplete,
            EngineNotice::ConnectionLost(Vec::new())
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_hands_back_queued_items() {
    let origin = Instant::now();
    // Nobody ever dials this acceptor
    let (acceptor, _dialer): (MemoryAcceptor, MemoryDialer) = memory_pair(64);
    let (mut engine, mut rx) = new_engine(EngineConfig::initiator());

    engine.start(Arc::new(acceptor));
    engine.send(100, Bytes::from_static(b"a"), 1).unwrap();
    engine.send(100, Bytes::from_static(b"b"), 2).unwrap();

    let notices = pump_until(&mut engine, &mut rx, origin, origin + Duration::from_secs(30)).await;
    assert_eq!(notices.len(), 1);
    let (at, notice) = &notices[0];
    match notice {
        EngineNotice::ConnectionFailed(items) => assert_eq!(ids(items), vec![1, 2]),
        other => panic!("expected ConnectionFailed, got {:?}", other),
    }
    assert!(*at >= Duration::from_secs(10) && *at < Duration::from_millis(10100));
    assert_eq!(engine.queued(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_dial_fails_immediately() {
    let origin = Instant::now();
    let (_acceptor, dialer) = memory_pair(64);
    dialer.set_enabled(false);
    let (mut engine, mut rx) = new_engine(EngineConfig::initiator());

    engine.start(Arc::new(dialer));
    engine.send(100, Bytes::new(), 7).unwrap();

    let notices = pump_until(&mut engine, &mut rx, origin, origin + Duration::from_secs(1)).await;
    let notices: Vec<EngineNotice> = notices.into_iter().map(|(_, n)| n).collect();
    assert_eq!(notices.len(), 1);
    assert!(matches!(&notices[0], EngineNotice::ConnectionFailed(items) if ids(items) == vec![7]));
}

#[tokio::test(start_paused = true)]
async fn test_stop_silences_workers() {
    let origin = Instant::now();
    let (acceptor, connector) = dialer_pair(1024);
    let (mut engine, mut rx) = new_engine(EngineConfig::default());

    engine.start(connector);
    engine.send(100, Bytes::new(), 1).unwrap();
    let _peer = acceptor.connect().await.unwrap();

    engine.stop();
    let notices = pump_until(&mut engine, &mut rx, origin, origin + Duration::from_secs(10)).await;
    assert!(notices.is_empty());
    assert_eq!(engine.state(), EngineState::Idle);
    assert!(!engine.is_busy());
}
