//! Connection engine state machine
//!
//! The engine is driven by a single owner task. Everything that happens in
//! the background (the transport connecting, a frame arriving, a write
//! finishing, the liveness tick firing) is posted back to that task as an
//! [`EngineEvent`] and applied through [`ConnectionEngine::handle_event`],
//! which returns the [`EngineNotice`]s the owner has to act on.
//!
//! ```text
//! Idle ──start──> Connecting ──transport up──> Connected ──┬──> Failed (never opened)
//!                     │                                     └──> Lost   (was open)
//!                     └──connect error/timeout──> Failed
//! ```

use crate::config::EngineConfig;
use crate::error::{ConnectionError, QueueRejected};
use crate::pending::{PendingItem, PendingQueue};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use tether_proto::{Command, CommandCodec, PING, PING_ID};
use tether_transport::{BoxedWriter, Connector, TransportError, TransportStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

pub type EngineId = u64;

type SharedWriter = Arc<Mutex<FramedWrite<BoxedWriter, CommandCodec>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Connecting,
    Connected,
    Failed,
    Lost,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EngineState::Idle => "idle",
            EngineState::Connecting => "connecting",
            EngineState::Connected => "connected",
            EngineState::Failed => "failed",
            EngineState::Lost => "lost",
        };
        f.write_str(label)
    }
}

/// Background happening, tagged with the engine that caused it
#[derive(Debug)]
pub struct EngineEvent {
    pub engine: EngineId,
    pub kind: EngineEventKind,
}

#[derive(Debug)]
pub enum EngineEventKind {
    Connected(TransportStream),
    ConnectFailed(ConnectionError),
    Received(Command),
    ReadFailed(ConnectionError),
    SendComplete(u32),
    SendFailed(u32, ConnectionError),
    Tick,
}

/// What the owner of the engine needs to know
#[derive(Debug, PartialEq, Eq)]
pub enum EngineNotice {
    /// First live byte observed on this channel
    ConnectComplete,
    /// Channel died before it ever opened
    ConnectionFailed(Vec<PendingItem>),
    /// Channel died after it had opened
    ConnectionLost(Vec<PendingItem>),
    DataSent(u32),
    CommandReceived(Command),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// A write worker is now carrying the command
    Started,
    /// The command waits for the channel
    Queued,
}

#[derive(Default)]
struct Workers {
    connect: Option<AbortHandle>,
    read: Option<AbortHandle>,
    write: Option<AbortHandle>,
    tick: Option<AbortHandle>,
}

impl Workers {
    fn abort_all(&mut self) {
        for handle in [
            self.connect.take(),
            self.read.take(),
            self.write.take(),
            self.tick.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

pub struct ConnectionEngine {
    id: EngineId,
    config: EngineConfig,
    events: mpsc::UnboundedSender<EngineEvent>,
    state: EngineState,
    has_open_connection: bool,
    force_stop: bool,
    in_flight: Option<PendingItem>,
    queue: PendingQueue,
    last_activity: Instant,
    writer: Option<SharedWriter>,
    workers: Workers,
}

impl ConnectionEngine {
    pub fn new(
        id: EngineId,
        config: EngineConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            id,
            config,
            events,
            state: EngineState::Idle,
            has_open_connection: false,
            force_stop: false,
            in_flight: None,
            queue: PendingQueue::new(),
            last_activity: Instant::now(),
            writer: None,
            workers: Workers::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.has_open_connection
    }

    /// Transport established but no byte has moved yet
    pub fn is_half_open(&self) -> bool {
        self.state == EngineState::Connected && !self.has_open_connection
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some() || !self.queue.is_empty()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Begin establishing the transport
    pub fn start(&mut self, connector: Arc<dyn Connector>) {
        if self.state != EngineState::Idle || self.force_stop {
            warn!(engine = self.id, state = %self.state, "Ignoring start");
            return;
        }

        self.state = EngineState::Connecting;
        debug!(engine = self.id, "Connecting");

        let events = self.events.clone();
        let engine = self.id;
        let timeout = self.config.connect_timeout;

        let handle = tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, connector.connect()).await {
                    Ok(result) => result.map_err(ConnectionError::from),
                    Err(_) => Err(ConnectionError::ConnectTimeout(limit)),
                },
                None => connector.connect().await.map_err(ConnectionError::from),
            };

            let kind = match result {
                Ok(stream) => EngineEventKind::Connected(stream),
                Err(e) => EngineEventKind::ConnectFailed(e),
            };
            let _ = events.send(EngineEvent { engine, kind });
        });

        self.workers.connect = Some(handle.abort_handle());
    }

    /// Send a command or queue it until the channel can carry it
    pub fn send(
        &mut self,
        kind: u8,
        payload: Bytes,
        id: u32,
    ) -> Result<SendOutcome, QueueRejected> {
        if self.force_stop || matches!(self.state, EngineState::Failed | EngineState::Lost) {
            return Err(QueueRejected::Closed);
        }

        if kind != PING && payload.len() > self.config.max_payload {
            return Err(QueueRejected::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload,
            });
        }

        let item = PendingItem::new(id, Command::new(kind, payload));

        if self.in_flight.is_some() || !self.has_open_connection || !self.queue.is_empty() {
            if kind == PING {
                return Err(QueueRejected::PingNotQueued);
            }
            if !self.config.can_queue {
                return Err(QueueRejected::QueueingDisabled);
            }

            trace!(engine = self.id, id, "Queued send");
            self.queue.push(item);
            return Ok(SendOutcome::Queued);
        }

        Ok(self.start_write(item))
    }

    /// Tear everything down and drop queued work; safe to call repeatedly
    pub fn stop(&mut self) {
        if !self.force_stop {
            debug!(engine = self.id, state = %self.state, "Stopping");
        }

        self.force_stop = true;
        self.workers.abort_all();
        self.writer = None;
        self.in_flight = None;
        self.queue.clear();
        self.state = EngineState::Idle;
    }

    /// Apply one background event
    pub fn handle_event(&mut self, event: EngineEvent) -> Vec<EngineNotice> {
        if event.engine != self.id {
            trace!(engine = self.id, stale = event.engine, "Ignoring stale event");
            return Vec::new();
        }

        if self.force_stop || matches!(self.state, EngineState::Failed | EngineState::Lost) {
            trace!(engine = self.id, state = %self.state, "Ignoring event after teardown");
            return Vec::new();
        }

        match event.kind {
            EngineEventKind::Connected(stream) => self.on_connected(stream),
            EngineEventKind::ConnectFailed(err) => {
                self.workers.connect = None;
                self.fail(err)
            }
            EngineEventKind::Received(cmd) => self.on_received(cmd),
            EngineEventKind::ReadFailed(err) => {
                self.workers.read = None;
                self.fail(err)
            }
            EngineEventKind::SendComplete(id) => self.on_send_complete(id),
            EngineEventKind::SendFailed(id, err) => {
                self.workers.write = None;
                debug!(engine = self.id, id, "Write failed");
                self.fail(err)
            }
            EngineEventKind::Tick => self.on_tick(),
        }
    }

    fn on_connected(&mut self, stream: TransportStream) -> Vec<EngineNotice> {
        if self.state != EngineState::Connecting {
            return Vec::new();
        }

        info!(engine = self.id, peer = %stream.peer, "Transport connected");
        self.workers.connect = None;
        self.state = EngineState::Connected;
        self.last_activity = Instant::now();

        let codec = self.config.codec();
        let (reader, writer) = stream.into_parts();
        self.writer = Some(Arc::new(Mutex::new(FramedWrite::new(writer, codec))));

        let events = self.events.clone();
        let engine = self.id;
        let handle = tokio::spawn(async move {
            let mut frames = FramedRead::new(reader, codec);
            loop {
                let kind = match frames.next().await {
                    Some(Ok(cmd)) => EngineEventKind::Received(cmd),
                    Some(Err(e)) => EngineEventKind::ReadFailed(e.into()),
                    None => EngineEventKind::ReadFailed(TransportError::Closed.into()),
                };
                let done = matches!(kind, EngineEventKind::ReadFailed(_));
                if events.send(EngineEvent { engine, kind }).is_err() || done {
                    break;
                }
            }
        });
        self.workers.read = Some(handle.abort_handle());

        self.arm_tick();
        self.drain_one();
        Vec::new()
    }

    fn on_received(&mut self, cmd: Command) -> Vec<EngineNotice> {
        self.last_activity = Instant::now();
        let mut notices = Vec::new();

        if !self.has_open_connection {
            self.mark_open(&mut notices);
            if self.in_flight.is_none() {
                self.drain_one();
            }
        }

        if cmd.is_ping() {
            trace!(engine = self.id, "Received ping");
        } else {
            trace!(engine = self.id, kind = cmd.kind, len = cmd.payload.len(), "Received command");
            notices.push(EngineNotice::CommandReceived(cmd));
        }

        notices
    }

    fn on_send_complete(&mut self, id: u32) -> Vec<EngineNotice> {
        self.workers.write = None;
        match self.in_flight.take() {
            Some(item) if item.id == id => {}
            other => {
                warn!(engine = self.id, id, "Completion for a send that is not in flight");
                self.in_flight = other;
                return Vec::new();
            }
        }

        self.last_activity = Instant::now();
        let mut notices = Vec::new();

        if !self.has_open_connection {
            self.mark_open(&mut notices);
        }

        if id == PING_ID {
            trace!(engine = self.id, "Ping sent");
        } else {
            trace!(engine = self.id, id, "Send complete");
            notices.push(EngineNotice::DataSent(id));
        }

        self.drain_one();
        notices
    }

    fn on_tick(&mut self) -> Vec<EngineNotice> {
        self.workers.tick = None;
        if self.state != EngineState::Connected {
            return Vec::new();
        }

        let idle = self.last_activity.elapsed();
        if idle > self.config.late_after {
            return self.fail(ConnectionError::LivenessTimeout(idle));
        }

        if idle > self.config.worry_after && !self.is_busy() {
            match self.send(PING, Bytes::new(), PING_ID) {
                Ok(_) => trace!(engine = self.id, idle_ms = idle.as_millis() as u64, "Sending ping"),
                Err(e) => trace!(engine = self.id, "Ping not sent: {}", e),
            }
        }

        self.arm_tick();
        Vec::new()
    }

    fn mark_open(&mut self, notices: &mut Vec<EngineNotice>) {
        self.has_open_connection = true;
        info!(engine = self.id, "Connection open");
        notices.push(EngineNotice::ConnectComplete);
    }

    fn drain_one(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        if let Some(item) = self.queue.pop() {
            self.start_write(item);
        }
    }

    fn start_write(&mut self, item: PendingItem) -> SendOutcome {
        let Some(writer) = self.writer.clone() else {
            self.queue.push(item);
            return SendOutcome::Queued;
        };

        let events = self.events.clone();
        let engine = self.id;
        let id = item.id;
        let cmd = item.command.clone();
        self.in_flight = Some(item);

        let handle = tokio::spawn(async move {
            let result = {
                let mut framed = writer.lock().await;
                framed.send(cmd).await
            };
            let kind = match result {
                Ok(()) => EngineEventKind::SendComplete(id),
                Err(e) => EngineEventKind::SendFailed(id, e.into()),
            };
            let _ = events.send(EngineEvent { engine, kind });
        });

        self.workers.write = Some(handle.abort_handle());
        SendOutcome::Started
    }

    fn arm_tick(&mut self) {
        let events = self.events.clone();
        let engine = self.id;
        let interval = self.config.tick_interval;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let _ = events.send(EngineEvent {
                engine,
                kind: EngineEventKind::Tick,
            });
        });

        if let Some(previous) = self.workers.tick.replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    fn fail(&mut self, err: ConnectionError) -> Vec<EngineNotice> {
        let mut leftovers = Vec::new();
        if let Some(item) = self.in_flight.take() {
            if item.id != PING_ID {
                leftovers.push(item);
            }
        }
        leftovers.extend(self.queue.drain());

        self.workers.abort_all();
        self.writer = None;

        let ids: Vec<u32> = leftovers.iter().map(|item| item.id).collect();
        if self.has_open_connection {
            self.state = EngineState::Lost;
            warn!(engine = self.id, leftovers = ?ids, "Connection lost: {}", err);
            vec![EngineNotice::ConnectionLost(leftovers)]
        } else {
            self.state = EngineState::Failed;
            warn!(engine = self.id, leftovers = ?ids, "Connection failed: {}", err);
            vec![EngineNotice::ConnectionFailed(leftovers)]
        }
    }
}

impl Drop for ConnectionEngine {
    fn drop(&mut self) {
        self.workers.abort_all();
    }
}

impl fmt::Debug for ConnectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEngine")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("open", &self.has_open_connection)
            .field("in_flight", &self.in_flight.as_ref().map(|item| item.id))
            .field("queued", &self.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> (ConnectionEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionEngine::new(1, EngineConfig::default(), tx), rx)
    }

    #[tokio::test]
    async fn test_send_before_start_is_queued() {
        let (mut engine, _rx) = engine();
        assert_eq!(
            engine.send(100, Bytes::from_static(b"a"), 1),
            Ok(SendOutcome::Queued)
        );
        assert_eq!(engine.queued(), 1);
        assert!(engine.is_busy());
    }

    #[tokio::test]
    async fn test_ping_not_queued() {
        let (mut engine, _rx) = engine();
        assert_eq!(
            engine.send(PING, Bytes::new(), PING_ID),
            Err(QueueRejected::PingNotQueued)
        );
        assert_eq!(engine.queued(), 0);
    }

    #[tokio::test]
    async fn test_queueing_disabled() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine =
            ConnectionEngine::new(1, EngineConfig::default().with_queueing(false), tx);
        assert_eq!(
            engine.send(100, Bytes::new(), 1),
            Err(QueueRejected::QueueingDisabled)
        );
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut engine = ConnectionEngine::new(1, EngineConfig::default().with_max_payload(2), tx);
        assert_eq!(
            engine.send(100, Bytes::from_static(b"abc"), 1),
            Err(QueueRejected::PayloadTooLarge { size: 3, max: 2 })
        );
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes() {
        let (mut engine, _rx) = engine();
        engine.send(100, Bytes::new(), 1).unwrap();
        engine.stop();
        engine.stop();

        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.queued(), 0);
        assert_eq!(
            engine.send(100, Bytes::new(), 2),
            Err(QueueRejected::Closed)
        );
    }

    #[tokio::test]
    async fn test_stale_events_ignored() {
        let (mut engine, _rx) = engine();
        let notices = engine.handle_event(EngineEvent {
            engine: 99,
            kind: EngineEventKind::ReadFailed(TransportError::Closed.into()),
        });
        assert!(notices.is_empty());
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
