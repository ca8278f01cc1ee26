//! Session loop
//!
//! Each session runs as one task that owns its current engine. Handles, the
//! engine's workers and the session's own timers all talk to it through
//! channels, so every transition happens on that one task.

use crate::packet::{Inbound, Packet};
use crate::policy::{Leftovers, NextStep, RolePolicy};
use crate::status::{SessionShared, SessionState, SessionStatus};
use crate::{Role, SessionEvent, SessionLink, SessionReport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tether_connection::{
    ConnectionEngine, EngineEvent, EngineId, EngineNotice, PendingItem, QueueRejected,
};
use tether_proto::PING_ID;
use tether_transport::Connector;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, info_span, trace, warn, Instrument};

#[derive(Debug)]
enum SessionCommand {
    Start,
    Send(Packet),
    Reset,
    Stop,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reconnect,
    IdleCheck,
}

#[derive(Debug)]
struct TimerFired {
    seq: u64,
    kind: TimerKind,
}

/// Cloneable handle to a running session
#[derive(Debug, Clone)]
pub struct SessionHandle {
    role: Role,
    commands: mpsc::UnboundedSender<SessionCommand>,
    shared: Arc<SessionShared>,
    connector: Arc<dyn Connector>,
}

impl SessionHandle {
    /// Start the session; the running flag flips immediately
    pub fn start(&self) {
        self.shared.update(|s| {
            if !s.running {
                s.running = true;
                s.state = SessionState::Starting;
            }
        });
        self.post(SessionCommand::Start);
    }

    pub fn send(&self, packet: Packet) {
        self.shared.acquire();
        if !self.post(SessionCommand::Send(packet)) {
            self.shared.settle(1);
        }
    }

    pub fn reset(&self) {
        self.post(SessionCommand::Reset);
    }

    pub fn stop(&self) {
        self.post(SessionCommand::Stop);
    }

    /// Stop and exit the session loop
    pub fn shutdown(&self) {
        self.post(SessionCommand::Shutdown);
    }

    /// Keep the session from stopping itself while the guard lives
    pub fn hold(&self) -> HoldGuard {
        self.shared.hold();
        HoldGuard {
            shared: self.shared.clone(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.snapshot()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn is_busy(&self) -> bool {
        self.shared.outstanding() > 0 || self.shared.is_awaiting_open()
    }

    pub fn is_enabled(&self) -> bool {
        self.connector.is_enabled()
    }

    fn post(&self, command: SessionCommand) -> bool {
        if self.commands.send(command).is_err() {
            warn!(role = %self.role, "Session loop has exited");
            return false;
        }
        true
    }
}

impl SessionLink for SessionHandle {
    fn is_connected(&self) -> bool {
        SessionHandle::is_connected(self)
    }

    fn is_running(&self) -> bool {
        SessionHandle::is_running(self)
    }

    fn is_busy(&self) -> bool {
        SessionHandle::is_busy(self)
    }

    fn is_enabled(&self) -> bool {
        SessionHandle::is_enabled(self)
    }

    fn start(&self) {
        SessionHandle::start(self)
    }

    fn send(&self, packet: Packet) {
        SessionHandle::send(self, packet)
    }

    fn reset(&self) {
        SessionHandle::reset(self)
    }
}

/// Keeps an idle session alive until dropped
#[derive(Debug)]
pub struct HoldGuard {
    shared: Arc<SessionShared>,
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        self.shared.release();
    }
}

pub struct Session<P: RolePolicy> {
    policy: P,
    role: Role,
    connector: Arc<dyn Connector>,
    shared: Arc<SessionShared>,
    reports: mpsc::UnboundedSender<SessionReport>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    timer_tx: mpsc::UnboundedSender<TimerFired>,
    engine: Option<ConnectionEngine>,
    next_engine_id: EngineId,
    next_message_id: u32,
    in_transit: BTreeMap<u32, Packet>,
    reconnect_timer: Option<(u64, AbortHandle)>,
    idle_timer: Option<(u64, AbortHandle)>,
    timer_seq: u64,
    last_traffic: Instant,
}

impl<P: RolePolicy> Session<P> {
    /// Spawn the session loop
    ///
    /// The loop exits on `shutdown` or once every handle has been dropped.
    pub fn spawn(
        policy: P,
        connector: Arc<dyn Connector>,
        reports: mpsc::UnboundedSender<SessionReport>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let role = policy.role();
        let shared = Arc::new(SessionShared::new(role));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let session = Session {
            policy,
            role,
            connector: connector.clone(),
            shared: shared.clone(),
            reports,
            engine_tx,
            timer_tx,
            engine: None,
            next_engine_id: 1,
            next_message_id: 1,
            in_transit: BTreeMap::new(),
            reconnect_timer: None,
            idle_timer: None,
            timer_seq: 0,
            last_traffic: Instant::now(),
        };

        let span = info_span!("session", role = %role);
        let task = tokio::spawn(session.run(commands_rx, engine_rx, timer_rx).instrument(span));

        let handle = SessionHandle {
            role,
            commands: commands_tx,
            shared,
            connector,
        };
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) => {
                        self.stop();
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = engine_events.recv() => self.on_engine_event(event),
                Some(timer) = timers.recv() => self.on_timer(timer),
            }
        }

        debug!("Session loop exiting");
        self.cancel_timers();
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }
    }

    fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Start => self.start(),
            SessionCommand::Send(packet) => self.send(packet),
            SessionCommand::Reset => self.reset(),
            SessionCommand::Stop | SessionCommand::Shutdown => self.stop(),
        }
    }

    fn start(&mut self) {
        if self.engine.is_some() {
            debug!("Already running");
            return;
        }

        self.cancel_timer(TimerKind::Reconnect);
        self.shared.set_awaiting_open(false);

        let id = self.next_engine_id;
        self.next_engine_id += 1;
        self.next_message_id = 1;

        let mut engine =
            ConnectionEngine::new(id, self.policy.engine_config(), self.engine_tx.clone());
        engine.start(self.connector.clone());
        self.engine = Some(engine);
        self.last_traffic = Instant::now();

        let state = match self.role {
            Role::Acceptor => SessionState::WaitingForConnection,
            Role::Initiator => SessionState::Connecting,
        };
        self.shared.update(|s| {
            s.running = true;
            s.connected = false;
            s.state = state;
        });
        info!(engine = id, "Session started");

        if let Some(idle) = self.policy.idle_timeout() {
            self.arm(TimerKind::IdleCheck, idle);
        }
    }

    fn send(&mut self, packet: Packet) {
        let Some(engine) = self.engine.as_mut() else {
            debug!("Not running, returning packet");
            self.hand_back(vec![packet]);
            return;
        };

        let command = match packet.to_command() {
            Ok(command) => command,
            Err(e) => {
                warn!(address = %packet.message.address, "Dropping unencodable packet: {}", e);
                self.shared.settle(1);
                return;
            }
        };

        let id = self.next_message_id;
        self.next_message_id = if id >= PING_ID - 1 { 1 } else { id + 1 };

        match engine.send(command.kind, command.payload, id) {
            Ok(outcome) => {
                trace!(id, ?outcome, "Packet accepted");
                self.in_transit.insert(id, packet);
            }
            Err(QueueRejected::PayloadTooLarge { size, max }) => {
                warn!(size, max, "Dropping oversized packet");
                self.shared.settle(1);
            }
            Err(QueueRejected::QueueingDisabled) if !engine.is_open() => {
                debug!("Channel not open and queueing disabled, holding sends until it opens");
                self.shared.set_awaiting_open(true);
                self.hand_back(vec![packet]);
            }
            Err(e) => {
                debug!("Engine refused packet: {}", e);
                self.hand_back(vec![packet]);
            }
        }
    }

    fn reset(&mut self) {
        if self.policy.reset_stops() {
            self.stop();
            return;
        }

        match &self.engine {
            Some(engine) if engine.is_half_open() => {
                info!("Tearing down half-open connection");
                self.teardown_engine();
                self.start();
            }
            Some(_) => debug!("Reset ignored, connection is not half-open"),
            None => {
                info!("Reset while idle, starting now");
                self.start();
            }
        }
    }

    fn stop(&mut self) {
        self.cancel_timers();
        if self.engine.is_some() {
            self.shared.set_state(SessionState::Disconnecting);
        }
        self.teardown_engine();

        self.shared.update(|s| {
            s.running = false;
            s.connected = false;
            s.state = SessionState::Disconnected;
        });
        info!("Session stopped");
        self.report(SessionEvent::Stopped);
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        let Some(engine) = self.engine.as_mut() else {
            trace!(engine = event.engine, "Dropping event, no engine");
            return;
        };

        for notice in engine.handle_event(event) {
            self.on_notice(notice);
        }
    }

    fn on_notice(&mut self, notice: EngineNotice) {
        match notice {
            EngineNotice::ConnectComplete => {
                self.policy.on_connected();
                self.shared.set_awaiting_open(false);
                self.last_traffic = Instant::now();
                self.shared.update(|s| {
                    s.connected = true;
                    s.running = true;
                    s.failures = 0;
                    s.state = SessionState::Connected;
                });
                self.shared.touch();
                info!("Connected");
                self.report(SessionEvent::Connected);
            }
            EngineNotice::DataSent(id) => {
                if self.in_transit.remove(&id).is_some() {
                    self.shared.settle(1);
                }
                self.last_traffic = Instant::now();
                self.shared.set_state(SessionState::SentData);
                self.shared.touch();
                self.report(SessionEvent::Delivered { id });
            }
            EngineNotice::CommandReceived(command) => {
                self.last_traffic = Instant::now();
                self.shared.set_state(SessionState::ReceivedData);
                self.shared.touch();
                match Inbound::decode(self.role, &command) {
                    Ok(inbound) => self.report(SessionEvent::Received(inbound)),
                    Err(e) => warn!(kind = command.kind, "Ignoring received command: {}", e),
                }
            }
            EngineNotice::ConnectionFailed(items) => self.on_failure(items, false),
            EngineNotice::ConnectionLost(items) => self.on_failure(items, true),
        }
    }

    fn on_failure(&mut self, items: Vec<PendingItem>, lost: bool) {
        self.engine = None;

        let mut packets: Vec<Packet> = items
            .iter()
            .filter_map(|item| self.in_transit.remove(&item.id))
            .collect();
        packets.extend(std::mem::take(&mut self.in_transit).into_values());
        let undelivered = packets.len();

        let decision = self.policy.on_failure(lost, self.connector.is_enabled());
        let failures = self.policy.failures();

        let leftovers = match decision.leftovers {
            Leftovers::Return => packets,
            Leftovers::Discard => {
                if undelivered > 0 {
                    warn!(dropped = undelivered, failures, "Discarding undelivered packets");
                }
                Vec::new()
            }
        };

        let mut state = if lost {
            SessionState::ConnectionLost
        } else {
            SessionState::ConnectionFailed
        };
        let running = match decision.next {
            NextStep::Reconnect(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
                self.arm(TimerKind::Reconnect, delay);
                true
            }
            NextStep::Park => {
                info!("Transport unavailable, waiting for reset");
                state = SessionState::TransportUnavailable;
                self.cancel_timers();
                false
            }
            NextStep::Shutdown => {
                self.cancel_timers();
                false
            }
        };

        self.shared.set_awaiting_open(false);
        self.shared.update(|s| {
            s.connected = false;
            s.running = running;
            s.failures = failures;
            s.state = state;
        });
        self.shared.settle(undelivered);

        self.report(SessionEvent::SendFailed { leftovers });
        if decision.next == NextStep::Shutdown {
            self.report(SessionEvent::Stopped);
        }
    }

    fn on_timer(&mut self, timer: TimerFired) {
        let slot = match timer.kind {
            TimerKind::Reconnect => &mut self.reconnect_timer,
            TimerKind::IdleCheck => &mut self.idle_timer,
        };
        if slot.as_ref().map(|(seq, _)| *seq) != Some(timer.seq) {
            trace!(kind = ?timer.kind, "Ignoring stale timer");
            return;
        }
        *slot = None;

        match timer.kind {
            TimerKind::Reconnect => self.start(),
            TimerKind::IdleCheck => self.check_idle(),
        }
    }

    fn check_idle(&mut self) {
        let (Some(timeout), Some(engine)) = (self.policy.idle_timeout(), self.engine.as_ref())
        else {
            return;
        };

        if self.shared.is_held() || engine.is_busy() || self.shared.outstanding() > 0 {
            self.arm(TimerKind::IdleCheck, timeout);
            return;
        }

        let idle = self.last_traffic.elapsed();
        if idle >= timeout {
            info!(idle_ms = idle.as_millis() as u64, "Idle, stopping");
            self.stop();
        } else {
            self.arm(TimerKind::IdleCheck, timeout - idle);
        }
    }

    /// Stop the current engine and hand back whatever it still carried
    fn teardown_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.stop();
        }
        self.shared.set_awaiting_open(false);

        let packets: Vec<Packet> = std::mem::take(&mut self.in_transit).into_values().collect();
        if !packets.is_empty() {
            self.hand_back(packets);
        }
    }

    fn hand_back(&mut self, packets: Vec<Packet>) {
        self.shared.settle(packets.len());
        self.report(SessionEvent::Returned { packets });
    }

    fn arm(&mut self, kind: TimerKind, delay: Duration) {
        self.timer_seq += 1;
        let seq = self.timer_seq;
        let timers = self.timer_tx.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(TimerFired { seq, kind });
        });

        let slot = match kind {
            TimerKind::Reconnect => &mut self.reconnect_timer,
            TimerKind::IdleCheck => &mut self.idle_timer,
        };
        if let Some((_, previous)) = slot.replace((seq, handle.abort_handle())) {
            previous.abort();
        }
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        let slot = match kind {
            TimerKind::Reconnect => &mut self.reconnect_timer,
            TimerKind::IdleCheck => &mut self.idle_timer,
        };
        if let Some((_, handle)) = slot.take() {
            handle.abort();
        }
    }

    fn cancel_timers(&mut self) {
        self.cancel_timer(TimerKind::Reconnect);
        self.cancel_timer(TimerKind::IdleCheck);
    }

    fn report(&self, event: SessionEvent) {
        let _ = self.reports.send(SessionReport {
            role: self.role,
            event,
        });
    }
}
