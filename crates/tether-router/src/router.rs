//! Router loop
//!
//! Dispatch is edge-triggered: the queue is only looked at when something
//! happens (a packet is enqueued, a session connects, delivers, fails or
//! stops). The only timer is the retry scheduled while the initiator cannot
//! be started, either cooling down after a failure or with its transport
//! disabled.

use crate::config::RouterConfig;
use crate::queue::OutboundQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_session::{Inbound, Packet, Role, SessionEvent, SessionLink, SessionReport};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Debug)]
pub enum RouterCommand {
    Enqueue(Packet),
    /// Cooldown retry fired
    Retry,
    Shutdown,
}

pub struct Router<S: SessionLink> {
    config: RouterConfig,
    queue: OutboundQueue,
    acceptor: S,
    initiator: S,
    commands: mpsc::UnboundedSender<RouterCommand>,
    inbound: mpsc::UnboundedSender<Inbound>,
    queued: Arc<AtomicUsize>,
    last_initiator_error: Option<Instant>,
    retry: Option<AbortHandle>,
}

impl<S: SessionLink> Router<S> {
    /// `commands` must feed the receiver later passed to [`Router::run`]
    pub fn new(
        config: RouterConfig,
        acceptor: S,
        initiator: S,
        commands: mpsc::UnboundedSender<RouterCommand>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            queue: OutboundQueue::new(config.capacity, config.max_age),
            config,
            acceptor,
            initiator,
            commands,
            inbound,
            queued: Arc::new(AtomicUsize::new(0)),
            last_initiator_error: None,
            retry: None,
        }
    }

    /// Live queue length, readable from other tasks
    pub fn queued(&self) -> Arc<AtomicUsize> {
        self.queued.clone()
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<RouterCommand>,
        mut reports: mpsc::UnboundedReceiver<SessionReport>,
    ) {
        loop {
            tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(RouterCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(report) = reports.recv() => self.on_report(report),
            }
        }

        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        let dropped = self.queue.clear();
        self.sync_len();
        if dropped > 0 {
            info!(dropped, "Router stopped with undelivered packets");
        } else {
            debug!("Router stopped");
        }
    }

    pub fn on_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Enqueue(packet) => self.enqueue(packet),
            RouterCommand::Retry => {
                self.retry = None;
                self.dispatch();
            }
            RouterCommand::Shutdown => {}
        }
    }

    pub fn enqueue(&mut self, packet: Packet) {
        trace!(address = %packet.message.address, "Enqueued");
        self.queue.push_back(packet);
        self.dispatch();
    }

    pub fn on_report(&mut self, report: SessionReport) {
        let role = report.role;
        match report.event {
            SessionEvent::Connected => {
                debug!(%role, "Session connected");
                self.dispatch();
            }
            SessionEvent::Delivered { id } => {
                trace!(%role, id, "Delivered");
                self.dispatch();
            }
            SessionEvent::SendFailed { leftovers } => {
                debug!(%role, leftovers = leftovers.len(), "Session failed");
                self.queue.push_front_all(leftovers);

                if role == Role::Initiator {
                    self.last_initiator_error = Some(Instant::now());
                    if !self.acceptor.is_connected() {
                        debug!("Asking acceptor to reset");
                        self.acceptor.reset();
                    }
                }
                self.dispatch();
            }
            SessionEvent::Returned { packets } => {
                trace!(%role, returned = packets.len(), "Packets returned");
                self.queue.push_front_all(packets);
                self.dispatch();
            }
            SessionEvent::Stopped => {
                debug!(%role, "Session stopped");
                self.dispatch();
            }
            SessionEvent::Received(inbound) => {
                if self.inbound.send(inbound).is_err() {
                    warn!(%role, "Inbound receiver dropped, discarding message");
                }
            }
        }
    }

    fn dispatch(&mut self) {
        self.queue.expire();
        self.route_head();
        self.sync_len();
    }

    fn route_head(&mut self) {
        if self.queue.is_empty() {
            return;
        }

        if self.acceptor.is_connected() {
            if !self.acceptor.is_busy() {
                if let Some(packet) = self.queue.pop_front() {
                    trace!("Routing to acceptor");
                    self.acceptor.send(packet);
                }
            }
            return;
        }

        if !self.initiator.is_running() {
            if !self.initiator.is_enabled() {
                trace!("Initiator transport disabled, waiting for the acceptor");
                self.schedule_retry();
                return;
            }
            if let Some(failed_at) = self.last_initiator_error {
                if failed_at.elapsed() < self.config.initiator_cooldown {
                    debug!("Initiator cooling down, retrying later");
                    self.schedule_retry();
                    return;
                }
            }
            info!("Starting initiator");
            self.initiator.start();
        }

        if !self.initiator.is_busy() {
            if let Some(packet) = self.queue.pop_front() {
                trace!("Routing to initiator");
                self.initiator.send(packet);
            }
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry.is_some() {
            return;
        }

        let commands = self.commands.clone();
        let delay = self.config.retry_after;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(RouterCommand::Retry);
        });
        self.retry = Some(handle.abort_handle());
    }

    fn sync_len(&self) {
        self.queued.store(self.queue.len(), Ordering::SeqCst);
    }
}
