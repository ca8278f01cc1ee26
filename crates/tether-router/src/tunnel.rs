//! Top-level owner of the router and both sessions

use crate::config::TunnelConfig;
use crate::router::{Router, RouterCommand};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tether_proto::{Delivery, StructuredMessage};
use tether_session::{HoldGuard, Inbound, Packet, Session, SessionHandle, SessionStatus};
use tether_transport::Connector;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

/// Snapshot of both sessions and the outbound queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TunnelStatus {
    pub acceptor: SessionStatus,
    pub initiator: SessionStatus,
    pub queued: usize,
}

pub struct Tunnel {
    commands: mpsc::UnboundedSender<RouterCommand>,
    acceptor: SessionHandle,
    initiator: SessionHandle,
    queued: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl Tunnel {
    /// Start both sessions and the router
    ///
    /// The acceptor starts listening right away; the initiator only dials
    /// when the router has something to send and the acceptor is not
    /// connected. Messages from the peer arrive on the returned receiver.
    pub fn spawn(
        config: TunnelConfig,
        acceptor: Arc<dyn Connector>,
        initiator: Arc<dyn Connector>,
    ) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (acceptor_handle, acceptor_task) =
            Session::spawn(config.acceptor, acceptor, reports_tx.clone());
        let (initiator_handle, initiator_task) =
            Session::spawn(config.initiator, initiator, reports_tx);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            config.router,
            acceptor_handle.clone(),
            initiator_handle.clone(),
            commands_tx.clone(),
            inbound_tx,
        );
        let queued = router.queued();
        let router_task = tokio::spawn(
            router
                .run(commands_rx, reports_rx)
                .instrument(info_span!("router")),
        );

        acceptor_handle.start();
        info!("Tunnel started");

        let tunnel = Self {
            commands: commands_tx,
            acceptor: acceptor_handle,
            initiator: initiator_handle,
            queued,
            tasks: vec![router_task, acceptor_task, initiator_task],
        };
        (tunnel, inbound_rx)
    }

    /// Queue a message for the peer; false once the tunnel has shut down
    pub fn enqueue(&self, delivery: Delivery, message: StructuredMessage) -> bool {
        self.commands
            .send(RouterCommand::Enqueue(Packet::new(delivery, message)))
            .is_ok()
    }

    pub fn status(&self) -> TunnelStatus {
        TunnelStatus {
            acceptor: self.acceptor.status(),
            initiator: self.initiator.status(),
            queued: self.queued.load(Ordering::SeqCst),
        }
    }

    /// Keep the initiator connected while the guard lives
    pub fn hold_initiator(&self) -> HoldGuard {
        self.initiator.hold()
    }

    /// Stop both sessions and the router, waiting for their tasks
    pub async fn shutdown(mut self) {
        info!("Shutting down tunnel");
        let _ = self.commands.send(RouterCommand::Shutdown);
        self.initiator.shutdown();
        self.acceptor.shutdown();

        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                warn!("Tunnel task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
