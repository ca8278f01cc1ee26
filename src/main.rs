//! Tether CLI - keep a bidirectional message channel to one peer
//!
//! Listens for the peer and dials it on demand, whichever side gets there
//! first carries the traffic.

mod config;
mod input;

use anyhow::{Context, Result};
use clap::Parser;
use config::{FileConfig, Overrides, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use tether_router::Tunnel;
use tether_session::Inbound;
use tether_transport::{Connector, NullConnector, TcpAcceptor, TcpDialer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Tether - bidirectional message tunnel between two peers
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(about = "Tether - bidirectional message tunnel between two peers")]
#[command(version)]
#[command(long_about = r#"
Keep a message channel open to a single peer. Tether listens on --listen
and, when it has something to send and the peer has not connected, dials
--peer itself.

Each stdin line is sent as one message:
  <address> key=value ...      broadcast
  !<address> key=value ...     start a service on the peer

Messages from the peer are printed to stdout as JSON lines.

ENVIRONMENT VARIABLES:
  TETHER_LISTEN     Address to accept the peer on
  TETHER_PEER       Address to dial (optional)
  TETHER_CONFIG     YAML config file (optional)
  TETHER_LOG_LEVEL  Log filter, defaults to RUST_LOG or info
"#)]
struct Cli {
    /// Address to accept the peer on (e.g., 0.0.0.0:7000)
    #[arg(long, env = "TETHER_LISTEN")]
    listen: Option<String>,

    /// Peer address to dial when the peer is not connected
    #[arg(long, env = "TETHER_PEER")]
    peer: Option<String>,

    /// YAML config file; flags override its values
    #[arg(short, long, env = "TETHER_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (e.g., info, debug, tether_session=trace)
    #[arg(long, env = "TETHER_LOG_LEVEL")]
    log_level: Option<String>,
}

/// Logs go to stderr; stdout carries received messages
fn setup_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).ok(),
        None => EnvFilter::try_from_default_env().ok(),
    }
    .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .with(filter)
        .init();
}

fn print_inbound(message: &Inbound) -> Result<()> {
    let line = serde_json::to_string(message).context("Failed to serialize received message")?;
    println!("{}", line);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::merge(
        file,
        Overrides {
            listen: cli.listen,
            peer: cli.peer,
            log_level: cli.log_level,
        },
    )?;

    setup_logging(settings.log_level.as_deref());
    info!("Tether starting...");

    let acceptor = TcpAcceptor::bind(&settings.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", settings.listen))?;
    let initiator: Arc<dyn Connector> = match &settings.peer {
        Some(peer) => {
            let dialer = TcpDialer::new(peer.clone());
            info!("Peer: {}", dialer.addr());
            Arc::new(dialer)
        }
        None => {
            warn!("No peer configured, messages wait for the peer to connect");
            Arc::new(NullConnector)
        }
    };

    let (tunnel, mut inbound) = Tunnel::spawn(settings.tunnel, Arc::new(acceptor), initiator);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match input::parse_line(&line) {
                    Ok(Some((delivery, message))) => {
                        if !tunnel.enqueue(delivery, message) {
                            error!("Tunnel is no longer running");
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Ignoring input line: {:#}", e),
                },
                Ok(None) => {
                    debug!("stdin closed, still receiving");
                    stdin_open = false;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    stdin_open = false;
                }
            },
            message = inbound.recv() => match message {
                Some(message) => print_inbound(&message)?,
                None => {
                    info!("Tunnel closed");
                    break;
                }
            },
        }
    }

    tunnel.shutdown().await;
    info!("Tether stopped");
    Ok(())
}
