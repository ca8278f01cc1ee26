//! TCP transports

use crate::{Connector, TransportError, TransportResult, TransportStream};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

/// Passive role: binds once, hands out one accepted peer per `connect`
#[derive(Debug, Clone)]
pub struct TcpAcceptor {
    listener: Arc<TcpListener>,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening for peer on {}", local_addr);

        Ok(Self {
            listener: Arc::new(listener),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Connector for TcpAcceptor {
    async fn connect(&self) -> TransportResult<TransportStream> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("Accepted peer {}", peer);
        Ok(TransportStream::from_io(stream, peer.to_string()))
    }
}

/// Active role: dials the configured address on every `connect`
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Connector for TcpDialer {
    async fn connect(&self) -> TransportResult<TransportStream> {
        let stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            TransportError::ConnectionError(format!("Failed to dial {}: {}", self.addr, e))
        })?;
        stream.set_nodelay(true)?;
        debug!("Dialed peer {}", self.addr);
        Ok(TransportStream::from_io(stream, self.addr.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_dial_and_accept() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").await.unwrap();
        let dialer = TcpDialer::new(acceptor.local_addr().to_string());

        let accept = tokio::spawn({
            let acceptor = acceptor.clone();
            async move { acceptor.connect().await }
        });

        let mut outbound = dialer.connect().await.unwrap();
        let mut inbound = accept.await.unwrap().unwrap();

        outbound.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(outbound.peer, acceptor.local_addr().to_string());
    }

    #[tokio::test]
    async fn test_tcp_dial_refused() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = TcpDialer::new(addr.to_string()).connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionError(_))));
    }
}
