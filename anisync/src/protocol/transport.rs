use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::config::AniDbSettings;

/// Failures below the protocol layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,
}

/// Datagram exchange with the provider. One reply is expected per send.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drops datagrams that already arrived without being read. Returns how
    /// many were dropped.
    fn discard_pending(&self) -> usize {
        0
    }
}

const MAX_DATAGRAM: usize = 64 * 1024;

/// [`Transport`] over a connected UDP socket.
pub struct UdpTransport {
    socket: UdpSocket,
    server: String,
}

impl UdpTransport {
    /// Binds the configured local port and connects to the provider.
    pub async fn connect(settings: &AniDbSettings) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", settings.client_port)).await?;
        socket
            .connect((settings.server_host.as_str(), settings.server_port))
            .await?;
        let server = format!("{}:{}", settings.server_host, settings.server_port);
        tracing::info!(server = %server, local = ?socket.local_addr().ok(), "udp transport connected");
        Ok(Self { socket, server })
    }
}

impl fmt::Debug for UdpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpTransport")
            .field("server", &self.server)
            .field("local", &self.socket.local_addr().ok())
            .finish()
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        self.socket.send(bytes).await?;
        Ok(())
    }

    async fn receive(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(timeout, self.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(buf)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => Err(TransportError::Timeout(timeout)),
        }
    }

    fn discard_pending(&self) -> usize {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut dropped = 0;
        while self.socket.try_recv(&mut buf).is_ok() {
            dropped += 1;
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exchanges_datagrams_with_a_local_peer() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let settings = AniDbSettings {
            server_host: server_addr.ip().to_string(),
            server_port: server_addr.port(),
            client_port: 0,
            ..AniDbSettings::default()
        };
        let transport = UdpTransport::connect(&settings).await.unwrap();

        transport.send(b"PING").await.unwrap();
        let mut buf = [0u8; 16];
        let (len, peer) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"PING");

        server.send_to(b"300 PONG", peer).await.unwrap();
        let reply = transport.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply, b"300 PONG");
    }

    #[tokio::test]
    async fn unread_datagrams_are_discarded() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let settings = AniDbSettings {
            server_host: server_addr.ip().to_string(),
            server_port: server_addr.port(),
            client_port: 0,
            ..AniDbSettings::default()
        };
        let transport = UdpTransport::connect(&settings).await.unwrap();

        transport.send(b"PING").await.unwrap();
        let mut buf = [0u8; 16];
        let (_, peer) = server.recv_from(&mut buf).await.unwrap();
        server.send_to(b"300 PONG", peer).await.unwrap();
        server.send_to(b"300 PONG", peer).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(transport.discard_pending(), 2);
        let err = transport
            .receive(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn receive_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let settings = AniDbSettings {
            server_host: server_addr.ip().to_string(),
            server_port: server_addr.port(),
            client_port: 0,
            ..AniDbSettings::default()
        };
        let transport = UdpTransport::connect(&settings).await.unwrap();

        let err = transport
            .receive(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }
}
