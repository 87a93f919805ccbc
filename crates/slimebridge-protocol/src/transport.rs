//! Async UDP transport between a virtual device and the host

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// Port the host listens on for tracker traffic
pub const DEFAULT_HOST_PORT: u16 = 6969;

/// Address used for discovery before the host has answered
pub const BROADCAST_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::BROADCAST);

/// Largest datagram a session expects from the host
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Datagram channel a session talks through
///
/// One transport belongs to one session. Sends always go to the current
/// target, which the session moves from the discovery address to the
/// host once the host has answered.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn retarget(&self, target: SocketAddr);

    fn target(&self) -> SocketAddr;

    /// Release the underlying socket; later sends and receives fail
    fn close(&self);
}

/// Opens the transport for a newly registered device
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, target: SocketAddr) -> io::Result<Arc<dyn Transport>>;
}

/// Binds a fresh [`UdpTransport`] per device
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpTransportFactory;

#[async_trait]
impl TransportFactory for UdpTransportFactory {
    async fn open(&self, target: SocketAddr) -> io::Result<Arc<dyn Transport>> {
        Ok(Arc::new(UdpTransport::bind(target).await?))
    }
}

/// Broadcast-capable UDP socket with a movable target
pub struct UdpTransport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    target: RwLock<SocketAddr>,
}

impl UdpTransport {
    /// Bind an ephemeral local port with broadcast enabled
    pub async fn bind(target: SocketAddr) -> io::Result<Self> {
        Self::bind_to(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), target).await
    }

    pub async fn bind_to(local: SocketAddr, target: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        socket.set_broadcast(true)?;
        debug!(local = %socket.local_addr()?, target = %target, "UDP transport bound");
        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            target: RwLock::new(target),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket()?.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.socket.read().unwrap_or_else(|e| e.into_inner()).is_none()
    }

    // In-flight operations keep their own handle; the fd is released when they finish
    fn socket(&self) -> io::Result<Arc<UdpSocket>> {
        self.socket
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport closed"))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let target = self.target();
        let socket = self.socket()?;
        trace!(target = %target, len = packet.len(), "Sending datagram");
        socket.send_to(packet, target).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket()?.recv_from(buf).await
    }

    fn retarget(&self, target: SocketAddr) {
        let mut current = self.target.write().unwrap_or_else(|e| e.into_inner());
        let previous = *current;
        if previous != target {
            *current = target;
            debug!(from = %previous, to = %target, "Transport retargeted");
        }
    }

    fn target(&self) -> SocketAddr {
        *self.target.read().unwrap_or_else(|e| e.into_inner())
    }

    fn close(&self) {
        if self.socket.write().unwrap_or_else(|e| e.into_inner()).take().is_some() {
            debug!(target = %self.target(), "UDP transport closed");
        }
    }
}
