//! In-memory transport for session tests

use async_trait::async_trait;
use slimebridge_core::{BoardType, DeviceIdentity, HardwareId, ImuType, MagnetometerStatus, McuType};
use slimebridge_protocol::{Transport, TransportFactory, DISCOVERY_ACK_MARKER};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{sleep, Instant};

pub struct MockTransport {
    sent: Mutex<Vec<Vec<u8>>>,
    target: Mutex<SocketAddr>,
    send_delay: Mutex<Duration>,
    closed: Mutex<bool>,
    inbound_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            target: Mutex::new(SocketAddr::from(([0, 0, 0, 0], 0))),
            send_delay: Mutex::new(Duration::ZERO),
            closed: Mutex::new(false),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
        })
    }

    /// Queue a datagram as if it came from `from`
    pub fn push(&self, datagram: &[u8], from: SocketAddr) {
        self.inbound_tx.send((datagram.to_vec(), from)).unwrap();
    }

    /// Make every later send take `delay` before it is recorded
    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = delay;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap().clone()
    }

    pub fn count_opcode(&self, opcode: u32) -> usize {
        self.sent()
            .iter()
            .filter(|p| p.len() >= 4 && u32::from_be_bytes([p[0], p[1], p[2], p[3]]) == opcode)
            .count()
    }

    pub async fn wait_for_opcode(&self, opcode: u32, count: usize, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while Instant::now() < deadline {
            if self.count_opcode(opcode) >= count {
                return true;
            }
            sleep(Duration::from_millis(5)).await;
        }
        self.count_opcode(opcode) >= count
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        let delay = *self.send_delay.lock().unwrap();
        if !delay.is_zero() {
            sleep(delay).await;
        }
        self.sent.lock().unwrap().push(packet.to_vec());
        Ok(packet.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some((datagram, from)) => {
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok((len, from))
            }
            None => std::future::pending().await,
        }
    }

    fn retarget(&self, target: SocketAddr) {
        *self.target.lock().unwrap() = target;
    }

    fn target(&self) -> SocketAddr {
        *self.target.lock().unwrap()
    }

    fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }
}

/// Hands out mock transports and remembers them in order
#[derive(Default)]
pub struct MockTransportFactory {
    opened: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockTransportFactory {
    pub fn opened(&self) -> Vec<Arc<MockTransport>> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn open(&self, target: SocketAddr) -> io::Result<Arc<dyn Transport>> {
        let transport = MockTransport::new();
        transport.retarget(target);
        self.opened.lock().unwrap().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Host reply carrying the acknowledgement marker
pub fn ack_from() -> Vec<u8> {
    let mut reply = vec![0u8, 0, 0, 3];
    reply.extend_from_slice(DISCOVERY_ACK_MARKER);
    reply
}

pub fn test_identity() -> DeviceIdentity {
    DeviceIdentity::new(
        "Bridge_Test",
        HardwareId::from_bytes(&[0x02, 0x11, 0x22, 0x33, 0x44, 0x55]),
        BoardType::Custom,
        ImuType::Bno085,
        McuType::Esp32,
        MagnetometerStatus::NotSupported,
    )
    .unwrap()
}
