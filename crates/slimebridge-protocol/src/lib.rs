//! SlimeBridge Protocol - Tracker wire format and transport
//!
//! This crate speaks the host's UDP tracker protocol:
//! - Encoding of every outbound packet into reusable buffers
//! - Classification of inbound host datagrams
//! - The datagram transport abstraction and its UDP implementation

pub mod inbound;
pub mod packet;
pub mod transport;

pub use inbound::{HostMessage, DISCOVERY_ACK_MARKER};
pub use packet::{opcode, CodecError, PacketBuilder};
pub use transport::{
    Transport, TransportFactory, UdpTransport, UdpTransportFactory, BROADCAST_ADDR,
    DEFAULT_HOST_PORT, MAX_DATAGRAM_LEN,
};
