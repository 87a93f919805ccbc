//! Classification of datagrams received from the host

use crate::packet::opcode;

/// Text the host embeds in its reply to a discovery handshake
pub const DISCOVERY_ACK_MARKER: &[u8] = b"Hey OVR =D 5";

/// Offset of the ping id inside a ping-pong datagram
const PING_ID_OFFSET: usize = 12;

/// Inbound opcodes, distinct from the outbound table
mod inbound_opcode {
    pub const HEARTBEAT: u32 = 1;
    pub const VIBRATE: u32 = 2;
    pub const HANDSHAKE: u32 = 3;
    pub const COMMAND: u32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMessage {
    /// Reply to our discovery handshake
    DiscoveryAck,
    Heartbeat,
    Vibrate,
    /// Host asks the device to pair again
    Handshake,
    Command,
    /// Ping that must be echoed back unchanged
    PingPong { ping_id: u32 },
    Unknown { opcode: Option<u32> },
}

impl HostMessage {
    /// Classify a raw datagram
    ///
    /// The acknowledgement marker is matched anywhere in the payload before
    /// the opcode is looked at.
    pub fn parse(datagram: &[u8]) -> Self {
        if contains(datagram, DISCOVERY_ACK_MARKER) {
            return HostMessage::DiscoveryAck;
        }

        let Some(op) = read_u32(datagram, 0) else {
            return HostMessage::Unknown { opcode: None };
        };

        match op {
            inbound_opcode::HEARTBEAT => HostMessage::Heartbeat,
            inbound_opcode::VIBRATE => HostMessage::Vibrate,
            inbound_opcode::HANDSHAKE => HostMessage::Handshake,
            inbound_opcode::COMMAND => HostMessage::Command,
            opcode::PING_PONG => match read_u32(datagram, PING_ID_OFFSET) {
                Some(ping_id) => HostMessage::PingPong { ping_id },
                None => HostMessage::Unknown { opcode: Some(op) },
            },
            other => HostMessage::Unknown { opcode: Some(other) },
        }
    }
}

fn read_u32(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_marker_anywhere() {
        let mut reply = vec![0u8, 0, 0, 3];
        reply.extend_from_slice(DISCOVERY_ACK_MARKER);
        reply.extend_from_slice(b"\0\0");
        assert_eq!(HostMessage::parse(&reply), HostMessage::DiscoveryAck);
        assert_eq!(
            HostMessage::parse(b"Hey OVR =D 5"),
            HostMessage::DiscoveryAck
        );
    }

    #[test]
    fn test_opcodes() {
        assert_eq!(HostMessage::parse(&[0, 0, 0, 1]), HostMessage::Heartbeat);
        assert_eq!(HostMessage::parse(&[0, 0, 0, 2, 9]), HostMessage::Vibrate);
        assert_eq!(HostMessage::parse(&[0, 0, 0, 3]), HostMessage::Handshake);
        assert_eq!(HostMessage::parse(&[0, 0, 0, 4]), HostMessage::Command);
        assert_eq!(
            HostMessage::parse(&[0, 0, 0, 99]),
            HostMessage::Unknown { opcode: Some(99) }
        );
        assert_eq!(
            HostMessage::parse(&[0, 1]),
            HostMessage::Unknown { opcode: None }
        );
    }

    #[test]
    fn test_ping_pong_needs_id() {
        let mut ping = vec![0u8, 0, 0, 10, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            HostMessage::parse(&ping),
            HostMessage::Unknown { opcode: Some(10) }
        );
        ping.extend_from_slice(&0xcafe_u32.to_be_bytes());
        assert_eq!(
            HostMessage::parse(&ping),
            HostMessage::PingPong { ping_id: 0xcafe }
        );
    }

    #[test]
    fn test_near_miss_marker_is_not_ack() {
        assert_ne!(
            HostMessage::parse(b"Hey OVR =D 4"),
            HostMessage::DiscoveryAck
        );
    }
}
