//! Packet framing for the RPC channel
//!
//! Every ring slot carrying RPC traffic starts with a fixed 64-byte V1
//! header, little-endian, no padding between fields on the wire:
//!
//! | field            | bytes | meaning                                        |
//! |------------------|-------|------------------------------------------------|
//! | `msg_type`       | 1     | 1 = request, 2 = response, 3 = error           |
//! | `msg_id`         | 8     | sender's id for this message                   |
//! | `payload_size`   | 4     | total bytes in the message (not this packet)   |
//! | `current_packet` | 2     | 1-based index of this packet                   |
//! | `total_packets`  | 2     | packet count for the whole message             |
//! | `response_id`    | 8     | for replies: the peer `msg_id` answered; else 0|
//! | reserved         | 39    | zero, headroom for future fields               |

use crate::{IpcError, Result};
use bytes::{Buf, BufMut};

/// Fixed wire size of the packet header
pub const HEADER_SIZE: usize = 64;

/// Smallest legal per-node capacity for an RPC ring
pub const MIN_NODE_CAPACITY: u32 = 256;

/// Largest legal per-node capacity for an RPC ring
pub const MAX_NODE_CAPACITY: u32 = 1_048_576;

/// Message kinds carried on the wire
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Request = 1,
    Response = 2,
    Error = 3,
}

impl TryFrom<u8> for PacketKind {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        match value {
            1 => Ok(PacketKind::Request),
            2 => Ok(PacketKind::Response),
            3 => Ok(PacketKind::Error),
            other => Err(other),
        }
    }
}

/// Parsed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketKind,
    pub msg_id: u64,
    pub payload_size: u32,
    pub current_packet: u16,
    pub total_packets: u16,
    pub response_id: u64,
}

impl PacketHeader {
    /// Serialize to the fixed wire layout (reserved bytes zeroed)
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        let mut buf = &mut bytes[..];
        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.msg_id);
        buf.put_u32_le(self.payload_size);
        buf.put_u16_le(self.current_packet);
        buf.put_u16_le(self.total_packets);
        buf.put_u64_le(self.response_id);
        bytes
    }

    /// Parse and validate a header from the start of a packet
    pub fn from_bytes(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(IpcError::MalformedFrame(format!(
                "packet of {} bytes is shorter than the header",
                src.len()
            )));
        }

        let mut buf = &src[..HEADER_SIZE];
        let kind = PacketKind::try_from(buf.get_u8())
            .map_err(|v| IpcError::MalformedFrame(format!("unknown message type {}", v)))?;
        let header = Self {
            kind,
            msg_id: buf.get_u64_le(),
            payload_size: buf.get_u32_le(),
            current_packet: buf.get_u16_le(),
            total_packets: buf.get_u16_le(),
            response_id: buf.get_u64_le(),
        };

        if header.total_packets == 0 {
            return Err(IpcError::MalformedFrame(
                "total_packets is zero".to_string(),
            ));
        }
        if header.current_packet == 0 || header.current_packet > header.total_packets {
            return Err(IpcError::MalformedFrame(format!(
                "packet index {} outside 1..={}",
                header.current_packet, header.total_packets
            )));
        }
        Ok(header)
    }

    /// Body bytes this packet carries, per its position in the message
    pub fn body_len(&self, body_per_packet: usize) -> usize {
        let payload = self.payload_size as usize;
        if self.total_packets == 1 {
            payload
        } else if self.current_packet < self.total_packets {
            body_per_packet
        } else {
            match payload % body_per_packet {
                0 => body_per_packet,
                rem => rem,
            }
        }
    }
}

/// Message body bytes that fit in one node alongside the header
pub fn body_per_packet(node_capacity: usize) -> usize {
    debug_assert!(node_capacity > HEADER_SIZE);
    node_capacity - HEADER_SIZE
}

/// Packets needed for a payload; zero-length payloads still take one packet
pub fn packet_count(payload_len: usize, body_per_packet: usize) -> Result<u16> {
    let total = payload_len.div_ceil(body_per_packet).max(1);
    u16::try_from(total).map_err(|_| IpcError::OutOfRange {
        what: "total_packets",
        value: total as u64,
        min: 1,
        max: u16::MAX as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PacketHeader {
        PacketHeader {
            kind: PacketKind::Response,
            msg_id: 0x1122_3344_5566_7788,
            payload_size: 4096,
            current_packet: 3,
            total_packets: 22,
            response_id: 99,
        }
    }

    #[test]
    fn test_roundtrip() {
        let header = sample();
        let bytes = header.to_bytes();
        assert_eq!(PacketHeader::from_bytes(&bytes).unwrap(), header);
        // Reserved tail stays zero on the wire.
        assert!(bytes[25..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_wire_layout() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..9], &0x1122_3344_5566_7788u64.to_le_bytes());
        assert_eq!(&bytes[9..13], &4096u32.to_le_bytes());
        assert_eq!(&bytes[13..15], &3u16.to_le_bytes());
        assert_eq!(&bytes[15..17], &22u16.to_le_bytes());
        assert_eq!(&bytes[17..25], &99u64.to_le_bytes());
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(matches!(
            PacketHeader::from_bytes(&[0u8; 10]),
            Err(IpcError::MalformedFrame(_))
        ));

        let mut bytes = sample().to_bytes();
        bytes[0] = 7;
        assert!(matches!(
            PacketHeader::from_bytes(&bytes),
            Err(IpcError::MalformedFrame(_))
        ));

        let mut zero_total = sample();
        zero_total.total_packets = 0;
        assert!(PacketHeader::from_bytes(&zero_total.to_bytes()).is_err());

        let mut past_end = sample();
        past_end.current_packet = 23;
        assert!(PacketHeader::from_bytes(&past_end.to_bytes()).is_err());
    }

    #[test]
    fn test_packet_count() {
        let body = body_per_packet(256);
        assert_eq!(body, 192);
        assert_eq!(packet_count(0, body).unwrap(), 1);
        assert_eq!(packet_count(1, body).unwrap(), 1);
        assert_eq!(packet_count(192, body).unwrap(), 1);
        assert_eq!(packet_count(193, body).unwrap(), 2);
        // The large-message scenario from the wire contract.
        assert_eq!(packet_count(524_288, body).unwrap(), 2731);
    }

    #[test]
    fn test_body_len_rules() {
        let body = body_per_packet(256);
        let mut h = sample();

        h.total_packets = 1;
        h.current_packet = 1;
        h.payload_size = 0;
        assert_eq!(h.body_len(body), 0);
        h.payload_size = 100;
        assert_eq!(h.body_len(body), 100);

        h.payload_size = 500;
        h.total_packets = 3;
        h.current_packet = 2;
        assert_eq!(h.body_len(body), 192);
        h.current_packet = 3;
        assert_eq!(h.body_len(body), 500 - 2 * 192);

        // Exact multiple: the final packet carries a full body.
        h.payload_size = 384;
        h.total_packets = 2;
        h.current_packet = 2;
        assert_eq!(h.body_len(body), 192);
    }
}
