use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::Bytes;

use crate::packet_header::PacketHeader;

/// One frame's worth of data above the codec: the decoded header, the payload bytes, and -
///  on the receive side - the datagram's source address.
///
/// The payload is a [`Bytes`] handle, so reassembly and FEC tracking can hold views of the
///  same bytes without copying.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
    pub sender: Option<SocketAddr>,
}

impl Packet {
    pub fn new(header: PacketHeader, payload: Bytes) -> Packet {
        Packet {
            header,
            payload,
            sender: None,
        }
    }

    pub fn received(header: PacketHeader, payload: Bytes, sender: SocketAddr) -> Packet {
        Packet {
            header,
            payload,
            sender: Some(sender),
        }
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .field("sender", &self.sender)
            .finish()
    }
}
