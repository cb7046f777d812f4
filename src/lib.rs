//! Unreliable, low-latency UDP transport underneath a real-time screen / audio / input
//!  mirroring tool: a fixed binary framing format over raw UDP with checksum validation,
//!  fragmentation and reassembly of messages above the MTU, a single-loss XOR
//!  forward-error-correction scheme, and derived link telemetry (RTT, loss, bitrate).
//!
//! ## Design goals
//!
//! * Low latency beats completeness: there is no retransmission, no ACK machinery and no
//!   congestion control. A lost chunk is either recovered from a parity frame or it is gone,
//!   and the application (video keyframes, Opus packet loss concealment, ...) absorbs the rest.
//! * All frames go through a single UDP socket per peer; destinations are explicit, there is
//!   no concept of a connection or handshake at this layer.
//! * Corrupt or unparseable frames are dropped silently - the sender is never notified.
//! * Send buffers are pooled and reused to keep the per-frame allocation cost near zero.
//!
//! Capture, encoding, input injection, peer discovery and configuration storage all live
//!  above or beside this crate; they interact with it only through [`peer::Peer`] and
//!  [`packet_dispatcher::PacketDispatcher`].
//!
//! ## Frame layout
//!
//! One UDP datagram carries exactly one frame: a fixed 29-byte header followed by raw
//!  payload bytes. All multi-byte fields are big-endian:
//!
//! ```ascii
//!  0: protocol version (u8)
//!  1: packet type (u8):
//!     0 Input, 1 Ping, 2 Report, 3 Video, 4 Audio, 5 Pong, 6 Control, 7 Fec, 8 Screen
//!  2: flags (u8): bit 0 keyframe, bit 1 lossless, bit 2 partial frame
//!  3: sequence number (u32) - identifies one logical message across all of its chunks;
//!     wraps at u32::MAX
//!  7: timestamp (u64) - sender-side send time in millis since the epoch; a Pong echoes
//!     the Ping's timestamp verbatim, which is what RTT measurement is built on
//! 15: checksum (u16) - Fletcher-16 over the entire frame with this field zeroed
//! 17: total chunks (u16) - number of chunks in this message, >= 1
//! 19: chunk id (u16) - 0-based index of this chunk, < total chunks
//! 21: dirty rect x, y, w, h (4 x u16) - region metadata for partial frame updates,
//!     zero when unused
//! 29: payload ...
//! ```
//!
//! A frame never exceeds the configured MTU (1400 bytes by default, header included).
//!
//! ## Parity frames
//!
//! A parity frame (packet type `Fec`) protects one contiguous batch of data chunks of a
//!  single message. Its payload is the byte-wise XOR of the batch's payloads, each padded
//!  with zeroes to the longest among them. The header carries the protected message's
//!  sequence number, total chunk count and timestamp; `chunk id` holds the *first* chunk id
//!  of the batch. Batch size is `fec_group_size` from the configuration (the final batch of
//!  a message may be smaller), and sender and receiver must be configured identically -
//!  together with the requirement that a batch covers contiguous chunk ids, this is what
//!  makes the missing chunk id derivable on the receiving side.
//!
//! Exactly one missing chunk per batch can be recovered. If two or more chunks of a batch
//!  are lost, the batch is unrecoverable and the reassembly group for its message stalls
//!  until it is evicted.

pub mod buffers;
pub mod config;
pub mod fec;
pub mod packet;
pub mod packet_dispatcher;
pub mod packet_header;
pub mod peer;
pub mod safe_converter;
pub mod send_pipeline;
pub mod telemetry;

mod checksum;
mod reassembly;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
