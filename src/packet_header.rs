use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;

use crate::checksum::fletcher16_with_zeroed;

pub const PROTOCOL_VERSION: u8 = 1;

/// The kind of a frame on the wire. Every frame carries exactly one of these; dispatch in
///  the receive loop matches exhaustively, so adding a kind forces every match site to be
///  revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Input = 0,
    Ping = 1,
    Report = 2,
    Video = 3,
    Audio = 4,
    Pong = 5,
    Control = 6,
    Fec = 7,
    Screen = 8,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const IS_KEYFRAME = 0b0000_0001;
        const IS_LOSSLESS = 0b0000_0010;
        const IS_PARTIAL  = 0b0000_0100;
    }
}

/// Dirty-region metadata for partial frame updates. All-zero when a frame has no region
///  attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyRect {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}
impl DirtyRect {
    pub const ZERO: DirtyRect = DirtyRect { x: 0, y: 0, w: 0, h: 0 };
}

/// The fixed 29-byte frame header. All multi-byte fields are serialized big-endian; see the
///  crate documentation for the byte-level layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    /// identifies one logical message across all of its chunks; wraps at `u32::MAX`
    pub sequence: u32,
    /// sender-side send time in millis since the epoch; echoed verbatim in a Pong
    pub timestamp_ms: u64,
    /// Fletcher-16 over the whole frame with this field zeroed during computation
    pub checksum: u16,
    pub total_chunks: u16,
    pub chunk_id: u16,
    pub rect: DirtyRect,
}

impl PacketHeader {
    pub const SERIALIZED_LEN: usize = 29;
    pub const CHECKSUM_OFFSET: usize = 15;

    pub fn new(
        packet_type: PacketType,
        flags: PacketFlags,
        sequence: u32,
        timestamp_ms: u64,
        total_chunks: u16,
        chunk_id: u16,
        rect: DirtyRect,
    ) -> PacketHeader {
        PacketHeader {
            version: PROTOCOL_VERSION,
            packet_type,
            flags,
            sequence,
            timestamp_ms,
            checksum: 0,
            total_chunks,
            chunk_id,
            rect,
        }
    }

    /// Serializes the header. Writing into a buffer with less than [`Self::SERIALIZED_LEN`]
    ///  bytes remaining is a programmer error and panics.
    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.sequence);
        buf.put_u64(self.timestamp_ms);
        buf.put_u16(self.checksum);
        buf.put_u16(self.total_chunks);
        buf.put_u16(self.chunk_id);
        buf.put_u16(self.rect.x);
        buf.put_u16(self.rect.y);
        buf.put_u16(self.rect.w);
        buf.put_u16(self.rect.h);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let version = buf.try_get_u8()?;
        let raw_type = buf.try_get_u8()?;
        let Ok(packet_type) = PacketType::try_from_primitive(raw_type) else {
            bail!("unsupported packet type {}", raw_type);
        };
        let flags = PacketFlags::from_bits_retain(buf.try_get_u8()?);
        let sequence = buf.try_get_u32()?;
        let timestamp_ms = buf.try_get_u64()?;
        let checksum = buf.try_get_u16()?;
        let total_chunks = buf.try_get_u16()?;
        let chunk_id = buf.try_get_u16()?;
        let rect = DirtyRect {
            x: buf.try_get_u16()?,
            y: buf.try_get_u16()?,
            w: buf.try_get_u16()?,
            h: buf.try_get_u16()?,
        };

        Ok(PacketHeader {
            version,
            packet_type,
            flags,
            sequence,
            timestamp_ms,
            checksum,
            total_chunks,
            chunk_id,
            rect,
        })
    }
}

/// Computes the frame checksum (header with the checksum field zeroed, plus payload) and
///  writes it back into the frame. The frame must hold at least a full header.
pub fn write_checksum(frame: &mut [u8]) {
    assert!(frame.len() >= PacketHeader::SERIALIZED_LEN, "frame shorter than a header");

    let sum = fletcher16_with_zeroed(
        frame,
        PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 2,
    );
    frame[PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 2]
        .copy_from_slice(&sum.to_be_bytes());
}

/// Recomputes the checksum of a received frame and compares it against the stored field.
pub fn is_checksum_valid(frame: &[u8]) -> bool {
    if frame.len() < PacketHeader::SERIALIZED_LEN {
        return false;
    }

    let stored = u16::from_be_bytes([
        frame[PacketHeader::CHECKSUM_OFFSET],
        frame[PacketHeader::CHECKSUM_OFFSET + 1],
    ]);
    let computed = fletcher16_with_zeroed(
        frame,
        PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 2,
    );
    stored == computed
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn header(packet_type: PacketType, sequence: u32, timestamp_ms: u64, total_chunks: u16, chunk_id: u16) -> PacketHeader {
        PacketHeader::new(packet_type, PacketFlags::empty(), sequence, timestamp_ms, total_chunks, chunk_id, DirtyRect::ZERO)
    }

    #[rstest]
    #[case::minimal(header(PacketType::Ping, 0, 0, 1, 0))]
    #[case::wrapped_sequence(header(PacketType::Video, u32::MAX, 1234, 7, 3))]
    #[case::max_timestamp(header(PacketType::Audio, 1, u64::MAX, 1, 0))]
    #[case::max_chunks(header(PacketType::Screen, 99, 5, u16::MAX, u16::MAX - 1))]
    fn test_ser_deser_roundtrip(#[case] original: PacketHeader) {
        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        assert_eq!(buf.len(), PacketHeader::SERIALIZED_LEN);

        let mut b: &[u8] = &buf;
        let deser = PacketHeader::deser(&mut b).unwrap();
        assert!(b.is_empty());
        assert_eq!(deser, original);
    }

    #[test]
    fn test_roundtrip_flags_and_rect() {
        let mut original = header(PacketType::Screen, 17, 42, 4, 2);
        original.flags = PacketFlags::IS_KEYFRAME | PacketFlags::IS_PARTIAL;
        original.rect = DirtyRect { x: 10, y: 20, w: 640, h: 480 };
        original.checksum = 0xabcd;

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let deser = PacketHeader::deser(&mut &buf[..]).unwrap();
        assert_eq!(deser, original);
    }

    #[test]
    fn test_unknown_flag_bits_survive_roundtrip() {
        let mut original = header(PacketType::Input, 1, 2, 1, 0);
        original.flags = PacketFlags::from_bits_retain(0b1010_0001);

        let mut buf = BytesMut::new();
        original.ser(&mut buf);
        let deser = PacketHeader::deser(&mut &buf[..]).unwrap();
        assert_eq!(deser.flags.bits(), 0b1010_0001);
        assert!(deser.flags.contains(PacketFlags::IS_KEYFRAME));
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one_byte(1)]
    #[case::one_short(PacketHeader::SERIALIZED_LEN - 1)]
    fn test_deser_truncated(#[case] len: usize) {
        let mut buf = BytesMut::new();
        header(PacketType::Control, 1, 2, 1, 0).ser(&mut buf);

        let mut b: &[u8] = &buf[..len];
        assert!(PacketHeader::deser(&mut b).is_err());
    }

    #[test]
    fn test_deser_unsupported_packet_type() {
        let mut buf = BytesMut::new();
        header(PacketType::Ping, 1, 2, 1, 0).ser(&mut buf);
        buf[1] = 200;

        assert!(PacketHeader::deser(&mut &buf[..]).is_err());
    }

    fn checksummed_frame(payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        let mut h = header(PacketType::Video, 123456, 98765, 3, 1);
        h.flags = PacketFlags::IS_KEYFRAME;
        h.ser(&mut buf);
        buf.extend_from_slice(payload);

        let mut frame = buf.to_vec();
        write_checksum(&mut frame);
        frame
    }

    #[test]
    fn test_write_checksum_validates() {
        let frame = checksummed_frame(b"some payload bytes");
        assert!(is_checksum_valid(&frame));
    }

    #[test]
    fn test_checksum_stored_big_endian_at_fixed_offset() {
        let frame = checksummed_frame(b"xyz");
        let stored = u16::from_be_bytes([frame[15], frame[16]]);
        assert_eq!(
            stored,
            crate::checksum::fletcher16_with_zeroed(&frame, 15..17)
        );
    }

    #[test]
    fn test_single_byte_corruption_is_detected() {
        let frame = checksummed_frame(b"the quick brown fox");

        for idx in 0..frame.len() {
            if (PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 2).contains(&idx) {
                continue;
            }
            let mut corrupted = frame.clone();
            // 0x5a never maps 0x00 <-> 0xff, the one byte-pair Fletcher-16 cannot tell apart
            corrupted[idx] ^= 0x5a;
            assert!(!is_checksum_valid(&corrupted), "corruption at byte {} went undetected", idx);
        }
    }

    #[test]
    fn test_corrupted_checksum_field_is_detected() {
        let frame = checksummed_frame(b"payload");
        for idx in PacketHeader::CHECKSUM_OFFSET..PacketHeader::CHECKSUM_OFFSET + 2 {
            let mut corrupted = frame.clone();
            corrupted[idx] ^= 0x5a;
            assert!(!is_checksum_valid(&corrupted));
        }
    }

    #[test]
    fn test_short_frame_is_never_valid() {
        assert!(!is_checksum_valid(b"too short"));
    }
}
