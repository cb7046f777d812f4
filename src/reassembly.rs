use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::buffers::atomic_map::AtomicMap;
use crate::packet::Packet;

/// Accumulates the chunks of one logical message, keyed by chunk id. Lives from the first
///  chunk's arrival until the message completes or the group is evicted.
struct ReassemblyGroup {
    /// header of the first chunk that arrived, reused for the delivered packet
    template: Packet,
    chunks: FxHashMap<u16, Bytes>,
}

impl ReassemblyGroup {
    fn new(first: &Packet) -> ReassemblyGroup {
        ReassemblyGroup {
            template: first.clone(),
            chunks: FxHashMap::default(),
        }
    }

    /// inserts a chunk; a duplicate id is ignored
    fn insert(&mut self, chunk_id: u16, payload: Bytes) {
        self.chunks.entry(chunk_id).or_insert(payload);
    }

    fn is_complete(&self) -> bool {
        self.chunks.len() == self.template.header.total_chunks as usize
    }

    /// concatenates all chunk payloads in ascending chunk id order into one packet carrying
    ///  the original header
    fn assemble(&self) -> Packet {
        let total_len = self.chunks.values().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(total_len);
        for chunk_id in 0..self.template.header.total_chunks {
            payload.extend_from_slice(&self.chunks[&chunk_id]);
        }

        let mut header = self.template.header.clone();
        header.chunk_id = 0;

        Packet {
            header,
            payload: payload.freeze(),
            sender: self.template.sender,
        }
    }
}

/// The per-sequence-number reassembly state machine: no entry -> collecting -> complete.
///
/// Stalled groups do not live forever - the tracked-group count is bounded and incomplete
///  groups are evicted by age, so sustained loss cannot exhaust memory.
pub(crate) struct ReassemblyBuffer {
    groups: AtomicMap<u32, (Instant, Arc<Mutex<ReassemblyGroup>>)>,
    max_groups: usize,
    max_age: Duration,
}

impl ReassemblyBuffer {
    pub fn new(max_groups: usize, max_age: Duration) -> ReassemblyBuffer {
        ReassemblyBuffer {
            groups: AtomicMap::new(),
            max_groups,
            max_age,
        }
    }

    /// Feeds one data chunk in; returns the fully reassembled message once its last chunk
    ///  arrives. Single-chunk messages are passed through without touching the group map.
    pub fn on_chunk(&self, packet: Packet, now: Instant) -> Option<Packet> {
        if packet.header.total_chunks <= 1 {
            trace!("single-chunk message {} delivered directly", packet.header.sequence);
            return Some(packet);
        }

        let sequence = packet.header.sequence;
        let group = match self.groups.get(&sequence) {
            Some((_, group)) => group,
            None => {
                self.evict(now);
                let group = Arc::new(Mutex::new(ReassemblyGroup::new(&packet)));
                let entry = (now, group.clone());
                self.groups.update(move |m| {
                    m.entry(sequence).or_insert_with(|| entry.clone());
                });
                group
            }
        };

        let complete = {
            let mut group = group.lock().unwrap();
            group.insert(packet.header.chunk_id, packet.payload.clone());
            group.is_complete().then(|| group.assemble())
        };

        if complete.is_some() {
            trace!("message {} complete", sequence);
            self.groups.update(|m| {
                m.remove(&sequence);
            });
        }
        complete
    }

    #[cfg(test)]
    pub fn tracked_groups(&self) -> usize {
        self.groups.len()
    }

    /// Drops incomplete groups that aged out, and the oldest group if the count cap is
    ///  reached anyway. Runs on the group-creation path, so a stream without new messages
    ///  costs nothing.
    fn evict(&self, now: Instant) {
        let snapshot = self.groups.load();

        let expired: Vec<u32> = snapshot
            .iter()
            .filter(|(_, (created_at, _))| now.saturating_duration_since(*created_at) > self.max_age)
            .map(|(&sequence, _)| sequence)
            .collect();
        if !expired.is_empty() {
            debug!("evicting {} stalled reassembly groups", expired.len());
            self.groups.update(|m| {
                for sequence in &expired {
                    m.remove(sequence);
                }
            });
        }

        if snapshot.len() - expired.len() >= self.max_groups {
            let oldest = snapshot
                .iter()
                .filter(|&(sequence, _)| !expired.contains(sequence))
                .min_by_key(|(_, (created_at, _))| *created_at)
                .map(|(&sequence, _)| sequence);
            if let Some(sequence) = oldest {
                debug!("reassembly group limit reached: evicting oldest group {}", sequence);
                self.groups.update(|m| {
                    m.remove(&sequence);
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::net::SocketAddr;

    use super::*;
    use crate::packet_header::{DirtyRect, PacketFlags, PacketHeader, PacketType};

    fn chunk(sequence: u32, total_chunks: u16, chunk_id: u16, payload: &[u8]) -> Packet {
        let header = PacketHeader::new(
            PacketType::Video,
            PacketFlags::empty(),
            sequence,
            1234,
            total_chunks,
            chunk_id,
            DirtyRect::ZERO,
        );
        Packet::received(
            header,
            Bytes::copy_from_slice(payload),
            SocketAddr::from_str("127.0.0.1:9999").unwrap(),
        )
    }

    fn buffer() -> ReassemblyBuffer {
        ReassemblyBuffer::new(16, Duration::from_secs(3))
    }

    #[test]
    fn test_single_chunk_bypasses_the_map() {
        let buffer = buffer();
        let now = Instant::now();

        let delivered = buffer.on_chunk(chunk(1, 1, 0, b"solo"), now).unwrap();
        assert_eq!(delivered.payload.as_ref(), b"solo");
        assert_eq!(buffer.tracked_groups(), 0);
    }

    #[test]
    fn test_out_of_order_chunks_reassemble() {
        let buffer = buffer();
        let now = Instant::now();

        assert!(buffer.on_chunk(chunk(7, 3, 2, b"!"), now).is_none());
        assert!(buffer.on_chunk(chunk(7, 3, 0, b"hello "), now).is_none());
        let delivered = buffer.on_chunk(chunk(7, 3, 1, b"world"), now).unwrap();

        assert_eq!(delivered.payload.as_ref(), b"hello world!");
        assert_eq!(delivered.header.sequence, 7);
        assert_eq!(delivered.header.total_chunks, 3);
        assert_eq!(delivered.header.chunk_id, 0);
        assert_eq!(buffer.tracked_groups(), 0);
    }

    #[test]
    fn test_duplicate_chunk_is_ignored() {
        let buffer = buffer();
        let now = Instant::now();

        assert!(buffer.on_chunk(chunk(7, 2, 0, b"first"), now).is_none());
        assert!(buffer.on_chunk(chunk(7, 2, 0, b"DIFFERENT"), now).is_none());
        let delivered = buffer.on_chunk(chunk(7, 2, 1, b" second"), now).unwrap();

        assert_eq!(delivered.payload.as_ref(), b"first second");
    }

    #[test]
    fn test_interleaved_messages() {
        let buffer = buffer();
        let now = Instant::now();

        assert!(buffer.on_chunk(chunk(1, 2, 0, b"a"), now).is_none());
        assert!(buffer.on_chunk(chunk(2, 2, 0, b"x"), now).is_none());
        assert_eq!(buffer.on_chunk(chunk(2, 2, 1, b"y"), now).unwrap().payload.as_ref(), b"xy");
        assert_eq!(buffer.on_chunk(chunk(1, 2, 1, b"b"), now).unwrap().payload.as_ref(), b"ab");
    }

    #[test]
    fn test_stalled_group_is_evicted_by_age() {
        let buffer = buffer();
        let now = Instant::now();

        assert!(buffer.on_chunk(chunk(1, 2, 0, b"a"), now).is_none());
        assert_eq!(buffer.tracked_groups(), 1);

        // a new group arriving after the age limit sweeps the stalled one out
        let later = now + Duration::from_secs(4);
        assert!(buffer.on_chunk(chunk(2, 2, 0, b"x"), later).is_none());
        assert_eq!(buffer.tracked_groups(), 1);

        // the late chunk of the evicted message starts a fresh, incomplete group
        assert!(buffer.on_chunk(chunk(1, 2, 1, b"b"), later).is_none());
    }

    #[test]
    fn test_group_count_is_bounded() {
        let buffer = ReassemblyBuffer::new(4, Duration::from_secs(3600));
        let now = Instant::now();

        for sequence in 0..10 {
            assert!(buffer
                .on_chunk(chunk(sequence, 2, 0, b"a"), now + Duration::from_millis(sequence as u64))
                .is_none());
        }
        assert_eq!(buffer.tracked_groups(), 4);

        // the oldest groups went first
        assert!(buffer.groups.get(&0).is_none());
        assert!(buffer.groups.get(&9).is_some());
    }
}
