//! Single-loss forward error correction: one parity frame per contiguous batch of data
//!  chunks, built as the byte-wise XOR of the batch's payloads (each zero-padded to the
//!  longest among them). Exactly one lost chunk per batch can be rebuilt; losing two or
//!  more leaves the batch unrecoverable and those bytes are gone.
//!
//! The sender must keep a batch's chunk ids contiguous and must use the same
//!  `fec_group_size` as the receiver - both are what makes the missing chunk id derivable
//!  from the id range alone. A recovered payload keeps the zero padding if the lost chunk
//!  was shorter than the longest of its batch (only ever the final chunk of a message);
//!  the media layers above carry their own length framing.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::buffers::atomic_map::AtomicMap;
use crate::packet::Packet;
use crate::packet_header::{DirtyRect, PacketHeader, PacketType};

/// Builds the parity frame protecting one batch of data chunks.
///
/// All chunks must belong to the same message and cover contiguous ascending chunk ids -
///  violating that is a bug in the calling send path, not a network condition.
pub fn create_parity(chunks: &[Packet]) -> anyhow::Result<Packet> {
    let first = match chunks.first() {
        Some(first) => first,
        None => bail!("cannot build parity over an empty batch"),
    };

    for (offset, chunk) in chunks.iter().enumerate() {
        if chunk.header.sequence != first.header.sequence {
            bail!("parity batch mixes messages {} and {}", first.header.sequence, chunk.header.sequence);
        }
        if chunk.header.chunk_id != first.header.chunk_id + offset as u16 {
            bail!("parity batch chunk ids are not contiguous at chunk {}", chunk.header.chunk_id);
        }
    }

    let parity_len = chunks.iter().map(|c| c.payload.len()).max().unwrap_or(0);
    let mut parity = vec![0u8; parity_len];
    for chunk in chunks {
        xor_into(&mut parity, &chunk.payload);
    }

    let header = PacketHeader::new(
        PacketType::Fec,
        first.header.flags,
        first.header.sequence,
        first.header.timestamp_ms,
        first.header.total_chunks,
        first.header.chunk_id,
        DirtyRect::ZERO,
    );
    Ok(Packet::new(header, Bytes::from(parity)))
}

fn xor_into(acc: &mut [u8], data: &[u8]) {
    for (acc_byte, data_byte) in acc.iter_mut().zip(data) {
        *acc_byte ^= data_byte;
    }
}

/// One batch of data chunks plus (optionally) its parity frame, as seen by the receiver.
pub struct FecGroup {
    start_chunk_id: u16,
    expected_chunks: u16,
    chunks: FxHashMap<u16, Packet>,
    parity: Option<Packet>,
}

impl FecGroup {
    pub fn new(start_chunk_id: u16, expected_chunks: u16) -> FecGroup {
        FecGroup {
            start_chunk_id,
            expected_chunks,
            chunks: FxHashMap::default(),
            parity: None,
        }
    }

    /// adds a received data chunk; duplicates and ids outside the batch are ignored
    pub fn add_chunk(&mut self, chunk: &Packet) {
        let chunk_id = chunk.header.chunk_id;
        if chunk_id < self.start_chunk_id || chunk_id >= self.start_chunk_id + self.expected_chunks {
            debug!("chunk {} is outside its batch [{}, {}) - ignoring", chunk_id, self.start_chunk_id, self.start_chunk_id + self.expected_chunks);
            return;
        }
        self.chunks.entry(chunk_id).or_insert_with(|| chunk.clone());
    }

    pub fn set_parity(&mut self, parity: Packet) {
        self.parity.get_or_insert(parity);
    }

    /// true once every data chunk of the batch has arrived - nothing left to recover
    pub fn is_complete(&self) -> bool {
        self.chunks.len() == self.expected_chunks as usize
    }

    /// recoverable iff the parity frame is here and exactly one data chunk is not
    pub fn can_recover(&self) -> bool {
        self.parity.is_some() && self.chunks.len() + 1 == self.expected_chunks as usize
    }

    /// Rebuilds the one missing chunk by XOR-ing the parity payload with every present
    ///  chunk's payload. The missing chunk id is the unique id of the batch's range that
    ///  never arrived; header fields come from the parity frame's batch metadata, the
    ///  packet type from a present sibling.
    pub fn recover(&self) -> Option<Packet> {
        if !self.can_recover() {
            return None;
        }
        let parity = self.parity.as_ref()?;

        let missing_id = (self.start_chunk_id..self.start_chunk_id + self.expected_chunks)
            .find(|chunk_id| !self.chunks.contains_key(chunk_id))?;

        let mut payload = parity.payload.to_vec();
        for chunk in self.chunks.values() {
            xor_into(&mut payload, &chunk.payload);
        }

        // expected_chunks >= 2, so at least one sibling is present here
        let sibling = self.chunks.values().next()?;

        let header = PacketHeader::new(
            sibling.header.packet_type,
            parity.header.flags,
            parity.header.sequence,
            parity.header.timestamp_ms,
            parity.header.total_chunks,
            missing_id,
            DirtyRect::ZERO,
        );
        trace!("recovered chunk {} of message {}", missing_id, parity.header.sequence);

        Some(Packet {
            header,
            payload: Bytes::from(payload),
            sender: sibling.sender,
        })
    }
}

/// Receive-side tracking of FEC batches, keyed by `(sequence, start chunk id)`. Groups are
///  bounded in number and evicted by age, like reassembly groups.
pub(crate) struct FecBuffer {
    groups: AtomicMap<(u32, u16), (Instant, Arc<Mutex<FecGroup>>)>,
    group_size: u16,
    max_groups: usize,
    max_age: Duration,
}

impl FecBuffer {
    pub fn new(group_size: u16, max_groups: usize, max_age: Duration) -> FecBuffer {
        FecBuffer {
            groups: AtomicMap::new(),
            group_size,
            max_groups,
            max_age,
        }
    }

    /// Tracks a received data chunk; returns a freshly recovered sibling if this chunk was
    ///  the last piece the batch's parity was waiting for.
    pub fn on_data_chunk(&self, chunk: &Packet, now: Instant) -> Option<Packet> {
        let total_chunks = chunk.header.total_chunks;
        if total_chunks <= 1 {
            return None;
        }

        let start_chunk_id = chunk.header.chunk_id - chunk.header.chunk_id % self.group_size;
        let expected = self.expected_chunks(start_chunk_id, total_chunks)?;
        if expected < 2 {
            // a trailing batch of one chunk is never parity-protected
            return None;
        }

        let key = (chunk.header.sequence, start_chunk_id);
        let group = self.get_or_create(key, expected, now);

        let (recovered, retire) = {
            let mut group = group.lock().unwrap();
            group.add_chunk(chunk);
            if group.is_complete() {
                (None, true)
            }
            else {
                let recovered = group.recover();
                let retire = recovered.is_some();
                (recovered, retire)
            }
        };

        if retire {
            self.groups.update(|m| {
                m.remove(&key);
            });
        }
        recovered
    }

    /// Tracks a received parity frame; returns the recovered chunk if exactly one data
    ///  chunk of the batch is still missing.
    pub fn on_parity(&self, parity: Packet, now: Instant) -> Option<Packet> {
        let start_chunk_id = parity.header.chunk_id;
        let expected = self.expected_chunks(start_chunk_id, parity.header.total_chunks)?;
        if expected < 2 || start_chunk_id % self.group_size != 0 {
            debug!("implausible parity frame for batch at chunk {} - dropping", start_chunk_id);
            return None;
        }

        let key = (parity.header.sequence, start_chunk_id);
        let group = self.get_or_create(key, expected, now);

        let (recovered, retire) = {
            let mut group = group.lock().unwrap();
            group.set_parity(parity);
            if group.is_complete() {
                (None, true)
            }
            else {
                let recovered = group.recover();
                let retire = recovered.is_some();
                (recovered, retire)
            }
        };

        if retire {
            self.groups.update(|m| {
                m.remove(&key);
            });
        }
        recovered
    }

    /// data-chunk count of the batch starting at `start_chunk_id`, or None if the start is
    ///  out of range
    fn expected_chunks(&self, start_chunk_id: u16, total_chunks: u16) -> Option<u16> {
        if start_chunk_id >= total_chunks {
            return None;
        }
        Some((total_chunks - start_chunk_id).min(self.group_size))
    }

    fn get_or_create(&self, key: (u32, u16), expected: u16, now: Instant) -> Arc<Mutex<FecGroup>> {
        match self.groups.get(&key) {
            Some((_, group)) => group,
            None => {
                self.evict(now);
                let group = Arc::new(Mutex::new(FecGroup::new(key.1, expected)));
                let entry = (now, group.clone());
                self.groups.update(move |m| {
                    m.entry(key).or_insert_with(|| entry.clone());
                });
                group
            }
        }
    }

    #[cfg(test)]
    pub fn tracked_groups(&self) -> usize {
        self.groups.len()
    }

    fn evict(&self, now: Instant) {
        let snapshot = self.groups.load();

        let expired: Vec<(u32, u16)> = snapshot
            .iter()
            .filter(|(_, (created_at, _))| now.saturating_duration_since(*created_at) > self.max_age)
            .map(|(&key, _)| key)
            .collect();
        if !expired.is_empty() {
            debug!("evicting {} stalled FEC batches", expired.len());
            self.groups.update(|m| {
                for key in &expired {
                    m.remove(key);
                }
            });
        }

        if snapshot.len() - expired.len() >= self.max_groups {
            let oldest = snapshot
                .iter()
                .filter(|&(key, _)| !expired.contains(key))
                .min_by_key(|(_, (created_at, _))| *created_at)
                .map(|(&key, _)| key);
            if let Some(key) = oldest {
                debug!("FEC batch limit reached: evicting oldest batch {:?}", key);
                self.groups.update(|m| {
                    m.remove(&key);
                });
            }
        }
    }
}
