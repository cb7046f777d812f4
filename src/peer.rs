use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use anyhow::bail;
use bytes::{BufMut, Bytes};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::buffers::buffer_pool::BufferPool;
use crate::config::PeerConfig;
use crate::fec::{create_parity, FecBuffer};
use crate::packet::Packet;
use crate::packet_dispatcher::PacketDispatcher;
use crate::packet_header::{
    is_checksum_valid, write_checksum, DirtyRect, PacketFlags, PacketHeader, PacketType,
    PROTOCOL_VERSION,
};
use crate::reassembly::ReassemblyBuffer;
use crate::safe_converter::PrecheckedCast;
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::telemetry::{TelemetryCollector, TelemetrySnapshot};

/// Peer is the place where all other parts of the transport come together: it owns the UDP
///  socket, frames and sends payloads to explicit destinations, and runs the receive loop
///  that validates, classifies, reassembles and dispatches incoming frames.
///
/// Send methods may be called concurrently from any number of tasks; none of them ever
///  blocks the receive loop, whose only suspension points are the socket receive and the
///  shutdown signal.
pub struct Peer {
    receive_socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    dispatcher: Arc<dyn PacketDispatcher>,
    telemetry: Arc<TelemetryCollector>,
    buffer_pool: Arc<BufferPool>,
    reassembly: ReassemblyBuffer,
    fec: FecBuffer,
    next_sequence: AtomicU32,
    config: PeerConfig,
    shutdown_signal: Notify,
    is_shut_down: AtomicBool,
}

impl Peer {
    /// Binds the configured local address. Bind failures and invalid configurations are the
    ///  caller's problem; everything after construction is loss-tolerant.
    pub async fn bind(dispatcher: Arc<dyn PacketDispatcher>, config: PeerConfig) -> anyhow::Result<Peer> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.self_addr).await?);
        info!("bound transport socket to {:?}", UdpSocket::local_addr(&socket)?);

        Ok(Self::from_parts(socket.clone(), Arc::new(socket), dispatcher, config))
    }

    fn from_parts(
        receive_socket: Arc<UdpSocket>,
        send_socket: Arc<dyn SendSocket>,
        dispatcher: Arc<dyn PacketDispatcher>,
        config: PeerConfig,
    ) -> Peer {
        Peer {
            receive_socket,
            send_pipeline: Arc::new(SendPipeline::new(send_socket)),
            dispatcher,
            telemetry: Arc::new(TelemetryCollector::new()),
            buffer_pool: Arc::new(BufferPool::new(config.mtu, config.buffer_pool_size)),
            reassembly: ReassemblyBuffer::new(config.max_tracked_groups, config.group_max_age),
            fec: FecBuffer::new(config.fec_group_size, config.max_tracked_groups, config.group_max_age),
            next_sequence: AtomicU32::new(0),
            config,
            shutdown_signal: Notify::new(),
            is_shut_down: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        UdpSocket::local_addr(&self.receive_socket)
            .expect("UdpSocket should have an initialized local addr")
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    fn next_sequence(&self) -> u32 {
        // wraps at u32::MAX by design
        self.next_sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Sends one single-frame message. The payload must fit into one frame; bigger payloads
    ///  go through [`Self::send_data`]. Returns the sequence number used.
    pub async fn send_to(
        &self,
        packet_type: PacketType,
        flags: PacketFlags,
        rect: DirtyRect,
        payload: &[u8],
        to: SocketAddr,
    ) -> anyhow::Result<u32> {
        if payload.len() > self.config.max_payload() {
            bail!(
                "single-frame payload of {} bytes exceeds the {}-byte limit - use send_data",
                payload.len(),
                self.config.max_payload()
            );
        }

        let sequence = self.next_sequence();
        let header = PacketHeader::new(packet_type, flags, sequence, unix_millis(), 1, 0, rect);
        self.send_frame(&header, payload, to).await;
        Ok(sequence)
    }

    /// Sends one logical message, fragmented into as many chunks as the MTU requires. Chunks
    ///  travel as independent datagrams and may be lost or reordered independently; the
    ///  receiving side reassembles them by chunk id. Returns the message's sequence number.
    pub async fn send_data(
        &self,
        payload: &[u8],
        packet_type: PacketType,
        flags: PacketFlags,
        to: SocketAddr,
    ) -> anyhow::Result<u32> {
        let (sequence, total_chunks) = self.chunk_layout(payload)?;
        let timestamp_ms = unix_millis();

        for chunk_id in 0..total_chunks {
            let header = PacketHeader::new(
                packet_type,
                flags,
                sequence,
                timestamp_ms,
                total_chunks,
                chunk_id,
                DirtyRect::ZERO,
            );
            self.send_frame(&header, self.chunk_payload(payload, chunk_id), to).await;
        }
        Ok(sequence)
    }

    /// Like [`Self::send_data`], but every batch of `fec_group_size` chunks (and a trailing
    ///  batch of at least two) is followed by a parity frame, so the receiver survives the
    ///  loss of one chunk per batch.
    pub async fn send_data_with_parity(
        &self,
        payload: &[u8],
        packet_type: PacketType,
        flags: PacketFlags,
        to: SocketAddr,
    ) -> anyhow::Result<u32> {
        let (sequence, total_chunks) = self.chunk_layout(payload)?;
        let timestamp_ms = unix_millis();
        let shared_payload = Bytes::copy_from_slice(payload);
        let max_payload = self.config.max_payload();

        let mut batch: Vec<Packet> = Vec::with_capacity(self.config.fec_group_size as usize);
        for chunk_id in 0..total_chunks {
            let header = PacketHeader::new(
                packet_type,
                flags,
                sequence,
                timestamp_ms,
                total_chunks,
                chunk_id,
                DirtyRect::ZERO,
            );
            let start = chunk_id as usize * max_payload;
            let end = (start + max_payload).min(shared_payload.len());
            let chunk = Packet::new(header, shared_payload.slice(start..end));

            self.send_frame(&chunk.header, &chunk.payload, to).await;
            batch.push(chunk);

            if batch.len() == self.config.fec_group_size as usize || chunk_id + 1 == total_chunks {
                if batch.len() >= 2 {
                    let parity = create_parity(&batch)?;
                    self.send_frame(&parity.header, &parity.payload, to).await;
                }
                batch.clear();
            }
        }
        Ok(sequence)
    }

    /// Sends a Ping carrying the current time; the peer answers with a Pong echoing it,
    ///  which feeds one RTT sample into telemetry.
    pub async fn send_ping(&self, to: SocketAddr) -> anyhow::Result<u32> {
        self.send_to(PacketType::Ping, PacketFlags::empty(), DirtyRect::ZERO, &[], to).await
    }

    fn chunk_layout(&self, payload: &[u8]) -> anyhow::Result<(u32, u16)> {
        let max_payload = self.config.max_payload();
        let total_chunks = payload.len().div_ceil(max_payload).max(1);
        if total_chunks > u16::MAX as usize {
            bail!(
                "message of {} bytes would need {} chunks, more than a chunk id can address",
                payload.len(),
                total_chunks
            );
        }
        Ok((self.next_sequence(), total_chunks.prechecked_cast()))
    }

    fn chunk_payload<'a>(&self, payload: &'a [u8], chunk_id: u16) -> &'a [u8] {
        let max_payload = self.config.max_payload();
        let start = chunk_id as usize * max_payload;
        let end = (start + max_payload).min(payload.len());
        &payload[start..end]
    }

    /// Frames one payload (header, payload bytes, checksum) into a pooled buffer and hands
    ///  it to the socket. The buffer goes back to the pool on every path.
    async fn send_frame(&self, header: &PacketHeader, payload: &[u8], to: SocketAddr) {
        let mut buf = self.buffer_pool.rent(PacketHeader::SERIALIZED_LEN + payload.len());
        header.ser(&mut buf);
        buf.put_slice(payload);
        write_checksum(buf.as_mut());

        self.send_pipeline.send_frame(to, buf.as_ref()).await;
        self.telemetry.record_send(buf.len());
        self.buffer_pool.return_to_pool(buf);
    }

    /// Answers a Ping without blocking the receive loop: the Pong echoes the Ping's
    ///  timestamp and goes out as a fire-and-forget task.
    fn spawn_pong(&self, to: SocketAddr, echoed_timestamp_ms: u64) {
        let sequence = self.next_sequence();
        let pipeline = self.send_pipeline.clone();
        let pool = self.buffer_pool.clone();
        let telemetry = self.telemetry.clone();

        tokio::spawn(async move {
            let header = PacketHeader::new(
                PacketType::Pong,
                PacketFlags::empty(),
                sequence,
                echoed_timestamp_ms,
                1,
                0,
                DirtyRect::ZERO,
            );

            let mut buf = pool.rent(PacketHeader::SERIALIZED_LEN);
            header.ser(&mut buf);
            write_checksum(buf.as_mut());

            pipeline.send_frame(to, buf.as_ref()).await;
            telemetry.record_send(buf.len());
            pool.return_to_pool(buf);
        });
    }

    /// The per-peer receive loop: reads one datagram at a time, validates and dispatches
    ///  it, and keeps going until [`Self::shutdown`] is called. Frames that fail validation
    ///  are dropped silently - there is no NACK and no retry at this layer.
    pub async fn recv_loop(&self) {
        info!("starting receive loop on {:?}", self.local_addr());

        let mut buf = self.buffer_pool.rent(self.config.mtu);
        loop {
            if self.is_shut_down.load(Ordering::Acquire) {
                break;
            }

            buf.maximize_len();
            let (num_read, from) = tokio::select! {
                _ = self.shutdown_signal.notified() => break,
                result = self.receive_socket.recv_from(buf.as_mut()) => match result {
                    Ok(read) => read,
                    Err(e) => {
                        if self.is_shut_down.load(Ordering::Acquire) {
                            break;
                        }
                        tracing::error!("socket error: {}", e);
                        continue;
                    }
                },
            };
            buf.truncate(num_read);

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "frame_received", ?correlation_id);
            self.on_datagram(buf.as_ref(), from).instrument(span).await;
        }

        debug!("receive loop stopped");
        self.buffer_pool.return_to_pool(buf);
    }

    /// Validates and dispatches one received datagram.
    async fn on_datagram(&self, frame: &[u8], from: SocketAddr) {
        trace!("received {} bytes from {:?}", frame.len(), from);

        if frame.len() < PacketHeader::SERIALIZED_LEN {
            debug!("truncated frame from {:?} - dropping", from);
            return;
        }
        if frame[0] != PROTOCOL_VERSION {
            debug!("wrong protocol version {} from {:?} - dropping", frame[0], from);
            return;
        }
        if !is_checksum_valid(frame) {
            debug!("checksum mismatch from {:?} - dropping", from);
            return;
        }

        let header = match PacketHeader::deser(&mut &frame[..]) {
            Ok(header) => header,
            Err(e) => {
                warn!("unparseable header from {:?}: {:#} - dropping", from, e);
                return;
            }
        };
        if header.total_chunks == 0 || header.chunk_id >= header.total_chunks {
            debug!("inconsistent chunk fields from {:?} - dropping", from);
            return;
        }

        self.telemetry.record_receive(frame.len());

        let payload = Bytes::copy_from_slice(&frame[PacketHeader::SERIALIZED_LEN..]);
        let packet = Packet::received(header, payload, from);
        let now = Instant::now();

        match packet.header.packet_type {
            PacketType::Ping => {
                trace!("answering ping from {:?}", from);
                self.spawn_pong(from, packet.header.timestamp_ms);
            }
            PacketType::Pong => {
                let rtt_ms = unix_millis().saturating_sub(packet.header.timestamp_ms);
                trace!("pong from {:?}: rtt {} ms", from, rtt_ms);
                self.telemetry.record_rtt(rtt_ms as f64);
            }
            PacketType::Fec => {
                if let Some(recovered) = self.fec.on_parity(packet, now) {
                    self.telemetry.record_recovered();
                    self.deliver_chunk(recovered, now).await;
                }
            }
            PacketType::Input
            | PacketType::Report
            | PacketType::Video
            | PacketType::Audio
            | PacketType::Control
            | PacketType::Screen => {
                let recovered = self.fec.on_data_chunk(&packet, now);
                self.deliver_chunk(packet, now).await;
                if let Some(recovered) = recovered {
                    self.telemetry.record_recovered();
                    self.deliver_chunk(recovered, now).await;
                }
            }
        }
    }

    async fn deliver_chunk(&self, chunk: Packet, now: Instant) {
        if let Some(complete) = self.reassembly.on_chunk(chunk, now) {
            self.dispatcher.on_packet(complete).await;
        }
    }

    /// Stops the receive loop and lets the socket close with the peer. Idempotent; sends
    ///  already in flight may still complete, fail or be dropped silently.
    pub fn shutdown(&self) {
        if !self.is_shut_down.swap(true, Ordering::AcqRel) {
            debug!("shutting down peer at {:?}", self.local_addr());
            self.shutdown_signal.notify_one();
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
