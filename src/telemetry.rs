use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RTT_WINDOW_LEN: usize = 10;
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// An immutable view of the link's health, computed on demand and never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySnapshot {
    /// moving average over the last 10 round-trip samples, 0.0 before the first Pong
    pub rtt_ms: f64,
    /// frames sent in the trailing second
    pub packets_sent_per_sec: usize,
    /// frames received in the trailing second
    pub packets_received_per_sec: usize,
    /// outgoing bitrate over the last completed 1-second window
    pub send_kbps: f64,
    /// incoming bitrate over the last completed 1-second window
    pub receive_kbps: f64,
    /// recovered / (received + recovered) over the last completed window, in percent
    pub loss_rate_pct: f64,
}

/// Ring buffer of the most recent RTT samples with a cached sum, so the mean is O(1)
///  per query.
struct RttWindow {
    samples: [f64; RTT_WINDOW_LEN],
    len: usize,
    next: usize,
    cached_sum: f64,
}

impl RttWindow {
    fn new() -> RttWindow {
        RttWindow {
            samples: [0.0; RTT_WINDOW_LEN],
            len: 0,
            next: 0,
            cached_sum: 0.0,
        }
    }

    fn add_sample(&mut self, value: f64) {
        if self.len == RTT_WINDOW_LEN {
            self.cached_sum -= self.samples[self.next];
        }
        else {
            self.len += 1;
        }
        self.samples[self.next] = value;
        self.cached_sum += value;
        self.next = (self.next + 1) % RTT_WINDOW_LEN;
    }

    fn mean(&self) -> f64 {
        if self.len == 0 {
            return 0.0;
        }
        self.cached_sum / self.len as f64
    }
}

/// Byte and packet counts of one completed rotation window, frozen at rotation time.
#[derive(Clone, Copy, Default)]
struct CompletedWindow {
    duration: Duration,
    bytes_sent: u64,
    bytes_received: u64,
    packets_received: u64,
    packets_recovered: u64,
}

/// Derives RTT, packet/byte rates and loss from observed traffic.
///
/// Counters for the current window are plain atomics so the send paths and the receive loop
///  never contend; the two small mutexes (RTT ring, event queues) are held for a handful of
///  instructions only.
pub struct TelemetryCollector {
    rtt: Mutex<RttWindow>,
    sent_events: Mutex<VecDeque<Instant>>,
    received_events: Mutex<VecDeque<Instant>>,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_received: AtomicU64,
    packets_recovered: AtomicU64,

    window: Mutex<(Instant, CompletedWindow)>,
}

impl TelemetryCollector {
    pub fn new() -> TelemetryCollector {
        Self::started_at(Instant::now())
    }

    fn started_at(now: Instant) -> TelemetryCollector {
        TelemetryCollector {
            rtt: Mutex::new(RttWindow::new()),
            sent_events: Mutex::new(VecDeque::new()),
            received_events: Mutex::new(VecDeque::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_recovered: AtomicU64::new(0),
            window: Mutex::new((now, CompletedWindow::default())),
        }
    }

    pub fn record_send(&self, frame_len: usize) {
        self.record_send_at(Instant::now(), frame_len);
    }

    fn record_send_at(&self, now: Instant, frame_len: usize) {
        self.bytes_sent.fetch_add(frame_len as u64, Ordering::Relaxed);
        let mut events = self.sent_events.lock().unwrap();
        Self::trim(&mut events, now);
        events.push_back(now);
    }

    pub fn record_receive(&self, frame_len: usize) {
        self.record_receive_at(Instant::now(), frame_len);
    }

    fn record_receive_at(&self, now: Instant, frame_len: usize) {
        self.bytes_received.fetch_add(frame_len as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        let mut events = self.received_events.lock().unwrap();
        Self::trim(&mut events, now);
        events.push_back(now);
    }

    /// one round-trip sample, taken from a Pong's echoed timestamp
    pub fn record_rtt(&self, rtt_ms: f64) {
        self.rtt.lock().unwrap().add_sample(rtt_ms);
    }

    /// a chunk was rebuilt from a parity frame, i.e. its original datagram was lost
    pub fn record_recovered(&self) {
        self.packets_recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> TelemetrySnapshot {
        let packets_sent_per_sec = {
            let mut events = self.sent_events.lock().unwrap();
            Self::trim(&mut events, now);
            events.len()
        };
        let packets_received_per_sec = {
            let mut events = self.received_events.lock().unwrap();
            Self::trim(&mut events, now);
            events.len()
        };

        let completed = self.rotate_if_due(now);

        let secs = completed.duration.as_secs_f64();
        let (send_kbps, receive_kbps) = if secs > 0.0 {
            (
                completed.bytes_sent as f64 * 8.0 / 1000.0 / secs,
                completed.bytes_received as f64 * 8.0 / 1000.0 / secs,
            )
        }
        else {
            (0.0, 0.0)
        };

        let seen = completed.packets_received + completed.packets_recovered;
        let loss_rate_pct = if seen > 0 {
            completed.packets_recovered as f64 / seen as f64 * 100.0
        }
        else {
            0.0
        };

        TelemetrySnapshot {
            rtt_ms: self.rtt.lock().unwrap().mean(),
            packets_sent_per_sec,
            packets_received_per_sec,
            send_kbps,
            receive_kbps,
            loss_rate_pct,
        }
    }

    /// Freezes the current counters into a completed window if at least a second has passed
    ///  since the previous rotation, and returns the last completed window either way.
    fn rotate_if_due(&self, now: Instant) -> CompletedWindow {
        let mut window = self.window.lock().unwrap();

        let elapsed = now.saturating_duration_since(window.0);
        if elapsed >= RATE_WINDOW {
            window.1 = CompletedWindow {
                duration: elapsed,
                bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
                bytes_received: self.bytes_received.swap(0, Ordering::Relaxed),
                packets_received: self.packets_received.swap(0, Ordering::Relaxed),
                packets_recovered: self.packets_recovered.swap(0, Ordering::Relaxed),
            };
            window.0 = now;
        }

        window.1
    }

    fn trim(events: &mut VecDeque<Instant>, now: Instant) {
        while let Some(first) = events.front() {
            if now.saturating_duration_since(*first) > RATE_WINDOW {
                events.pop_front();
            }
            else {
                break;
            }
        }
    }
}

impl Default for TelemetryCollector {
    fn default() -> Self {
        Self::new()
    }
}
