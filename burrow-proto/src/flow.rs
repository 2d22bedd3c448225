//! Per-session flow and congestion accounting.
//!
//! A TCP-Reno-style controller: slow-start / congestion-avoidance window,
//! RFC 6298 smoothed RTT, retransmission-timeout estimation, and periodic
//! throughput samples. The underlying carrier is already reliable TCP, so
//! the controller informs metrics and admission decisions only — it does
//! not change carrier behaviour.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::wire::FlowStats;

/// Window floor, bytes.
pub const MIN_WINDOW: u64 = 4 * 1024;
/// Window ceiling, bytes.
pub const MAX_WINDOW: u64 = 1024 * 1024;
/// Initial window used to seed the slow-start threshold, bytes.
pub const INITIAL_WINDOW: u64 = 64 * 1024;

/// Nominal packet size used for the in-flight byte approximation.
const PACKET_SIZE: u64 = 1024;
/// RTT sample ring capacity.
const RTT_WINDOW: usize = 10;
/// Throughput sample ring capacity.
const THROUGHPUT_WINDOW: usize = 20;

struct FlowState {
    cwnd:              u64,
    ssthresh:          u64,
    in_slow_start:     bool,
    packets_in_flight: u64,
    total_sent:        u64,
    total_acked:       u64,
    retransmissions:   u64,
    // RFC 6298 estimator, seconds
    rtt_samples:  VecDeque<f64>,
    smoothed_rtt: f64,
    rtt_variance: f64,
    // bytes/second ring, refreshed at most once per second
    throughput_samples: VecDeque<f64>,
    last_stat_time:     Instant,
    bytes_transferred:  u64,
}

/// Flow/congestion controller for one session.
///
/// All state is mutated under a single internal lock; the handle is shared
/// freely across tasks.
pub struct FlowController {
    inner: Mutex<FlowState>,
}

impl FlowController {
    /// Fresh controller: window at the floor, slow start active.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(FlowState {
                cwnd:               MIN_WINDOW,
                ssthresh:           INITIAL_WINDOW / 2,
                in_slow_start:      true,
                packets_in_flight:  0,
                total_sent:         0,
                total_acked:        0,
                retransmissions:    0,
                rtt_samples:        VecDeque::with_capacity(RTT_WINDOW),
                smoothed_rtt:       0.0,
                rtt_variance:       0.0,
                throughput_samples: VecDeque::with_capacity(THROUGHPUT_WINDOW),
                last_stat_time:     Instant::now(),
                bytes_transferred:  0,
            }),
        }
    }

    /// Whether `data_size` more bytes fit in the congestion window, with
    /// in-flight bytes approximated as `packets_in_flight · 1 KiB`.
    pub fn can_send(&self, data_size: usize) -> bool {
        let state = self.lock();
        state.packets_in_flight * PACKET_SIZE + data_size as u64 <= state.cwnd
    }

    /// Account one packet of `packet_size` bytes leaving.
    pub fn on_packet_sent(&self, packet_size: usize) {
        let mut state = self.lock();
        state.packets_in_flight += 1;
        state.total_sent += 1;
        state.bytes_transferred += packet_size as u64;
    }

    /// Account one acknowledgment: updates the RTT estimator, grows the
    /// window, and refreshes the throughput ring.
    pub fn on_ack_received(&self, packet_size: usize, rtt: Duration) {
        let mut state = self.lock();
        state.packets_in_flight = state.packets_in_flight.saturating_sub(1);
        state.total_acked += 1;

        state.update_rtt(rtt.as_secs_f64());

        let n = packet_size as u64;
        if state.in_slow_start {
            state.cwnd += n;
            if state.cwnd >= state.ssthresh {
                state.in_slow_start = false;
            }
        } else {
            let increment = (n * n) / state.cwnd;
            state.cwnd += increment.max(1);
        }
        state.cwnd = state.cwnd.min(MAX_WINDOW);

        state.update_throughput();
    }

    /// Loss signal: multiplicative decrease, stay out of slow start.
    pub fn on_packet_loss(&self) {
        let mut state = self.lock();
        state.retransmissions += 1;
        state.ssthresh = (state.cwnd / 2).max(MIN_WINDOW);
        state.cwnd = state.ssthresh;
        state.in_slow_start = false;
    }

    /// Timeout signal: collapse to the floor and re-enter slow start.
    pub fn on_timeout(&self) {
        let mut state = self.lock();
        state.ssthresh = (state.cwnd / 2).max(MIN_WINDOW);
        state.cwnd = MIN_WINDOW;
        state.in_slow_start = true;
    }

    /// Retransmission timeout: `SRTT + 4·RTTVAR` clamped to [200 ms, 60 s],
    /// or 1 s before any RTT sample has been seen.
    pub fn retransmission_timeout(&self) -> Duration {
        let state = self.lock();
        if state.smoothed_rtt == 0.0 {
            return Duration::from_secs(1);
        }
        let rto = state.smoothed_rtt + 4.0 * state.rtt_variance;
        Duration::from_secs_f64(rto.clamp(0.2, 60.0))
    }

    /// Current statistics snapshot.
    pub fn snapshot(&self) -> FlowStats {
        let state = self.lock();
        let avg_rtt = if state.rtt_samples.is_empty() {
            0.0
        } else {
            state.rtt_samples.iter().sum::<f64>() / state.rtt_samples.len() as f64
        };
        let avg_throughput = if state.throughput_samples.is_empty() {
            0.0
        } else {
            state.throughput_samples.iter().sum::<f64>() / state.throughput_samples.len() as f64
        };
        FlowStats {
            cwnd:               state.cwnd,
            ssthresh:           state.ssthresh,
            in_slow_start:      state.in_slow_start,
            packets_in_flight:  state.packets_in_flight,
            total_sent:         state.total_sent,
            total_acked:        state.total_acked,
            retransmissions:    state.retransmissions,
            avg_rtt_ms:         avg_rtt * 1000.0,
            smoothed_rtt_ms:    state.smoothed_rtt * 1000.0,
            avg_throughput_mbps: (avg_throughput * 8.0) / (1024.0 * 1024.0),
            window_utilization: if state.cwnd > 0 {
                (state.packets_in_flight * PACKET_SIZE) as f64 / state.cwnd as f64
            } else {
                0.0
            },
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FlowState> {
        self.inner.lock().expect("flow controller lock poisoned")
    }
}

impl Default for FlowController {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowState {
    /// RFC 6298 EWMA: the first sample seeds the estimator, later samples
    /// move it with α = 1/8, β = 1/4.
    fn update_rtt(&mut self, sample: f64) {
        if self.rtt_samples.len() == RTT_WINDOW {
            self.rtt_samples.pop_front();
        }
        self.rtt_samples.push_back(sample);

        if self.smoothed_rtt == 0.0 {
            self.smoothed_rtt = sample;
            self.rtt_variance = sample / 2.0;
        } else {
            let error = sample - self.smoothed_rtt;
            self.smoothed_rtt += 0.125 * error;
            self.rtt_variance += 0.25 * (error.abs() - self.rtt_variance);
        }
    }

    /// Push `bytes/elapsed` onto the ring once at least a second has passed.
    fn update_throughput(&mut self) {
        let elapsed = self.last_stat_time.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            if self.throughput_samples.len() == THROUGHPUT_WINDOW {
                self.throughput_samples.pop_front();
            }
            let rate = self.bytes_transferred as f64 / elapsed;
            self.throughput_samples.push_back(rate);
            self.bytes_transferred = 0;
            self.last_stat_time = Instant::now();
        }
    }
}
