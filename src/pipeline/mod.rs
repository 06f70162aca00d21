//! The dual pipeline — the hard core (§4.D). Moves bytes in both
//! directions between a serial endpoint and a TCP endpoint with bounded
//! latency, fair scheduling, and watermark-driven backpressure.
//!
//! The scheduler tick and fairness bookkeeping (current direction, quantum
//! clock, per-direction weight and `last_serviced_at`, starvation check,
//! try-send-style backpressure counting) are grounded on this codebase's
//! tunnel relay loop — a `tokio::select!` over two directions with
//! `try_send`-based backpressure and drop counting — adapted from async
//! channels to a blocking scheduler tick driven directly by the serial and
//! network threads (§5's two-OS-threads model).

pub mod buffer;

use std::time::{Duration, Instant};

use buffer::EnhancedBuffer;

use crate::endpoint::Endpoint;
use crate::error::{BridgeResult, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    SerialToTcp,
    TcpToSerial,
}

impl Direction {
    fn other(self) -> Self {
        match self {
            Self::SerialToTcp => Self::TcpToSerial,
            Self::TcpToSerial => Self::SerialToTcp,
        }
    }

    fn idx(self) -> usize {
        match self {
            Self::SerialToTcp => 0,
            Self::TcpToSerial => 1,
        }
    }
}

const DEFAULT_QUANTUM_MS: u64 = 50;
const MIN_QUANTUM_MS: u64 = 10;
const MAX_QUANTUM_MS: u64 = 200;
const MAX_BURST: usize = 4096;
const STARVATION_THRESHOLD_MS: u64 = 500;
const DEFAULT_WEIGHT: u8 = 5;
const LATENCY_EMA_ALPHA: f64 = 0.1;
const IDLE_BACKOFF_MS: u64 = 10;

struct DirectionState {
    buffer: EnhancedBuffer,
    weight: u8,
    last_serviced_at: Instant,
    latency_ema_ms: f64,
}

impl DirectionState {
    fn new(min_capacity: usize, max_capacity: usize) -> Self {
        Self {
            buffer: EnhancedBuffer::new(min_capacity, max_capacity),
            weight: DEFAULT_WEIGHT,
            last_serviced_at: Instant::now(),
            latency_ema_ms: 0.0,
        }
    }
}

/// The two-direction scheduler. Each direction owns an `EnhancedBuffer`;
/// `tick` pulls bytes from the current direction's source endpoint,
/// pushes them through that direction's buffer to the sink endpoint, and
/// applies the quantum/starvation/backpressure rules from §4.D.
pub struct DualPipeline {
    directions: [DirectionState; 2],
    current: Direction,
    quantum_start: Instant,
    quantum_bytes: usize,
    quantum_ms: u64,
}

/// Per-tick outcome, used by the caller (serial/network thread loop) to
/// decide whether to sleep.
#[derive(Debug, Default)]
pub struct TickReport {
    pub bytes_moved: usize,
    pub switched: bool,
}

impl DualPipeline {
    pub fn new(min_capacity: usize, max_capacity: usize) -> Self {
        Self {
            directions: [
                DirectionState::new(min_capacity, max_capacity),
                DirectionState::new(min_capacity, max_capacity),
            ],
            current: Direction::SerialToTcp,
            quantum_start: Instant::now(),
            quantum_bytes: 0,
            quantum_ms: DEFAULT_QUANTUM_MS,
        }
    }

    pub fn buffer(&self, dir: Direction) -> &EnhancedBuffer {
        &self.directions[dir.idx()].buffer
    }

    /// One scheduler tick, per §4.D's five numbered steps. `source` and
    /// `sink` are the endpoints for the direction currently being
    /// serviced — the caller (whichever of the serial/network threads owns
    /// this tick) passes the correct pair in based on `self.current()`.
    pub fn tick(
        &mut self,
        source: &mut dyn Endpoint,
        sink: &mut dyn Endpoint,
    ) -> BridgeResult<TickReport> {
        let mut report = TickReport::default();

        if self.quantum_elapsed() || self.quantum_bytes >= MAX_BURST {
            if self.should_switch_for_starvation() {
                self.switch_direction();
                report.switched = true;
            } else if self.quantum_elapsed() {
                self.switch_direction();
                report.switched = true;
            }
        }

        let tick_start = Instant::now();
        let mut scratch = [0u8; MAX_BURST];
        let (read_n, read_status) = source.try_read(&mut scratch)?;
        if read_n > 0 {
            let dir = self.directions[self.current.idx()].buffer.push(&scratch[..read_n]);
            report.bytes_moved += dir;
            self.quantum_bytes += dir;
        }

        let mut drained = Vec::new();
        let buf = &mut self.directions[self.current.idx()].buffer;
        let pulled = buf.drain(MAX_BURST, &mut drained);
        let mut written_total = 0;
        if pulled > 0 {
            let mut offset = 0;
            while offset < drained.len() {
                let (n, status) = sink.try_write(&drained[offset..])?;
                written_total += n;
                offset += n;
                if status == Status::WouldBlock {
                    break;
                }
            }
        }
        report.bytes_moved += written_total;

        if read_n > 0 || written_total > 0 {
            self.directions[self.current.idx()].last_serviced_at = Instant::now();
            let elapsed_ms = tick_start.elapsed().as_secs_f64() * 1000.0;
            let ema = &mut self.directions[self.current.idx()].latency_ema_ms;
            *ema = LATENCY_EMA_ALPHA * elapsed_ms + (1.0 - LATENCY_EMA_ALPHA) * *ema;
            self.adapt_quantum();
        }

        let _ = read_status;
        Ok(report)
    }

    pub fn current(&self) -> Direction {
        self.current
    }

    /// Sleep is the caller's responsibility; this just reports whether the
    /// tick produced zero bytes, so the caller can bound its backoff at
    /// `IDLE_BACKOFF_MS` per §4.D step 5.
    pub fn idle_backoff() -> Duration {
        Duration::from_millis(IDLE_BACKOFF_MS)
    }

    fn quantum_elapsed(&self) -> bool {
        self.quantum_start.elapsed() >= Duration::from_millis(self.quantum_ms)
    }

    fn should_switch_for_starvation(&self) -> bool {
        let other = self.current.other();
        let starved = self.directions[other.idx()].last_serviced_at.elapsed()
            >= Duration::from_millis(STARVATION_THRESHOLD_MS);
        let has_data = self.directions[other.idx()].buffer.fill_ratio() > 0.0;
        starved && has_data
    }

    fn switch_direction(&mut self) {
        self.current = self.current.other();
        self.quantum_start = Instant::now();
        self.quantum_bytes = 0;
    }

    /// If the max of the two latency EMAs exceeds 50 ms, shrink the
    /// quantum by ×0.8; if below 10 ms, grow it by ×1.2; clamp to
    /// `[10, 200]` ms.
    fn adapt_quantum(&mut self) {
        let max_ema = self.directions[0]
            .latency_ema_ms
            .max(self.directions[1].latency_ema_ms);

        let mut q = self.quantum_ms as f64;
        if max_ema > 50.0 {
            q *= 0.8;
        } else if max_ema < 10.0 {
            q *= 1.2;
        }
        self.quantum_ms = (q as u64).clamp(MIN_QUANTUM_MS, MAX_QUANTUM_MS);
    }

    pub fn set_weight(&mut self, dir: Direction, weight: u8) {
        self.directions[dir.idx()].weight = weight.clamp(3, 7);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MockEndpoint;

    #[test]
    fn tick_moves_bytes_from_source_to_sink() {
        let mut pipeline = DualPipeline::new(1024, 8192);
        let mut source = MockEndpoint::new();
        source.feed(b"hello");
        let mut sink = MockEndpoint::new();

        let report = pipeline.tick(&mut source, &mut sink).unwrap();
        assert!(report.bytes_moved > 0);
        assert_eq!(sink.outbox, b"hello");
    }

    #[test]
    fn starvation_forces_a_switch_even_within_quantum() {
        let mut pipeline = DualPipeline::new(1024, 8192);
        pipeline.directions[Direction::TcpToSerial.idx()].buffer.push(b"x");
        pipeline.directions[Direction::TcpToSerial.idx()].last_serviced_at =
            Instant::now() - Duration::from_millis(STARVATION_THRESHOLD_MS + 10);

        assert!(pipeline.should_switch_for_starvation());
    }

    #[test]
    fn quantum_defaults_within_clamp_bounds() {
        let pipeline = DualPipeline::new(1024, 8192);
        assert!(pipeline.quantum_ms >= MIN_QUANTUM_MS && pipeline.quantum_ms <= MAX_QUANTUM_MS);
    }

    #[test]
    fn set_weight_clamps_to_documented_range() {
        let mut pipeline = DualPipeline::new(1024, 8192);
        pipeline.set_weight(Direction::SerialToTcp, 1);
        assert_eq!(pipeline.directions[Direction::SerialToTcp.idx()].weight, 3);
        pipeline.set_weight(Direction::SerialToTcp, 20);
        assert_eq!(pipeline.directions[Direction::SerialToTcp.idx()].weight, 7);
    }
}
