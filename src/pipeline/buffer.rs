//! `EnhancedBuffer` — the double-buffered, watermark-tracked byte queue
//! backing each direction of the dual pipeline (§3, §4.D).
//!
//! Grounded on this codebase's ring-buffer-with-eviction-and-notify
//! output buffer (`VecDeque` + `Arc<Notify>`, evict-oldest-on-full), but
//! adapted from a `VecDeque<OutputEntry>` of discrete messages to two
//! `Vec<u8>` byte regions with an active/drain flip, since the spec calls
//! for raw byte transport with watermark-driven backpressure rather than
//! message framing.

use std::time::{Duration, Instant};

/// Fill-level classification used to decide backpressure and resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watermark {
    Critical,
    High,
    Normal,
    Low,
    Empty,
}

impl Watermark {
    fn from_ratio(ratio: f64) -> Self {
        if ratio >= 0.95 {
            Self::Critical
        } else if ratio >= 0.80 {
            Self::High
        } else if ratio >= 0.20 {
            Self::Normal
        } else if ratio >= 0.05 {
            Self::Low
        } else {
            Self::Empty
        }
    }
}

const MIN_RESIZE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_GROW_STEP: usize = 1024;
const DEFAULT_SHRINK_STEP: usize = 512;

pub struct EnhancedBuffer {
    main: Vec<u8>,
    sub: Vec<u8>,
    read_cursor: usize,
    /// `true` ⇒ `main` takes new appends and `sub` drains; `false` is the
    /// mirror image.
    active_is_main: bool,
    capacity: usize,
    min_capacity: usize,
    max_capacity: usize,
    grow_step: usize,
    shrink_step: usize,
    last_resize: Instant,
    backpressure_active: bool,

    pub bytes_written: u64,
    pub bytes_read: u64,
    pub bytes_dropped: u64,
    pub overflow_events: u64,
    pub underflow_events: u64,
    pub peak_usage: usize,
    pub consecutive_overflows: u32,
    pub consecutive_underflows: u32,
}

impl EnhancedBuffer {
    pub fn new(min_capacity: usize, max_capacity: usize) -> Self {
        Self {
            main: Vec::with_capacity(min_capacity),
            sub: Vec::with_capacity(min_capacity),
            read_cursor: 0,
            active_is_main: true,
            capacity: min_capacity,
            min_capacity,
            max_capacity,
            grow_step: DEFAULT_GROW_STEP,
            shrink_step: DEFAULT_SHRINK_STEP,
            last_resize: Instant::now(),
            backpressure_active: false,
            bytes_written: 0,
            bytes_read: 0,
            bytes_dropped: 0,
            overflow_events: 0,
            underflow_events: 0,
            peak_usage: 0,
            consecutive_overflows: 0,
            consecutive_underflows: 0,
        }
    }

    fn active_mut(&mut self) -> &mut Vec<u8> {
        if self.active_is_main {
            &mut self.main
        } else {
            &mut self.sub
        }
    }

    fn drain_region(&self) -> &Vec<u8> {
        if self.active_is_main {
            &self.sub
        } else {
            &self.main
        }
    }

    fn total_fill(&self) -> usize {
        (self.main.len() - if self.active_is_main { 0 } else { self.read_cursor })
            + (self.sub.len() - if self.active_is_main { self.read_cursor } else { 0 })
    }

    /// Fill ratio against `2 × capacity`, per §3.
    pub fn fill_ratio(&self) -> f64 {
        let denom = (2 * self.capacity).max(1) as f64;
        self.total_fill() as f64 / denom
    }

    pub fn watermark(&self) -> Watermark {
        Watermark::from_ratio(self.fill_ratio())
    }

    pub fn backpressure_active(&self) -> bool {
        self.backpressure_active
    }

    /// Append bytes into the active region, spilling into the drain region
    /// once the active one is full so both regions genuinely hold data
    /// concurrently (matching `fill_ratio`'s `2 × capacity` denominator).
    /// Refuses (returns `0`) while backpressure is active and the buffer is
    /// not yet CRITICAL-and-full; drops bytes (counted) only once
    /// CRITICAL-and-full, or once both regions are full.
    pub fn push(&mut self, data: &[u8]) -> usize {
        self.update_backpressure();

        if self.backpressure_active {
            let watermark = self.watermark();
            if watermark == Watermark::Critical && self.is_full() {
                self.bytes_dropped += data.len() as u64;
                self.overflow_events += 1;
                self.consecutive_overflows += 1;
                if self.consecutive_overflows >= 3 {
                    tracing::warn!(
                        "buffer sustained overflow: {} consecutive, {} total bytes dropped",
                        self.consecutive_overflows,
                        self.bytes_dropped
                    );
                }
                return 0;
            }
        } else {
            self.consecutive_overflows = 0;
        }

        let active_space = self.capacity.saturating_sub(self.active_mut().len());
        let n = data.len().min(active_space);
        self.active_mut().extend_from_slice(&data[..n]);
        let mut written = n;
        let mut rest = &data[n..];

        if !rest.is_empty() {
            let active_is_main = self.active_is_main;
            let other = if active_is_main { &mut self.sub } else { &mut self.main };
            let other_space = self.capacity.saturating_sub(other.len());
            let n2 = rest.len().min(other_space);
            other.extend_from_slice(&rest[..n2]);
            written += n2;
            rest = &rest[n2..];
        }

        self.bytes_written += written as u64;
        self.peak_usage = self.peak_usage.max(self.total_fill());

        if !rest.is_empty() {
            self.bytes_dropped += rest.len() as u64;
            self.overflow_events += 1;
            self.consecutive_overflows += 1;
        }

        self.update_backpressure();
        self.maybe_resize();
        written
    }

    fn is_full(&self) -> bool {
        self.main.len() >= self.capacity && self.sub.len() >= self.capacity
    }

    /// Drain up to `max` bytes into `out`, pulling from the drain region
    /// and, once it's exhausted, swapping in the active region and
    /// continuing — so a single call can flush everything held across both
    /// regions, matching the `2 × capacity` pool `fill_ratio` measures
    /// against. Swaps `active`/drain atomically (under whatever external
    /// lock guards this struct), per §5's "swapping is atomic with the
    /// mutex".
    pub fn drain(&mut self, max: usize, out: &mut Vec<u8>) -> usize {
        let mut total = 0;

        while total < max {
            let drain_len = self.drain_region().len();
            let available = drain_len.saturating_sub(self.read_cursor);

            if available == 0 {
                if self.active_mut().is_empty() {
                    break;
                }
                self.swap_regions();
                continue;
            }

            self.consecutive_underflows = 0;
            let n = available.min(max - total);
            let start = self.read_cursor;
            out.extend_from_slice(&self.drain_region()[start..start + n]);
            self.read_cursor += n;
            self.bytes_read += n as u64;
            total += n;

            if self.read_cursor >= self.drain_region().len() {
                self.drain_region_clear();
            }
        }

        if total == 0 {
            self.underflow_events += 1;
            self.consecutive_underflows += 1;
        }

        self.update_backpressure();
        total
    }

    fn swap_regions(&mut self) {
        self.active_is_main = !self.active_is_main;
        self.read_cursor = 0;
    }

    fn drain_region_clear(&mut self) {
        self.read_cursor = 0;
        if self.active_is_main {
            self.sub.clear();
        } else {
            self.main.clear();
        }
    }

    fn update_backpressure(&mut self) {
        let watermark = self.watermark();
        if !self.backpressure_active
            && matches!(watermark, Watermark::High | Watermark::Critical)
        {
            self.backpressure_active = true;
        } else if self.backpressure_active && matches!(watermark, Watermark::Low | Watermark::Empty) {
            self.backpressure_active = false;
        }
    }

    /// At most one resize per 30 s. Grows by `grow_step` on sustained high
    /// fill or ≥3 consecutive overflows; shrinks by `shrink_step` on
    /// sustained low fill, never below `min_capacity`/above
    /// `max_capacity`. Truncates overhang data on shrink (logged).
    fn maybe_resize(&mut self) {
        if self.last_resize.elapsed() < MIN_RESIZE_INTERVAL {
            return;
        }

        let ratio = self.fill_ratio();
        if (ratio > 0.85 || self.consecutive_overflows >= 3) && self.capacity < self.max_capacity {
            let new_capacity = (self.capacity + self.grow_step).min(self.max_capacity);
            self.capacity = new_capacity;
            self.last_resize = Instant::now();
            tracing::debug!("buffer grown to {new_capacity} bytes (fill ratio {ratio:.2})");
        } else if ratio < 0.15 && self.capacity > self.min_capacity {
            let new_capacity = self.capacity.saturating_sub(self.shrink_step).max(self.min_capacity);
            if self.main.len() > new_capacity {
                let truncated = self.main.len() - new_capacity;
                self.main.truncate(new_capacity);
                tracing::warn!("buffer shrink truncated {truncated} bytes from main region");
            }
            if self.sub.len() > new_capacity {
                let truncated = self.sub.len() - new_capacity;
                self.sub.truncate(new_capacity);
                tracing::warn!("buffer shrink truncated {truncated} bytes from sub region");
            }
            self.capacity = new_capacity;
            self.last_resize = Instant::now();
            tracing::debug!("buffer shrunk to {new_capacity} bytes (fill ratio {ratio:.2})");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_drain_round_trips_bytes() {
        let mut buf = EnhancedBuffer::new(64, 4096);
        buf.push(b"hello");
        let mut out = Vec::new();
        let n = buf.drain(16, &mut out);
        assert_eq!(n, 5);
        assert_eq!(out, b"hello");
    }

    #[test]
    fn watermark_classification_matches_thresholds() {
        assert_eq!(Watermark::from_ratio(0.96), Watermark::Critical);
        assert_eq!(Watermark::from_ratio(0.85), Watermark::High);
        assert_eq!(Watermark::from_ratio(0.5), Watermark::Normal);
        assert_eq!(Watermark::from_ratio(0.08), Watermark::Low);
        assert_eq!(Watermark::from_ratio(0.01), Watermark::Empty);
    }

    #[test]
    fn backpressure_turns_on_at_high_and_off_at_low_hysteresis() {
        let mut buf = EnhancedBuffer::new(64, 64);
        // capacity 64, 2*capacity=128: need fill >= 0.80*128 = 102.4 to hit HIGH.
        buf.push(&vec![1u8; 64]);
        buf.push(&vec![1u8; 64]);
        assert!(buf.backpressure_active());

        let mut out = Vec::new();
        // Drain enough to fall to LOW (<=0.05*128=6.4).
        buf.drain(200, &mut out);
        assert!(!buf.backpressure_active());
    }

    #[test]
    fn drop_only_happens_at_critical_and_full() {
        let mut buf = EnhancedBuffer::new(8, 8);
        buf.push(&vec![1u8; 8]);
        buf.push(&vec![1u8; 8]); // both regions now full -> is_full() true, watermark critical
        let dropped_before = buf.bytes_dropped;
        buf.push(&[9, 9, 9]);
        assert!(buf.bytes_dropped > dropped_before);
    }

    #[test]
    fn buffer_at_min_capacity_refuses_to_shrink() {
        let mut buf = EnhancedBuffer::new(64, 4096);
        buf.last_resize = Instant::now() - Duration::from_secs(31);
        buf.maybe_resize();
        assert_eq!(buf.capacity, 64);
    }

    #[test]
    fn resize_is_rate_limited_to_once_per_30s() {
        let mut buf = EnhancedBuffer::new(64, 4096);
        buf.consecutive_overflows = 5;
        buf.last_resize = Instant::now();
        let before = buf.capacity;
        buf.maybe_resize();
        assert_eq!(buf.capacity, before, "resize within 30s window must be a no-op");
    }
}
