//! The narrow capability set the dual pipeline uses to talk to either side
//! (serial or TCP) without branching on what kind of file descriptor it
//! holds. Implemented once for the serial endpoint and once for a TCP
//! socket wrapper; tests substitute [`MockEndpoint`].

use crate::error::{BridgeResult, Status};

/// Non-blocking-flavored read/write contract. `try_read`/`try_write` never
/// block longer than the implementor's own bounded wait (100 ms for the
/// serial and TCP endpoints in this crate); they report `Status::WouldBlock`
/// rather than blocking indefinitely when the peer has no data or is
/// backpressured.
pub trait Endpoint: Send {
    /// Attempt to read into `buf`. Returns the number of bytes read and a
    /// status. `0` bytes with `Status::Complete` means "no data within the
    /// bounded wait", matching the serial endpoint's timeout-returns-zero
    /// contract.
    fn try_read(&mut self, buf: &mut [u8]) -> BridgeResult<(usize, Status)>;

    /// Attempt to write `buf`. Returns the number of bytes accepted and a
    /// status; `Status::Partial` means the caller must re-invoke with the
    /// unconsumed suffix.
    fn try_write(&mut self, buf: &[u8]) -> BridgeResult<(usize, Status)>;

    /// Cheap liveness check (no I/O) used by the health report and the
    /// scheduler's starvation/backpressure bookkeeping.
    fn is_healthy(&self) -> bool;

    /// Release any held resources (fd, lock file, socket). Idempotent.
    fn close(&mut self) -> BridgeResult<()>;
}

/// An opaque byte-in/byte-out collaborator with no internal state the
/// pipeline needs to know about — used for the ANSI-cursor filter, which
/// §9's Open Questions resolves as "opaque external collaborator" rather
/// than a concrete CSI table. The default implementation is a pass-through;
/// a real ANSI filter can be substituted without changing the pipeline.
pub trait InlineFilter: Send {
    /// Transform bytes moving in the serial→tcp direction. Returning fewer
    /// bytes than were offered means the rest must be retried on the next
    /// call with the same suffix (mirrors the telnet framer's `PARTIAL`
    /// contract in §4.C).
    fn filter(&mut self, input: &[u8], output: &mut Vec<u8>) -> usize;
}

/// Pass-through stub satisfying [`InlineFilter`] for the ANSI-cursor
/// collaborator. No CSI final-byte table is implemented — see
/// `DESIGN.md`'s Open Question resolution.
#[derive(Debug, Default)]
pub struct AnsiPassthroughFilter;

impl InlineFilter for AnsiPassthroughFilter {
    fn filter(&mut self, input: &[u8], output: &mut Vec<u8>) -> usize {
        output.extend_from_slice(input);
        input.len()
    }
}

/// In-memory endpoint for pipeline/scheduler tests. Reads are served from a
/// preloaded queue; writes are appended to a capture buffer. No real fd.
#[cfg(test)]
pub struct MockEndpoint {
    pub inbox: std::collections::VecDeque<u8>,
    pub outbox: Vec<u8>,
    pub healthy: bool,
    pub would_block_reads: bool,
}

#[cfg(test)]
impl MockEndpoint {
    pub fn new() -> Self {
        Self {
            inbox: std::collections::VecDeque::new(),
            outbox: Vec::new(),
            healthy: true,
            would_block_reads: false,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.inbox.extend(data.iter().copied());
    }
}

#[cfg(test)]
impl Endpoint for MockEndpoint {
    fn try_read(&mut self, buf: &mut [u8]) -> BridgeResult<(usize, Status)> {
        if self.would_block_reads || self.inbox.is_empty() {
            return Ok((0, Status::Complete));
        }
        let mut n = 0;
        while n < buf.len() {
            match self.inbox.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok((n, Status::Complete))
    }

    fn try_write(&mut self, buf: &[u8]) -> BridgeResult<(usize, Status)> {
        self.outbox.extend_from_slice(buf);
        Ok((buf.len(), Status::Complete))
    }

    fn is_healthy(&self) -> bool {
        self.healthy
    }

    fn close(&mut self) -> BridgeResult<()> {
        self.healthy = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_endpoint_round_trips_bytes() {
        let mut ep = MockEndpoint::new();
        ep.feed(b"hello");
        let mut buf = [0u8; 16];
        let (n, status) = ep.try_read(&mut buf).unwrap();
        assert_eq!(status, Status::Complete);
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn mock_endpoint_write_captures_bytes() {
        let mut ep = MockEndpoint::new();
        ep.try_write(b"world").unwrap();
        assert_eq!(ep.outbox, b"world");
    }

    #[test]
    fn ansi_passthrough_filter_is_identity() {
        let mut filter = AnsiPassthroughFilter;
        let mut out = Vec::new();
        let consumed = filter.filter(b"\x1b[2J hi", &mut out);
        assert_eq!(consumed, 7);
        assert_eq!(out, b"\x1b[2J hi");
    }
}
