//! Adapters wiring the Hayes inline filter, the `+++` escape detector, and
//! the telnet framer onto the two [`Endpoint`] halves the dual pipeline
//! moves bytes between (§2's data-flow: serial → filter → framer → TCP,
//! and the mirror image). Each adapter carries any input it couldn't
//! fully consume in an internal staging buffer across calls, which is how
//! the multibyte-safety note in §4.D is honored without the pipeline
//! itself knowing anything about character boundaries.

use std::time::Instant;

use crate::endpoint::Endpoint;
use crate::error::{BridgeError, BridgeResult, Status};
use crate::hayes_filter::HayesFilter;
use crate::modem::{Modem, ModemState};
use crate::serial::SerialEndpoint;
use crate::tcp::TcpEndpoint;
use crate::telnet::TelnetFramer;

/// serial→tcp direction source: raw serial bytes run through the `+++`
/// escape detector and the Hayes inline filter before the pipeline ever
/// sees them. Only constructed while the modem is ONLINE (§4.E) — command
/// mode is handled entirely outside the pipeline by the supervisor.
pub struct SerialOnlineSource<'a> {
    serial: &'a mut SerialEndpoint,
    modem: &'a mut Modem,
    hayes: &'a mut HayesFilter,
    staged: Vec<u8>,
    staged_pos: usize,
}

impl<'a> SerialOnlineSource<'a> {
    pub fn new(serial: &'a mut SerialEndpoint, modem: &'a mut Modem, hayes: &'a mut HayesFilter) -> Self {
        Self { serial, modem, hayes, staged: Vec::new(), staged_pos: 0 }
    }

    fn drain_staged(&mut self, buf: &mut [u8]) -> usize {
        let available = self.staged.len() - self.staged_pos;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.staged[self.staged_pos..self.staged_pos + n]);
        self.staged_pos += n;
        if self.staged_pos == self.staged.len() {
            self.staged.clear();
            self.staged_pos = 0;
        }
        n
    }
}

impl Endpoint for SerialOnlineSource<'_> {
    fn try_read(&mut self, buf: &mut [u8]) -> BridgeResult<(usize, Status)> {
        if !self.staged.is_empty() {
            return Ok((self.drain_staged(buf), Status::Complete));
        }

        let mut raw = [0u8; 4096];
        let n = self.serial.read(&mut raw)?;

        if n == 0 {
            // Idle tick: give the escape detector a chance to conclude a
            // pending `+++` attempt once its trailing guard time has
            // elapsed with no further bytes (§4.B).
            if let Some(forwarded) = self.modem.check_plus_guard_elapsed(Instant::now()) {
                if forwarded.is_empty() {
                    // Qualified: the modem already transitioned to
                    // COMMAND. `OK` goes straight to the serial peer, not
                    // through the pipeline.
                    let _ = self.serial.write_robust(b"OK\r\n");
                } else {
                    self.hayes.feed(&forwarded, &mut self.staged);
                }
            }
            if self.staged.is_empty() {
                return Ok((0, Status::Complete));
            }
            return Ok((self.drain_staged(buf), Status::Complete));
        }

        let mut to_forward = Vec::with_capacity(n);
        for &b in &raw[..n] {
            if let Some(bytes) = self.modem.feed_plus_escape(b, Instant::now()) {
                to_forward.extend_from_slice(&bytes);
            }
        }
        self.hayes.feed(&to_forward, &mut self.staged);

        if matches!(self.modem.state(), ModemState::Command) {
            let _ = self.serial.write_robust(b"OK\r\n");
        }

        Ok((self.drain_staged(buf), Status::Complete))
    }

    fn try_write(&mut self, _buf: &[u8]) -> BridgeResult<(usize, Status)> {
        Err(BridgeError::InvalidState { from: "SerialOnlineSource", action: "write" })
    }

    fn is_healthy(&self) -> bool {
        self.serial.is_healthy()
    }

    fn close(&mut self) -> BridgeResult<()> {
        self.serial.close()
    }
}

/// tcp sink: escapes every `0xFF` before writing, per §4.C. Reports the
/// number of *original* (pre-escape) bytes accepted so the caller's
/// `EnhancedBuffer::drain` bookkeeping stays in application-byte units.
pub struct TelnetSink<'a> {
    tcp: &'a mut TcpEndpoint,
}

impl<'a> TelnetSink<'a> {
    pub fn new(tcp: &'a mut TcpEndpoint) -> Self {
        Self { tcp }
    }
}

const IAC: u8 = 0xFF;

impl Endpoint for TelnetSink<'_> {
    fn try_read(&mut self, _buf: &mut [u8]) -> BridgeResult<(usize, Status)> {
        Err(BridgeError::InvalidState { from: "TelnetSink", action: "read" })
    }

    fn try_write(&mut self, buf: &[u8]) -> BridgeResult<(usize, Status)> {
        let mut consumed = 0;
        for &b in buf {
            let chunk: [u8; 2] = if b == IAC { [IAC, IAC] } else { [b, 0] };
            let chunk_len = if b == IAC { 2 } else { 1 };
            let (n, status) = self.tcp.try_write(&chunk[..chunk_len])?;
            if n < chunk_len {
                // Can't guarantee an original-byte boundary mid-escape;
                // stop here, caller retries from `consumed` onward.
                return Ok((consumed, Status::Partial));
            }
            consumed += 1;
            if status == Status::WouldBlock {
                return Ok((consumed, Status::WouldBlock));
            }
        }
        Ok((consumed, Status::Complete))
    }

    fn is_healthy(&self) -> bool {
        self.tcp.is_healthy()
    }

    fn close(&mut self) -> BridgeResult<()> {
        self.tcp.close()
    }
}

/// tcp→serial direction source: raw TCP bytes run through the telnet
/// framer's IAC state machine (unescape, option negotiation). Any
/// negotiation replies the framer produces are sent back out on the TCP
/// side immediately — they're control bytes, not pipeline data.
pub struct TelnetSource<'a> {
    tcp: &'a mut TcpEndpoint,
    framer: &'a mut TelnetFramer,
    pending_raw: Vec<u8>,
}

impl<'a> TelnetSource<'a> {
    pub fn new(tcp: &'a mut TcpEndpoint, framer: &'a mut TelnetFramer) -> Self {
        Self { tcp, framer, pending_raw: Vec::new() }
    }
}

impl Endpoint for TelnetSource<'_> {
    fn try_read(&mut self, buf: &mut [u8]) -> BridgeResult<(usize, Status)> {
        if self.pending_raw.is_empty() {
            let mut raw = [0u8; 4096];
            let (n, _status) = self.tcp.try_read(&mut raw)?;
            if n > 0 {
                self.pending_raw.extend_from_slice(&raw[..n]);
            }
        }
        if self.pending_raw.is_empty() {
            return Ok((0, Status::Complete));
        }

        let mut out = Vec::with_capacity(buf.len().max(1));
        let mut replies = Vec::new();
        let (consumed, _status) = self.framer.parse(&self.pending_raw, &mut out, &mut replies);

        if !replies.is_empty() {
            if let Err(e) = self.tcp.try_write(&replies) {
                tracing::warn!("failed to send telnet negotiation reply: {e}");
            }
        }

        self.pending_raw.drain(..consumed);

        let n = out.len().min(buf.len());
        buf[..n].copy_from_slice(&out[..n]);
        Ok((n, Status::Complete))
    }

    fn try_write(&mut self, _buf: &[u8]) -> BridgeResult<(usize, Status)> {
        Err(BridgeError::InvalidState { from: "TelnetSource", action: "write" })
    }

    fn is_healthy(&self) -> bool {
        self.tcp.is_healthy()
    }

    fn close(&mut self) -> BridgeResult<()> {
        self.tcp.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MockEndpoint;

    #[test]
    fn online_source_suppresses_at_command_line() {
        let mut serial_buf = MockEndpoint::new();
        serial_buf.feed(b"AT\r");
        // SerialOnlineSource wraps a real SerialEndpoint in production;
        // the line-suppression logic itself is exercised directly via
        // HayesFilter in hayes_filter's own tests. This test instead
        // checks the escape-forward plumbing in isolation.
        let mut modem = Modem::new();
        let mut hayes = HayesFilter::new();
        let mut staged = Vec::new();
        for &b in b"Athens\r" {
            if let Some(bytes) = modem.feed_plus_escape(b, Instant::now()) {
                hayes.feed(&bytes, &mut staged);
            }
        }
        assert_eq!(staged, b"Athens\r");
        let _ = serial_buf;
    }

    #[test]
    fn telnet_sink_doubles_iac_byte() {
        // Verified at the escape-function level in telnet.rs; this just
        // confirms the per-byte chunk construction used above matches it.
        let b = 0xFFu8;
        let chunk: [u8; 2] = if b == IAC { [IAC, IAC] } else { [b, 0] };
        assert_eq!(&chunk[..2], &[0xFF, 0xFF]);
    }
}
