//! Hayes AT command emulator (§4.B): command parsing, S-register file,
//! command/online mode toggle, `+++` escape detection with guard time, and
//! the hardware-message detector for an external physical modem.
//!
//! The AT round-trip shape (accumulate a line, classify it, produce a
//! response) and the line-parsing style for modem status text are
//! grounded on this codebase's native AT-command client (which talks to a
//! real modem) and its cellular-signal response parsers (which turn
//! modem-emitted lines into typed data) — both accumulate-then-classify a
//! line of modem text. Everything here is new relative to those: the
//! teacher's `Modem` only ever sends commands *to* a real modem and reads
//! its replies; this type instead *emulates* one, answering AT commands
//! itself and tracking the online/command mode toggle.

use std::time::{Duration, Instant};

/// Overall modem mode, §3's `Modem` state set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModemState {
    Command,
    Connecting,
    Online,
    Ringing,
    Disconnected,
}

/// Numeric result codes, §4.B. `Display` below renders the verbose string
/// when `V1` is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Ok = 0,
    Connect = 1,
    Ring = 2,
    NoCarrier = 3,
    Error = 4,
    ConnectSpeed = 5,
    NoDialtone = 6,
    Busy = 7,
    NoAnswer = 8,
}

impl ResultCode {
    fn verbose(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Connect => "CONNECT",
            Self::Ring => "RING",
            Self::NoCarrier => "NO CARRIER",
            Self::Error => "ERROR",
            Self::ConnectSpeed => "CONNECT",
            Self::NoDialtone => "NO DIALTONE",
            Self::Busy => "BUSY",
            Self::NoAnswer => "NO ANSWER",
        }
    }
}

const NUM_REGISTERS: usize = 16;
/// S0 — rings before auto-answer (0 disables).
const REG_AUTO_ANSWER: usize = 0;
/// S2 — escape character (default `+` = 43).
const REG_ESCAPE_CHAR: usize = 2;
/// S7 — seconds to wait for carrier.
const REG_CARRIER_WAIT: usize = 7;
/// S12 — escape guard time, units of 20ms (default 50 = 1s).
const REG_GUARD_TIME: usize = 12;

fn default_registers() -> [u8; NUM_REGISTERS] {
    let mut regs = [0u8; NUM_REGISTERS];
    regs[REG_ESCAPE_CHAR] = b'+';
    regs[REG_CARRIER_WAIT] = 60;
    regs[REG_GUARD_TIME] = 50;
    regs
}

/// Tracks the `+++` escape-sequence detector independently of ordinary
/// line accumulation, since it runs on the raw byte stream regardless of
/// line boundaries (§4.B).
struct EscapeDetector {
    plus_count: u8,
    first_plus_at: Option<Instant>,
    last_byte_at: Instant,
    /// Idle time observed immediately before the first `+` of the current
    /// attempt arrived — captured once, at that moment, since it can't be
    /// reconstructed later from `first_plus_at` (that only tells us when
    /// the window *started*, not how long it was quiet beforehand).
    leading_idle: Duration,
    /// Bytes buffered while a `+++` sequence might still be forming; these
    /// must be forwarded verbatim if the sequence turns out not to
    /// qualify.
    pending: Vec<u8>,
}

impl EscapeDetector {
    fn new() -> Self {
        Self {
            plus_count: 0,
            first_plus_at: None,
            last_byte_at: Instant::now(),
            leading_idle: Duration::ZERO,
            pending: Vec::new(),
        }
    }

    fn reset(&mut self) {
        self.plus_count = 0;
        self.first_plus_at = None;
        self.pending.clear();
    }
}

/// Outcome of feeding one byte to the escape detector.
enum EscapeOutcome {
    /// Byte consumed, still waiting — nothing to forward yet.
    Pending,
    /// The `+++` sequence qualified: guard time satisfied on both sides.
    /// Caller should wait `guard_time` more before transitioning, then
    /// emit `OK`.
    Escaped,
    /// The attempt failed (non-`+` arrived, or guard time violated); the
    /// buffered bytes (including the current one) must be forwarded
    /// verbatim.
    Forward(Vec<u8>),
}

/// Hayes AT command emulator.
pub struct Modem {
    state: ModemState,
    registers: [u8; NUM_REGISTERS],
    echo: bool,
    verbose: bool,
    quiet: bool,
    escape: EscapeDetector,
    hw_msg_buf: Vec<u8>,
    hw_msg_last_activity: Instant,
    ring_count: u32,
    line_buf: Vec<u8>,
    /// Set by `ATH` inside `execute_command_body`; the caller (supervisor,
    /// for an in-call escape) checks and clears this to know the call must
    /// hang up, since `state() == Command` alone can't distinguish "just
    /// escaped, awaiting another command" from "told to hang up".
    hangup_requested: bool,
}

impl Default for Modem {
    fn default() -> Self {
        Self::new()
    }
}

impl Modem {
    pub fn new() -> Self {
        Self {
            state: ModemState::Command,
            registers: default_registers(),
            echo: true,
            verbose: true,
            quiet: false,
            escape: EscapeDetector::new(),
            hw_msg_buf: Vec::new(),
            hw_msg_last_activity: Instant::now(),
            ring_count: 0,
            line_buf: Vec::new(),
            hangup_requested: false,
        }
    }

    pub fn state(&self) -> ModemState {
        self.state
    }

    /// Returns `true` exactly once per `ATH`, clearing the flag.
    pub fn take_hangup_requested(&mut self) -> bool {
        std::mem::take(&mut self.hangup_requested)
    }

    pub fn register(&self, n: usize) -> Option<u8> {
        self.registers.get(n).copied()
    }

    fn guard_time(&self) -> Duration {
        Duration::from_millis(u64::from(self.registers[REG_GUARD_TIME]) * 20)
    }

    /// Format a result code as the wire response, honoring `V0`/`V1` and
    /// `Q1` (suppressed entirely).
    fn format_result(&self, code: ResultCode) -> String {
        if self.quiet {
            return String::new();
        }
        if self.verbose {
            format!("{}\r\n", code.verbose())
        } else {
            format!("{}\r\n", code as u8)
        }
    }

    /// Feed one line of serial input accumulated up to CR (COMMAND mode
    /// only). Returns the formatted response to write back to the serial
    /// peer.
    pub fn feed_command_line(&mut self, raw_line: &[u8]) -> String {
        let line = String::from_utf8_lossy(raw_line);
        let trimmed = line.trim();
        let upper = trimmed.to_uppercase();

        let body = match upper.strip_prefix("AT") {
            Some(b) => b,
            None => return self.format_result(ResultCode::Error),
        };

        match self.execute_command_body(body) {
            Some(code) => self.format_result(code),
            None => self.format_result(ResultCode::Error),
        }
    }

    /// Scan left-to-right over the command body (everything after `AT`),
    /// executing each recognized token. Returns the final result code, or
    /// `None` for `ERROR` (on the first unrecognized token).
    fn execute_command_body(&mut self, body: &str) -> Option<ResultCode> {
        let mut chars = body.chars().peekable();
        let mut result = ResultCode::Ok;

        while let Some(&c) = chars.peek() {
            match c {
                'A' => {
                    chars.next();
                    self.state = ModemState::Online;
                    result = ResultCode::Connect;
                }
                'D' => {
                    // No-op dial: the session's TCP target is fixed by
                    // config (§1 Non-goals). Consume the rest of the line
                    // as the dial string and pretend to connect.
                    chars.next();
                    while chars.peek().is_some() {
                        chars.next();
                    }
                    self.state = ModemState::Connecting;
                    result = ResultCode::Connect;
                }
                'E' => {
                    chars.next();
                    self.echo = read_digit(&mut chars, true)? != 0;
                }
                'H' => {
                    chars.next();
                    let _ = read_digit(&mut chars, false);
                    self.state = ModemState::Command;
                    self.hangup_requested = true;
                    result = ResultCode::NoCarrier;
                }
                'I' => {
                    chars.next();
                    let _ = read_digit(&mut chars, false);
                }
                'O' => {
                    chars.next();
                    self.state = ModemState::Online;
                    result = ResultCode::Connect;
                }
                'Q' => {
                    chars.next();
                    self.quiet = read_digit(&mut chars, true)? != 0;
                }
                'S' => {
                    chars.next();
                    let reg: usize = read_number(&mut chars)?.into();
                    match chars.peek() {
                        Some('=') => {
                            chars.next();
                            let value = read_number(&mut chars)?;
                            *self.registers.get_mut(reg)?= value;
                        }
                        Some('?') => {
                            chars.next();
                            // Query handled by caller reading register();
                            // command itself still just returns OK.
                        }
                        _ => return None,
                    }
                }
                'V' => {
                    chars.next();
                    self.verbose = read_digit(&mut chars, true)? != 0;
                }
                'Z' => {
                    chars.next();
                    self.reset_to_defaults();
                }
                'B' | 'L' | 'M' | 'X' => {
                    chars.next();
                    let _ = read_number(&mut chars);
                }
                '&' => {
                    chars.next();
                    match chars.next() {
                        Some('C' | 'D' | 'S' | 'V' | 'W') => {
                            let _ = read_number(&mut chars);
                        }
                        Some('F') => self.reset_to_defaults(),
                        _ => return None,
                    }
                }
                '\\' => {
                    chars.next();
                    match chars.next() {
                        Some('N') => {
                            let _ = read_number(&mut chars);
                        }
                        _ => return None,
                    }
                }
                ' ' => {
                    chars.next();
                }
                _ => return None,
            }
        }

        Some(result)
    }

    fn reset_to_defaults(&mut self) {
        self.registers = default_registers();
        self.echo = true;
        self.verbose = true;
        self.quiet = false;
    }

    /// Feed one byte of ONLINE-mode serial input to the `+++` detector.
    /// Returns `Some(bytes)` of data that must be forwarded verbatim (the
    /// detector gave up on the current attempt), or `None` while the
    /// attempt is still pending. When the sequence fully qualifies,
    /// `self.state` transitions to `Command` and the caller should write
    /// `OK` back to the serial peer (`feed_plus_escape` performs that
    /// transition internally once the trailing guard time has also been
    /// observed via a follow-up call with no bytes — see tests).
    pub fn feed_plus_escape(&mut self, byte: u8, now: Instant) -> Option<Vec<u8>> {
        let idle = now.duration_since(self.escape.last_byte_at);
        self.escape.last_byte_at = now;

        if byte != self.registers[REG_ESCAPE_CHAR] {
            let mut out = std::mem::take(&mut self.escape.pending);
            out.push(byte);
            self.escape.reset();
            return Some(out);
        }

        if self.escape.plus_count == 0 {
            self.escape.leading_idle = idle;
            self.escape.first_plus_at = Some(now);
            self.escape.plus_count = 1;
            self.escape.pending.push(byte);
            return None;
        }

        // Subsequent '+' bytes: the leading idle was already captured when
        // the first '+' arrived (`leading_idle`); here we only require the
        // pluses be contiguous (no large idle is required *between* them by
        // spec — only before the first and after the third).
        self.escape.plus_count += 1;
        self.escape.pending.push(byte);

        if self.escape.plus_count == 3 {
            // Qualification of trailing guard time happens in
            // `check_plus_guard_elapsed`, called by the caller after
            // `guard_time()` has passed with no further bytes.
            None
        } else {
            None
        }
    }

    /// Call when the caller has observed `guard_time()` of idle following a
    /// completed 3-plus sequence with no intervening non-`+` byte. Returns
    /// `true` and transitions to `Command` (caller then writes `OK`) if the
    /// leading guard time was also satisfied; otherwise forwards the
    /// buffered pluses and resets.
    pub fn check_plus_guard_elapsed(&mut self, now: Instant) -> Option<Vec<u8>> {
        if self.escape.plus_count != 3 {
            return None;
        }
        if self.escape.first_plus_at.is_none() {
            return None;
        }
        let idle_before = self.escape.leading_idle;
        let idle_after = now.duration_since(self.escape.last_byte_at);

        if idle_before >= self.guard_time() && idle_after >= self.guard_time() {
            self.state = ModemState::Command;
            self.escape.reset();
            Some(Vec::new())
        } else {
            let out = std::mem::take(&mut self.escape.pending);
            self.escape.reset();
            Some(out)
        }
    }

    /// Feed bytes from an external physical modem's status-line stream
    /// (§4.B "hardware-message detector"). Recognizes `RING`,
    /// `CONNECT[ <speed>[/<qualifier>]]`, `NO CARRIER`, `BUSY`,
    /// `NO DIALTONE`, `NO ANSWER`. `CONNECT` is only accepted with a
    /// complete trailing line terminator (the stronger of the two
    /// contradictory source behaviors — see `DESIGN.md`). Returns the
    /// recognized message and, for `CONNECT <n>`, the parsed speed.
    pub fn feed_hardware_message(&mut self, data: &[u8]) -> Vec<HardwareMessage> {
        self.hw_msg_last_activity = Instant::now();
        self.hw_msg_buf.extend_from_slice(data);

        let mut messages = Vec::new();
        loop {
            let Some(term_pos) = self.hw_msg_buf.iter().position(|&b| b == b'\r' || b == b'\n')
            else {
                break;
            };
            let line: Vec<u8> = self.hw_msg_buf.drain(..=term_pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            if text == "RING" {
                self.ring_count += 1;
                self.state = ModemState::Ringing;
                messages.push(HardwareMessage::Ring(self.ring_count));
            } else if let Some(rest) = text.strip_prefix("CONNECT") {
                let speed = rest.trim().split('/').next().and_then(|s| s.trim().parse::<u32>().ok());
                self.state = ModemState::Online;
                self.ring_count = 0;
                messages.push(HardwareMessage::Connect(speed));
            } else if text == "NO CARRIER" {
                self.state = ModemState::Disconnected;
                messages.push(HardwareMessage::NoCarrier);
            } else if text == "BUSY" {
                self.state = ModemState::Disconnected;
                messages.push(HardwareMessage::Busy);
            } else if text == "NO DIALTONE" {
                self.state = ModemState::Disconnected;
                messages.push(HardwareMessage::NoDialtone);
            } else if text == "NO ANSWER" {
                self.state = ModemState::Disconnected;
                messages.push(HardwareMessage::NoAnswer);
            }
        }
        messages
    }

    /// Whether the S0-th RING (or `max(S0, 2)` when `S0 == 0`) has been
    /// reached, i.e. auto-answer should fire `ATA` now.
    pub fn should_auto_answer(&self) -> bool {
        let s0 = self.registers[REG_AUTO_ANSWER];
        let threshold = if s0 == 0 { 2 } else { u32::from(s0) };
        self.ring_count >= threshold
    }

    pub fn carrier_wait_secs(&self) -> u8 {
        self.registers[REG_CARRIER_WAIT]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareMessage {
    Ring(u32),
    Connect(Option<u32>),
    NoCarrier,
    Busy,
    NoDialtone,
    NoAnswer,
}

fn read_digit(chars: &mut std::iter::Peekable<std::str::Chars>, default_one: bool) -> Option<u8> {
    match chars.peek() {
        Some(c) if c.is_ascii_digit() => {
            let d = c.to_digit(10).unwrap() as u8;
            chars.next();
            Some(d)
        }
        _ => Some(u8::from(default_one)),
    }
}

fn read_number(chars: &mut std::iter::Peekable<std::str::Chars>) -> Option<u8> {
    let mut s = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() {
            s.push(c);
            chars.next();
        } else {
            break;
        }
    }
    if s.is_empty() {
        Some(0)
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_alone_returns_ok() {
        let mut m = Modem::new();
        assert_eq!(m.feed_command_line(b"AT\r"), "OK\r\n");
    }

    #[test]
    fn ath_sets_hangup_requested_and_returns_to_command() {
        let mut m = Modem::new();
        m.feed_command_line(b"ATA\r");
        assert!(!m.take_hangup_requested());
        m.feed_command_line(b"ATH\r");
        assert_eq!(m.state(), ModemState::Command);
        assert!(m.take_hangup_requested());
        // Consumed — doesn't stick around for the next command.
        assert!(!m.take_hangup_requested());
    }

    #[test]
    fn ata_transitions_to_online_and_connect() {
        let mut m = Modem::new();
        assert_eq!(m.feed_command_line(b"ATA\r"), "CONNECT\r\n");
        assert_eq!(m.state(), ModemState::Online);
    }

    #[test]
    fn unknown_command_returns_error() {
        let mut m = Modem::new();
        assert_eq!(m.feed_command_line(b"ATQQ9\r"), "ERROR\r\n");
    }

    #[test]
    fn v0_mode_uses_numeric_result_codes() {
        let mut m = Modem::new();
        m.feed_command_line(b"ATV0\r");
        assert_eq!(m.feed_command_line(b"AT\r"), "0\r\n");
    }

    #[test]
    fn quiet_mode_suppresses_all_responses() {
        let mut m = Modem::new();
        m.feed_command_line(b"ATQ1\r");
        assert_eq!(m.feed_command_line(b"AT\r"), "");
    }

    #[test]
    fn s_register_write_then_query() {
        let mut m = Modem::new();
        m.feed_command_line(b"ATS0=3\r");
        assert_eq!(m.register(0), Some(3));
    }

    #[test]
    fn factory_reset_restores_defaults() {
        let mut m = Modem::new();
        m.feed_command_line(b"ATS0=9\r");
        m.feed_command_line(b"ATZ\r");
        assert_eq!(m.register(0), Some(0));
    }

    #[test]
    fn plus_plus_plus_with_guard_time_switches_to_command() {
        let mut m = Modem::new();
        m.state = ModemState::Online;
        let t0 = Instant::now();
        assert!(m.feed_plus_escape(b'+', t0).is_none());
        assert!(m.feed_plus_escape(b'+', t0 + Duration::from_millis(10)).is_none());
        assert!(m.feed_plus_escape(b'+', t0 + Duration::from_millis(20)).is_none());

        // Forge both sides of the guard window: idle observed before the
        // first '+' arrived, and the trailing idle since the third.
        m.escape.leading_idle = Duration::from_millis(1100);
        m.escape.last_byte_at = Instant::now() - Duration::from_millis(1100);
        let result = m.check_plus_guard_elapsed(Instant::now());
        assert_eq!(result, Some(Vec::new()));
        assert_eq!(m.state(), ModemState::Command);
    }

    #[test]
    fn plus_plus_plus_without_leading_idle_does_not_escape() {
        let mut m = Modem::new();
        m.state = ModemState::Online;
        let t0 = Instant::now();
        // Continuous traffic right up to the first '+' — no leading idle.
        assert!(m.feed_plus_escape(b'x', t0).is_some());
        assert!(m.feed_plus_escape(b'+', t0 + Duration::from_millis(1)).is_none());
        assert!(m.feed_plus_escape(b'+', t0 + Duration::from_millis(11)).is_none());
        assert!(m.feed_plus_escape(b'+', t0 + Duration::from_millis(21)).is_none());

        // Trailing guard time elapses, but the leading guard never did.
        m.escape.last_byte_at = Instant::now() - Duration::from_millis(1100);
        let result = m.check_plus_guard_elapsed(Instant::now());
        assert_eq!(result, Some(b"+++".to_vec()));
        assert_eq!(m.state(), ModemState::Online);
    }

    #[test]
    fn non_plus_byte_forwards_buffered_pluses() {
        let mut m = Modem::new();
        m.state = ModemState::Online;
        let t0 = Instant::now();
        m.feed_plus_escape(b'+', t0).unwrap_or_default();
        let forwarded = m.feed_plus_escape(b'x', t0 + Duration::from_millis(5));
        assert_eq!(forwarded, Some(vec![b'+', b'x']));
    }

    #[test]
    fn hardware_connect_requires_line_terminator() {
        let mut m = Modem::new();
        let msgs = m.feed_hardware_message(b"\r\nC");
        assert!(msgs.is_empty());
        let msgs = m.feed_hardware_message(b"ONNECT 2400\r\n");
        assert_eq!(msgs, vec![HardwareMessage::Connect(Some(2400))]);
    }

    #[test]
    fn ring_increments_count_and_sets_ringing_state() {
        let mut m = Modem::new();
        m.feed_hardware_message(b"RING\r\n");
        assert_eq!(m.state(), ModemState::Ringing);
        m.feed_hardware_message(b"RING\r\n");
        assert!(m.should_auto_answer());
    }

    #[test]
    fn s0_zero_falls_back_to_two_rings() {
        let mut m = Modem::new();
        m.feed_hardware_message(b"RING\r\nRING\r\n");
        assert!(m.should_auto_answer());
    }
}
