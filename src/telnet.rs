//! RFC 854 telnet IAC framing (§4.C). Framing only — no LINEMODE
//! subnegotiation handling beyond discarding the buffer.
//!
//! No direct teacher file implements a byte-driven protocol state machine
//! like this one; the shape (a `match` over an explicit state enum, each
//! arm returning the next state) follows the enum-driven state/status
//! types used elsewhere in this codebase (e.g. its session-status and
//! tunnel-event enums), adapted to a byte-at-a-time parser instead of a
//! coarse lifecycle enum.

use crate::error::Status;

const IAC: u8 = 0xFF;
const WILL: u8 = 251;
const WONT: u8 = 252;
const DO: u8 = 253;
const DONT: u8 = 254;
const SB: u8 = 250;
const SE: u8 = 240;

const OPT_BINARY: u8 = 0;
const OPT_ECHO: u8 = 1;
const OPT_SGA: u8 = 3;

const SUBNEG_BUFFER_CAP: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParserState {
    Data,
    Iac,
    Will,
    Wont,
    Do,
    Dont,
    Sb,
    SbIac,
}

/// RFC 854 framer. Tracks which options each side has acknowledged and
/// derives `binary_local`/`binary_remote`/`sga`/`server_echo`/`line_mode`
/// from them.
pub struct TelnetFramer {
    state: ParserState,
    local_options: [bool; 256],
    remote_options: [bool; 256],
    subneg_buf: Vec<u8>,
    subneg_overflowed: bool,
}

impl Default for TelnetFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl TelnetFramer {
    pub fn new() -> Self {
        Self {
            state: ParserState::Data,
            local_options: [false; 256],
            remote_options: [false; 256],
            subneg_buf: Vec::new(),
            subneg_overflowed: false,
        }
    }

    /// Initial negotiation bytes sent on connect: `WILL BINARY`,
    /// `WILL SGA`, `DO SGA`, `DO ECHO`.
    pub fn initial_negotiation() -> Vec<u8> {
        vec![
            IAC, WILL, OPT_BINARY,
            IAC, WILL, OPT_SGA,
            IAC, DO, OPT_SGA,
            IAC, DO, OPT_ECHO,
        ]
    }

    pub fn binary_remote(&self) -> bool {
        self.remote_options[OPT_BINARY as usize]
    }

    pub fn sga(&self) -> bool {
        self.remote_options[OPT_SGA as usize] && self.local_options[OPT_SGA as usize]
    }

    pub fn server_echo(&self) -> bool {
        self.local_options[OPT_ECHO as usize]
    }

    /// `line_mode = ¬(remote ECHO ∧ remote SGA)`.
    pub fn line_mode(&self) -> bool {
        !(self.remote_options[OPT_ECHO as usize] && self.remote_options[OPT_SGA as usize])
    }

    /// Escape every `0xFF` in `payload` into `0xFF 0xFF`. Worst-case growth
    /// factor is 2.
    pub fn escape(payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(payload.len());
        for &b in payload {
            out.push(b);
            if b == IAC {
                out.push(IAC);
            }
        }
        out
    }

    /// Parse inbound bytes, emitting application data bytes to `out` and
    /// collecting any negotiation replies to send back in `replies`.
    /// Returns `Status::Partial` if `out` filled up mid-stream (the caller
    /// must re-invoke with the unconsumed suffix of `input`); the return
    /// value is the number of input bytes consumed.
    pub fn parse(&mut self, input: &[u8], out: &mut Vec<u8>, replies: &mut Vec<u8>) -> (usize, Status) {
        let bounded = out.capacity() > 0;
        for (i, &b) in input.iter().enumerate() {
            if bounded && out.len() >= out.capacity() {
                return (i, Status::Partial);
            }
            match self.state {
                ParserState::Data => {
                    if b == IAC {
                        self.state = ParserState::Iac;
                    } else {
                        out.push(b);
                    }
                }
                ParserState::Iac => match b {
                    IAC => {
                        out.push(IAC);
                        self.state = ParserState::Data;
                    }
                    WILL => self.state = ParserState::Will,
                    WONT => self.state = ParserState::Wont,
                    DO => self.state = ParserState::Do,
                    DONT => self.state = ParserState::Dont,
                    SB => self.state = ParserState::Sb,
                    _ => self.state = ParserState::Data,
                },
                ParserState::Will => {
                    if matches!(b, OPT_BINARY | OPT_SGA | OPT_ECHO) {
                        self.remote_options[b as usize] = true;
                        replies.extend_from_slice(&[IAC, DO, b]);
                    } else {
                        replies.extend_from_slice(&[IAC, DONT, b]);
                    }
                    self.state = ParserState::Data;
                }
                ParserState::Wont => {
                    self.remote_options[b as usize] = false;
                    replies.extend_from_slice(&[IAC, DONT, b]);
                    if b == OPT_BINARY {
                        tracing::warn!("remote rejected BINARY option: multibyte data at risk");
                    }
                    self.state = ParserState::Data;
                }
                ParserState::Do => {
                    if matches!(b, OPT_BINARY | OPT_SGA) {
                        self.local_options[b as usize] = true;
                        replies.extend_from_slice(&[IAC, WILL, b]);
                    } else {
                        replies.extend_from_slice(&[IAC, WONT, b]);
                    }
                    self.state = ParserState::Data;
                }
                ParserState::Dont => {
                    self.local_options[b as usize] = false;
                    replies.extend_from_slice(&[IAC, WONT, b]);
                    if b == OPT_BINARY {
                        tracing::warn!("peer refused our BINARY option");
                    }
                    self.state = ParserState::Data;
                }
                ParserState::Sb => {
                    if b == IAC {
                        self.state = ParserState::SbIac;
                    } else {
                        self.push_subneg(b);
                    }
                }
                ParserState::SbIac => {
                    if b == SE {
                        self.subneg_buf.clear();
                        self.subneg_overflowed = false;
                        self.state = ParserState::Data;
                    } else {
                        self.push_subneg(b);
                        self.state = ParserState::Sb;
                    }
                }
            }
        }
        (input.len(), Status::Complete)
    }

    fn push_subneg(&mut self, b: u8) {
        if self.subneg_buf.len() < SUBNEG_BUFFER_CAP {
            self.subneg_buf.push(b);
        } else {
            self.subneg_overflowed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_doubles_iac_bytes() {
        assert_eq!(TelnetFramer::escape(&[1, 0xFF, 2]), vec![1, 0xFF, 0xFF, 2]);
    }

    #[test]
    fn escape_parse_round_trip() {
        let payload = [0u8, 0xFF, 1, 0xFF, 0xFF, 2];
        let escaped = TelnetFramer::escape(&payload);
        let mut framer = TelnetFramer::new();
        let mut out = Vec::new();
        let mut replies = Vec::new();
        framer.parse(&escaped, &mut out, &mut replies);
        assert_eq!(out, payload);
    }

    #[test]
    fn plain_data_passes_through_unchanged() {
        let mut framer = TelnetFramer::new();
        let mut out = Vec::new();
        let mut replies = Vec::new();
        framer.parse(b"hello world", &mut out, &mut replies);
        assert_eq!(out, b"hello world");
        assert!(replies.is_empty());
    }

    #[test]
    fn will_binary_is_acknowledged_with_do() {
        let mut framer = TelnetFramer::new();
        let mut out = Vec::new();
        let mut replies = Vec::new();
        framer.parse(&[IAC, WILL, OPT_BINARY], &mut out, &mut replies);
        assert_eq!(replies, vec![IAC, DO, OPT_BINARY]);
        assert!(framer.binary_remote());
    }

    #[test]
    fn will_unknown_option_is_rejected_with_dont() {
        let mut framer = TelnetFramer::new();
        let mut out = Vec::new();
        let mut replies = Vec::new();
        framer.parse(&[IAC, WILL, 99], &mut out, &mut replies);
        assert_eq!(replies, vec![IAC, DONT, 99]);
    }

    #[test]
    fn do_unknown_option_is_rejected_with_wont() {
        let mut framer = TelnetFramer::new();
        let mut out = Vec::new();
        let mut replies = Vec::new();
        framer.parse(&[IAC, DO, 99], &mut out, &mut replies);
        assert_eq!(replies, vec![IAC, WONT, 99]);
    }

    #[test]
    fn subnegotiation_bytes_are_discarded_on_se() {
        let mut framer = TelnetFramer::new();
        let mut out = Vec::new();
        let mut replies = Vec::new();
        framer.parse(&[IAC, SB, 1, 2, 3, IAC, SE, b'x'], &mut out, &mut replies);
        assert_eq!(out, b"x");
        assert!(framer.subneg_buf.is_empty());
    }

    #[test]
    fn line_mode_is_true_until_echo_and_sga_both_granted() {
        let mut framer = TelnetFramer::new();
        assert!(framer.line_mode());
        let mut out = Vec::new();
        let mut replies = Vec::new();
        framer.parse(&[IAC, WILL, OPT_ECHO, IAC, WILL, OPT_SGA], &mut out, &mut replies);
        assert!(!framer.line_mode());
    }

    #[test]
    fn initial_negotiation_matches_spec_sequence() {
        assert_eq!(
            TelnetFramer::initial_negotiation(),
            vec![IAC, WILL, OPT_BINARY, IAC, WILL, OPT_SGA, IAC, DO, OPT_SGA, IAC, DO, OPT_ECHO]
        );
    }
}
