//! Hayes inline filter (§4.E) — suppresses accidental AT commands typed
//! into the live data stream while the modem is ONLINE, without blocking
//! any line that doesn't case-insensitively start with `AT` at position 0.
//!
//! Line accumulation and the "flush on overflow" rule mirror the
//! line-buffering/echo-stripping idiom this codebase's native AT-command
//! client already uses when talking to a real modem (accumulate until a
//! terminator, then classify the whole line), generalized here to a
//! suppress-vs-pass decision instead of an echo strip.

const LINE_BUFFER_CAP: usize = 4096;

fn is_word_boundary_after_at(byte: u8) -> bool {
    let c = byte as char;
    c.is_ascii_alphanumeric() || matches!(byte, b'&' | b'\\' | b'+' | b'=' | b'?')
}

/// Per-direction filter state; only instantiated for the serial→tcp
/// direction while the modem is ONLINE (§3's "Hayes filter state").
pub struct HayesFilter {
    line: Vec<u8>,
}

impl Default for HayesFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl HayesFilter {
    pub fn new() -> Self {
        Self { line: Vec::new() }
    }

    /// Feed raw bytes through the filter. Complete, non-command lines
    /// (including their terminator) are appended to `out`; AT-command
    /// lines are dropped silently.
    pub fn feed(&mut self, input: &[u8], out: &mut Vec<u8>) {
        for &b in input {
            self.line.push(b);

            if b == b'\r' || b == b'\n' {
                if !Self::is_at_command_line(&self.line) {
                    out.extend_from_slice(&self.line);
                }
                self.line.clear();
                continue;
            }

            if self.line.len() >= LINE_BUFFER_CAP {
                out.extend_from_slice(&self.line);
                self.line.clear();
            }
        }
    }

    /// Step 2 of §4.E's algorithm: first two bytes case-insensitively
    /// `AT`, and either the line is exactly `AT<terminator>` or byte index
    /// 2 is a letter/digit/`&`/`\`/`+`/`=`/`?`.
    fn is_at_command_line(line: &[u8]) -> bool {
        if line.len() < 2 || !line[..2].eq_ignore_ascii_case(b"at") {
            return false;
        }
        if line.len() == 3 {
            // "AT\r" or "AT\n" — exactly 2 + terminator.
            return true;
        }
        line.len() > 3 && is_word_boundary_after_at(line[2])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(input: &[u8]) -> Vec<u8> {
        let mut filter = HayesFilter::new();
        let mut out = Vec::new();
        filter.feed(input, &mut out);
        out
    }

    #[test]
    fn bare_at_command_is_suppressed() {
        assert_eq!(run(b"AT\r"), b"");
    }

    #[test]
    fn at_with_subcommand_is_suppressed() {
        assert_eq!(run(b"ATH\r"), b"");
        assert_eq!(run(b"AT+CGMI\r"), b"");
    }

    #[test]
    fn lowercase_at_is_case_insensitively_suppressed() {
        assert_eq!(run(b"at\r"), b"");
    }

    #[test]
    fn athens_is_not_suppressed() {
        assert_eq!(run(b"Athens\r"), b"Athens\r");
    }

    #[test]
    fn chat_room_is_not_suppressed() {
        assert_eq!(run(b"CHAT ROOM\r"), b"CHAT ROOM\r");
    }

    #[test]
    fn email_with_at_sign_is_not_suppressed() {
        assert_eq!(run(b"onionmixer@gmail.com\r"), b"onionmixer@gmail.com\r");
    }

    #[test]
    fn overflowing_line_buffer_is_flushed_verbatim() {
        let long_line = vec![b'x'; LINE_BUFFER_CAP + 10];
        let out = run(&long_line);
        assert_eq!(out.len(), long_line.len());
    }
}
