//! Error kinds shared by every component. All are values, never exceptions —
//! the supervisor pattern-matches on these to decide whether to log, retry,
//! or fold into a lifecycle transition (e.g. `Hangup` always becomes a
//! `Flushing` transition, never a panic).

use std::fmt;

/// A single error value produced by any component in the bridge.
#[derive(Debug)]
pub enum BridgeError {
    /// Errno-backed I/O failure, tagged with the syscall that produced it.
    Io { syscall: &'static str, source: std::io::Error },
    /// Carrier lost or peer closed — a normal lifecycle event, not a fault.
    Hangup,
    /// A bounded wait exceeded its deadline.
    Timeout,
    /// The serial device is already locked by another process.
    Locked { pid: u32 },
    /// Caller-supplied argument is invalid.
    InvalidArg(String),
    /// An operation was attempted from a state that forbids it.
    InvalidState { from: &'static str, action: &'static str },
    /// A buffer dropped bytes under sustained overflow.
    Overflow { dropped: usize },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { syscall, source } => write!(f, "{syscall}: {source}"),
            Self::Hangup => write!(f, "carrier lost or peer closed"),
            Self::Timeout => write!(f, "operation timed out"),
            Self::Locked { pid } => write!(f, "serial device locked by pid {pid}"),
            Self::InvalidArg(msg) => write!(f, "invalid argument: {msg}"),
            Self::InvalidState { from, action } => {
                write!(f, "cannot {action} from state {from}")
            }
            Self::Overflow { dropped } => write!(f, "buffer overflow, dropped {dropped} bytes"),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl BridgeError {
    pub fn io(syscall: &'static str, source: std::io::Error) -> Self {
        Self::Io { syscall, source }
    }

    /// Errno-level classification used to turn raw I/O failures into
    /// `Hangup` rather than a generic `Io`, per the §7 propagation policy.
    pub fn from_errno(syscall: &'static str, source: std::io::Error) -> Self {
        match source.raw_os_error() {
            Some(libc::EPIPE | libc::ECONNRESET) => Self::Hangup,
            Some(libc::EAGAIN) => Self::Io { syscall, source },
            _ => Self::Io { syscall, source },
        }
    }
}

/// Non-error flow-control signals a read/write call can return. These are
/// not `Err` variants of `BridgeError` — the scheduler consumes them
/// directly as normal control flow (§7: "not errors, normal flow-control
/// signals").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The call completed and transferred the given byte count.
    Complete,
    /// The destination buffer is backpressured; no bytes were accepted.
    WouldBlock,
    /// Only part of the input could be consumed; the caller must retry
    /// with the remaining suffix.
    Partial,
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hangup_display_is_readable() {
        assert_eq!(BridgeError::Hangup.to_string(), "carrier lost or peer closed");
    }

    #[test]
    fn from_errno_classifies_epipe_as_hangup() {
        let e = std::io::Error::from_raw_os_error(libc::EPIPE);
        assert!(matches!(BridgeError::from_errno("write", e), BridgeError::Hangup));
    }

    #[test]
    fn from_errno_classifies_econnreset_as_hangup() {
        let e = std::io::Error::from_raw_os_error(libc::ECONNRESET);
        assert!(matches!(BridgeError::from_errno("read", e), BridgeError::Hangup));
    }

    #[test]
    fn from_errno_keeps_other_errors_as_io() {
        let e = std::io::Error::from_raw_os_error(libc::ENOENT);
        assert!(matches!(BridgeError::from_errno("open", e), BridgeError::Io { .. }));
    }
}
