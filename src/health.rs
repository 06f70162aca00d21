//! Health report (§6, §4.H): four checks — serial port accessibility,
//! serial init result with applied line params, modem AT responsiveness,
//! TCP reachability — each rated OK/WARNING/ERROR with a short message.
//!
//! `Serialize`-derived to match the teacher's `json!`-built health payload
//! shape (`routes/health.rs`), plus a `Display` impl for the plain-text
//! form `main` logs at startup and on every `SIGUSR1` (§4.H).

use std::fmt;

use serde::Serialize;

use crate::config::{Config, Parity};

/// Severity of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Warning,
    Error,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One rated check with a short human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub message: String,
}

impl HealthCheck {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Ok, message: message.into() }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Warning, message: message.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Error, message: message.into() }
    }
}

impl fmt::Display for HealthCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

/// The four-field health report §6 specifies.
#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub serial_port: HealthCheck,
    pub serial_init: HealthCheck,
    pub modem_responsive: HealthCheck,
    pub tcp_reachable: HealthCheck,
}

impl Health {
    /// `serial_port` accessibility: the device node exists and is a
    /// character device this process can open (best-effort check, does
    /// not itself open it — that's `serial_init`'s job).
    pub fn check_serial_port(config: &Config) -> HealthCheck {
        let path = &config.serial_port;
        match std::fs::metadata(path) {
            Ok(meta) => {
                use std::os::unix::fs::FileTypeExt;
                if meta.file_type().is_char_device() {
                    HealthCheck::ok(format!("{} is a character device", path.display()))
                } else {
                    HealthCheck::warning(format!("{} exists but is not a character device", path.display()))
                }
            }
            Err(e) => HealthCheck::error(format!("{}: {e}", path.display())),
        }
    }

    /// Serial init result, once the endpoint has actually been opened and
    /// configured — carries the applied line params in the message.
    pub fn serial_init_ok(config: &Config) -> HealthCheck {
        HealthCheck::ok(format!(
            "opened at {} baud, {}{}{}, flow {:?}",
            config.baudrate,
            config.bit_data,
            parity_letter(config.bit_parity),
            config.bit_stop,
            config.flow,
        ))
    }

    pub fn serial_init_failed(err: &crate::error::BridgeError) -> HealthCheck {
        HealthCheck::error(format!("serial init failed: {err}"))
    }

    /// Modem AT responsiveness: `true` if the modem answered `AT` with
    /// `OK` during `MODEM_INIT_COMMAND` processing at startup.
    pub fn modem_responsive(responded: bool) -> HealthCheck {
        if responded {
            HealthCheck::ok("modem responded to AT")
        } else {
            HealthCheck::warning("modem did not respond to AT during init")
        }
    }

    /// TCP reachability: whether the configured host:port accepted a probe
    /// connection (the real connect happens later, in CONNECTING).
    pub fn tcp_reachable(reachable: bool, host: &str, port: u16) -> HealthCheck {
        if reachable {
            HealthCheck::ok(format!("{host}:{port} reachable"))
        } else {
            HealthCheck::error(format!("{host}:{port} unreachable"))
        }
    }
}

fn parity_letter(p: Parity) -> &'static str {
    match p {
        Parity::None => "N",
        Parity::Even => "E",
        Parity::Odd => "O",
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "serial_port:      {}", self.serial_port)?;
        writeln!(f, "serial_init:      {}", self.serial_init)?;
        writeln!(f, "modem_responsive: {}", self.modem_responsive)?;
        write!(f, "tcp_reachable:    {}", self.tcp_reachable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modem_responsive_ok_when_answered() {
        assert_eq!(Health::modem_responsive(true).status, HealthStatus::Ok);
    }

    #[test]
    fn modem_responsive_warning_when_silent() {
        assert_eq!(Health::modem_responsive(false).status, HealthStatus::Warning);
    }

    #[test]
    fn tcp_reachable_error_when_unreachable() {
        let check = Health::tcp_reachable(false, "bbs.example.com", 23);
        assert_eq!(check.status, HealthStatus::Error);
        assert!(check.message.contains("bbs.example.com:23"));
    }

    #[test]
    fn display_renders_all_four_fields() {
        let health = Health {
            serial_port: HealthCheck::ok("fine"),
            serial_init: HealthCheck::ok("fine"),
            modem_responsive: HealthCheck::ok("fine"),
            tcp_reachable: HealthCheck::ok("fine"),
        };
        let text = health.to_string();
        assert!(text.contains("serial_port:"));
        assert!(text.contains("tcp_reachable:"));
    }
}
