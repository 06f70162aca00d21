//! Configuration loading for the bridge.
//!
//! Wire format is a flat `KEY=VALUE` text file (`#` comments and blank
//! lines ignored, no quoting) — see §6 of `SPEC_FULL.md` for the key
//! table. Precedence: environment variables named `MODEMBRIDGE_<KEY>`
//! override the file, the file overrides compiled defaults, following the
//! env > file > defaults chain this codebase uses for its own (TOML)
//! config, just with a different wire syntax.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Parity setting for the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Default for Parity {
    fn default() -> Self {
        Self::None
    }
}

/// Flow control mode for the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    None,
    Software,
    Hardware,
    Both,
}

impl Default for Flow {
    fn default() -> Self {
        Self::None
    }
}

fn default_serial_port() -> PathBuf {
    PathBuf::from("/dev/ttyUSB0")
}
fn default_baudrate() -> u32 {
    9600
}
fn default_bit_data() -> u8 {
    8
}
fn default_bit_stop() -> u8 {
    1
}
fn default_telnet_port() -> u16 {
    23
}
fn default_data_log_file() -> PathBuf {
    PathBuf::from("modembridge.log")
}

const VALID_BAUDRATES: &[u32] = &[
    300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400,
];

/// Fully resolved configuration, immutable after [`Config::load`].
#[derive(Debug, Clone)]
pub struct Config {
    pub serial_port: PathBuf,
    pub baudrate: u32,
    pub bit_parity: Parity,
    pub bit_data: u8,
    pub bit_stop: u8,
    pub flow: Flow,
    pub modem_init_command: String,
    pub modem_autoanswer_command: String,
    pub telnet_host: Option<String>,
    pub telnet_port: u16,
    pub data_log_enabled: bool,
    pub data_log_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial_port: default_serial_port(),
            baudrate: default_baudrate(),
            bit_parity: Parity::default(),
            bit_data: default_bit_data(),
            bit_stop: default_bit_stop(),
            flow: Flow::default(),
            modem_init_command: String::new(),
            modem_autoanswer_command: String::new(),
            telnet_host: None,
            telnet_port: default_telnet_port(),
            data_log_enabled: false,
            data_log_file: default_data_log_file(),
        }
    }
}

/// A single configuration validation failure. `main` collects these and
/// exits with code 2 (§6 CLI) if any are present.
#[derive(Debug, Clone)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Config {
    /// Load configuration from `path` if given, else `./modembridge.conf`
    /// if it exists, else compiled defaults alone. Environment variables
    /// are applied last regardless of which file (or no file) was read.
    pub fn load(path: Option<&Path>) -> Self {
        let mut cfg = Config::default();

        let file_path = path.map(Path::to_path_buf).or_else(|| {
            let cwd_default = PathBuf::from("modembridge.conf");
            cwd_default.exists().then_some(cwd_default)
        });

        if let Some(p) = file_path {
            match std::fs::read_to_string(&p) {
                Ok(contents) => {
                    let kv = parse_kv(&contents);
                    apply_kv(&mut cfg, &kv);
                }
                Err(e) => {
                    tracing::warn!("failed to read config file {}: {e}", p.display());
                }
            }
        }

        apply_env(&mut cfg);
        cfg
    }

    /// Validate the loaded config. Returns every violation found (not just
    /// the first), matching the §6/§7 "config parse errors surface at
    /// startup" policy — `main` logs each and exits(2) if any exist.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if !VALID_BAUDRATES.contains(&self.baudrate) {
            errors.push(ConfigError(format!(
                "BAUDRATE {} is not one of {VALID_BAUDRATES:?}",
                self.baudrate
            )));
        }
        if !(5..=8).contains(&self.bit_data) {
            errors.push(ConfigError(format!(
                "BIT_DATA {} must be in 5..=8",
                self.bit_data
            )));
        }
        if self.bit_stop != 1 && self.bit_stop != 2 {
            errors.push(ConfigError(format!(
                "BIT_STOP {} must be 1 or 2",
                self.bit_stop
            )));
        }
        if self.telnet_host.is_none() {
            errors.push(ConfigError("TELNET_HOST is required".to_string()));
        }
        if self.telnet_port == 0 {
            errors.push(ConfigError("TELNET_PORT must be 1..=65535".to_string()));
        }
        if self.modem_autoanswer_command.to_uppercase().contains("H0") {
            errors.push(ConfigError(
                "MODEM_AUTOANSWER_COMMAND must not contain H0".to_string(),
            ));
        }

        errors
    }
}

fn parse_kv(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_uppercase(), value.trim().to_string());
        } else {
            tracing::warn!("ignoring malformed config line: {line}");
        }
    }
    map
}

fn apply_kv(cfg: &mut Config, kv: &HashMap<String, String>) {
    for (key, value) in kv {
        apply_one(cfg, key, value);
    }
}

fn apply_env(cfg: &mut Config) {
    for key in [
        "SERIAL_PORT",
        "BAUDRATE",
        "BIT_PARITY",
        "BIT_DATA",
        "BIT_STOP",
        "FLOW",
        "MODEM_INIT_COMMAND",
        "MODEM_AUTOANSWER_COMMAND",
        "TELNET_HOST",
        "TELNET_PORT",
        "DATA_LOG_ENABLED",
        "DATA_LOG_FILE",
    ] {
        if let Ok(value) = std::env::var(format!("MODEMBRIDGE_{key}")) {
            apply_one(cfg, key, &value);
        }
    }
}

/// Apply a single recognized key. Unknown keys are logged and ignored, per
/// §6 — this includes the deprecated `MODEM_COMMAND` key (see `DESIGN.md`
/// Open Question resolutions).
fn apply_one(cfg: &mut Config, key: &str, value: &str) {
    match key {
        "SERIAL_PORT" => cfg.serial_port = PathBuf::from(value),
        "BAUDRATE" => match value.parse() {
            Ok(v) => cfg.baudrate = v,
            Err(_) => tracing::warn!("BAUDRATE {value} is not a number, ignoring"),
        },
        "BIT_PARITY" => match value.to_uppercase().as_str() {
            "NONE" => cfg.bit_parity = Parity::None,
            "EVEN" => cfg.bit_parity = Parity::Even,
            "ODD" => cfg.bit_parity = Parity::Odd,
            other => tracing::warn!("unknown BIT_PARITY {other}, ignoring"),
        },
        "BIT_DATA" => match value.parse() {
            Ok(v) => cfg.bit_data = v,
            Err(_) => tracing::warn!("BIT_DATA {value} is not a number, ignoring"),
        },
        "BIT_STOP" => match value.parse() {
            Ok(v) => cfg.bit_stop = v,
            Err(_) => tracing::warn!("BIT_STOP {value} is not a number, ignoring"),
        },
        "FLOW" => match value.to_uppercase().as_str() {
            "NONE" => cfg.flow = Flow::None,
            "SOFTWARE" => cfg.flow = Flow::Software,
            "HARDWARE" => cfg.flow = Flow::Hardware,
            "BOTH" => cfg.flow = Flow::Both,
            other => tracing::warn!("unknown FLOW {other}, ignoring"),
        },
        "MODEM_INIT_COMMAND" => cfg.modem_init_command = value.to_string(),
        "MODEM_AUTOANSWER_COMMAND" => cfg.modem_autoanswer_command = value.to_string(),
        "TELNET_HOST" => cfg.telnet_host = Some(value.to_string()),
        "TELNET_PORT" => match value.parse() {
            Ok(v) => cfg.telnet_port = v,
            Err(_) => tracing::warn!("TELNET_PORT {value} is not a number, ignoring"),
        },
        "DATA_LOG_ENABLED" => cfg.data_log_enabled = matches!(value, "1" | "true" | "TRUE"),
        "DATA_LOG_FILE" => cfg.data_log_file = PathBuf::from(value),
        other => tracing::debug!("ignoring unrecognized config key: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_kv_file() {
        let kv = parse_kv(
            "SERIAL_PORT=/dev/ttyS0\n# comment\n\nBAUDRATE=19200\nTELNET_HOST=bbs.example.com\n",
        );
        assert_eq!(kv.get("SERIAL_PORT").unwrap(), "/dev/ttyS0");
        assert_eq!(kv.get("BAUDRATE").unwrap(), "19200");
        assert_eq!(kv.get("TELNET_HOST").unwrap(), "bbs.example.com");
    }

    #[test]
    fn default_config_fails_validation_without_telnet_host() {
        let cfg = Config::default();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.0.contains("TELNET_HOST")));
    }

    #[test]
    fn valid_config_passes_validation() {
        let mut cfg = Config::default();
        cfg.telnet_host = Some("bbs.example.com".to_string());
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn rejects_unsupported_baudrate() {
        let mut cfg = Config::default();
        cfg.telnet_host = Some("x".to_string());
        cfg.baudrate = 1_000_000;
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.0.contains("BAUDRATE")));
    }

    #[test]
    fn rejects_autoanswer_command_with_h0() {
        let mut cfg = Config::default();
        cfg.telnet_host = Some("x".to_string());
        cfg.modem_autoanswer_command = "ATS0=2;H0".to_string();
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.0.contains("H0")));
    }

    #[test]
    fn deprecated_modem_command_key_is_ignored() {
        let mut cfg = Config::default();
        apply_one(&mut cfg, "MODEM_COMMAND", "ATZ");
        assert_eq!(cfg.modem_init_command, "");
    }
}
