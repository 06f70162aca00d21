#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! modembridge library — a Hayes-modem-to-telnet bridge for dial-up BBS
//! hosting on hardware with no real phone line: an external/internal modem
//! answers incoming calls as usual, but once ONLINE the bridge relays bytes
//! to a telnet peer instead of a POTS line.
//!
//! - `config` — flat `KEY=VALUE` configuration loading and validation
//! - `modem` — Hayes AT command emulator and hardware status detector
//! - `hayes_filter` — inline AT-command suppression for the live data stream
//! - `serial` — tty open/close/lock, line config, robust read/write
//! - `tcp` — the telnet peer connection
//! - `telnet` — RFC 854 IAC framing and option negotiation
//! - `pipeline` — the dual-direction byte scheduler and its endpoint adapters
//! - `session` — the overall lifecycle state machine
//! - `health` — startup/`SIGUSR1` health report
//! - `supervisor` — owns a `Session` end to end and re-arms it between calls

pub mod config;
pub mod endpoint;
pub mod error;
pub mod hayes_filter;
pub mod health;
pub mod modem;
pub mod pipeline;
pub mod serial;
pub mod session;
pub mod supervisor;
pub mod tcp;
pub mod telnet;

pub use config::Config;
pub use error::{BridgeError, BridgeResult};
pub use health::Health;
pub use session::{Session, SessionState};
