//! Session aggregate and the overall lifecycle state machine (§3, §4.D's
//! state diagram, §4.F).
//!
//! `ManagedSession`'s shape — owned handles plus an `Arc<Mutex<_>>` status
//! that outlives any single subscriber, graceful-then-forceful teardown —
//! is the model for [`Session`] here: the session owns its Serial, Modem,
//! `TelnetFramer`, and `DualPipeline`, and exposes its lifecycle state
//! behind a mutex the supervisor and the two I/O threads all read. Hot-path
//! counters (bytes per direction) are atomics, following `state.rs`'s
//! atomics-for-hot-path/mutex-for-cold-path split; the state machine itself
//! is cold-path and lives behind the same mutex as the timestamp/ reachability
//! bookkeeping, since every transition must be validated against the fixed
//! matrix below before it's visible to any other thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};

/// §4.D's overall session lifecycle. `Error` is a reachable sink from any
/// state on unrecoverable I/O; it is not a terminal state itself — the
/// supervisor always drives `Error` onward to `Flushing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Connecting,
    Negotiating,
    DataTransfer,
    Flushing,
    ShuttingDown,
    Terminated,
    Error,
}

impl SessionState {
    /// Per-state timeout from §4.D ("Each state has a timeout ..."). `None`
    /// means no timeout is enforced (e.g. READY may wait indefinitely for a
    /// call).
    fn timeout(self, carrier_wait_secs: u8) -> Option<Duration> {
        match self {
            Self::Connecting => Some(Duration::from_secs(u64::from(carrier_wait_secs))),
            Self::Negotiating => Some(Duration::from_secs(5)),
            Self::Flushing => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    /// The fixed reachability matrix: every edge the state diagram in
    /// §4.D permits. `Error` is reachable from every non-terminal state;
    /// everything else is an enumerated edge.
    fn allows(self, next: Self) -> bool {
        if next == Self::Error {
            return !matches!(self, Self::Terminated);
        }
        matches!(
            (self, next),
            (Self::Uninitialized, Self::Initializing)
                | (Self::Initializing, Self::Ready)
                | (Self::Ready, Self::Connecting)
                | (Self::Connecting, Self::Negotiating)
                | (Self::Negotiating, Self::DataTransfer)
                | (Self::DataTransfer, Self::Flushing)
                | (Self::Error, Self::Flushing)
                | (Self::Flushing, Self::ShuttingDown)
                | (Self::ShuttingDown, Self::Terminated)
                // Re-arm after hangup (§4.G step 4): a terminated call
                // returns the session to READY for the next one rather than
                // tearing down the process.
                | (Self::Terminated, Self::Ready)
        )
    }
}

/// A timestamped, validated transition record kept for diagnostics.
#[derive(Debug, Clone, Copy)]
struct StateEntry {
    state: SessionState,
    entered_at: Instant,
}

/// The session's cold-path lifecycle bookkeeping: current state, when it
/// was entered (for timeout checks), and the matrix-enforcing transition
/// function. Lives behind `Session::lifecycle`'s mutex.
struct Lifecycle {
    current: StateEntry,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            current: StateEntry { state: SessionState::Uninitialized, entered_at: Instant::now() },
        }
    }

    /// Attempt a transition. Refused transitions return
    /// `BridgeError::InvalidState` and leave the lifecycle unchanged — "it
    /// refuses disallowed edges (emits an error event, not a crash)" (§4.F).
    fn transition(&mut self, next: SessionState) -> BridgeResult<()> {
        if !self.current.state.allows(next) {
            return Err(BridgeError::InvalidState {
                from: state_name(self.current.state),
                action: state_name(next),
            });
        }
        tracing::info!(from = state_name(self.current.state), to = state_name(next), "session state transition");
        self.current = StateEntry { state: next, entered_at: Instant::now() };
        Ok(())
    }

    /// Whether the current state's timeout (if any) has elapsed, given the
    /// modem's S7 carrier-wait register for CONNECTING's timeout.
    fn timed_out(&self, carrier_wait_secs: u8) -> bool {
        match self.current.state.timeout(carrier_wait_secs) {
            Some(limit) => self.current.entered_at.elapsed() >= limit,
            None => false,
        }
    }
}

fn state_name(s: SessionState) -> &'static str {
    match s {
        SessionState::Uninitialized => "UNINITIALIZED",
        SessionState::Initializing => "INITIALIZING",
        SessionState::Ready => "READY",
        SessionState::Connecting => "CONNECTING",
        SessionState::Negotiating => "NEGOTIATING",
        SessionState::DataTransfer => "DATA_TRANSFER",
        SessionState::Flushing => "FLUSHING",
        SessionState::ShuttingDown => "SHUTTING_DOWN",
        SessionState::Terminated => "TERMINATED",
        SessionState::Error => "ERROR",
    }
}

/// Aggregate byte/error counters, incremented under the lifecycle mutex's
/// sibling but stored as atomics so a snapshot read never blocks an I/O
/// thread (§5: "Metrics counters are incremented under the state mutex;
/// snapshot reads copy the struct out" — here the atomics make that copy
/// lock-free).
#[derive(Default)]
pub struct SessionCounters {
    pub serial_to_tcp_bytes: AtomicU64,
    pub tcp_to_serial_bytes: AtomicU64,
    pub error_count: AtomicU64,
}

/// A point-in-time copy of [`SessionCounters`], safe to hand to a health
/// report or log line without holding any lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub serial_to_tcp_bytes: u64,
    pub tcp_to_serial_bytes: u64,
    pub error_count: u64,
}

impl SessionCounters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            serial_to_tcp_bytes: self.serial_to_tcp_bytes.load(Ordering::Relaxed),
            tcp_to_serial_bytes: self.tcp_to_serial_bytes.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// The top-level entity (§3): a reference to [`Config`], plus the
/// lifecycle state machine and aggregate counters. The owned Serial,
/// Modem, `TelnetFramer`, and `DualPipeline` instances live in the
/// supervisor, which constructs them and drives the threads that operate
/// on `Session`'s lifecycle and counters — kept here rather than inside
/// `Session` itself so the serial/network threads never hold a
/// back-reference into `Session` (§9 "Cyclic references": components emit
/// events through a bounded channel the owner polls, not a back-pointer).
pub struct Session<'a> {
    config: &'a Config,
    lifecycle: Mutex<Lifecycle>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    pub counters: SessionCounters,
}

impl<'a> Session<'a> {
    pub fn new(config: &'a Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            lifecycle: Mutex::new(Lifecycle::new()),
            created_at: now,
            last_activity: Mutex::new(now),
            counters: SessionCounters::default(),
        }
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.lock().expect("lifecycle mutex poisoned").current.state
    }

    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("last_activity mutex poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().expect("last_activity mutex poisoned").elapsed()
    }

    /// Attempt the transition, validated against the fixed matrix (§4.F).
    pub fn transition(&self, next: SessionState) -> BridgeResult<()> {
        let result = self.lifecycle.lock().expect("lifecycle mutex poisoned").transition(next);
        if result.is_ok() {
            self.touch();
        } else {
            self.counters.error_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Checked by the supervisor loop every tick; a timed-out state is
    /// pushed to `Error` automatically (§4.D: "timeout pushes to ERROR").
    pub fn check_timeout(&self, carrier_wait_secs: u8) -> BridgeResult<bool> {
        let mut lifecycle = self.lifecycle.lock().expect("lifecycle mutex poisoned");
        if lifecycle.timed_out(carrier_wait_secs) {
            lifecycle.transition(SessionState::Error)?;
            self.counters.error_count.fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn record_serial_to_tcp(&self, n: u64) {
        self.counters.serial_to_tcp_bytes.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_tcp_to_serial(&self, n: u64) {
        self.counters.tcp_to_serial_bytes.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        let mut c = Config::default();
        c.telnet_host = Some("bbs.example.com".to_string());
        c
    }

    #[test]
    fn happy_path_transitions_in_order() {
        let config = cfg();
        let session = Session::new(&config);
        for next in [
            SessionState::Initializing,
            SessionState::Ready,
            SessionState::Connecting,
            SessionState::Negotiating,
            SessionState::DataTransfer,
            SessionState::Flushing,
            SessionState::ShuttingDown,
            SessionState::Terminated,
        ] {
            session.transition(next).unwrap();
        }
        assert_eq!(session.state(), SessionState::Terminated);
    }

    #[test]
    fn skipping_a_state_is_refused() {
        let config = cfg();
        let session = Session::new(&config);
        let err = session.transition(SessionState::DataTransfer).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidState { .. }));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn error_is_reachable_from_any_non_terminal_state() {
        let config = cfg();
        let session = Session::new(&config);
        session.transition(SessionState::Error).unwrap();
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn terminated_re_arms_to_ready() {
        let config = cfg();
        let session = Session::new(&config);
        for next in [
            SessionState::Initializing,
            SessionState::Ready,
            SessionState::Connecting,
            SessionState::Negotiating,
            SessionState::DataTransfer,
            SessionState::Flushing,
            SessionState::ShuttingDown,
            SessionState::Terminated,
            SessionState::Ready,
        ] {
            session.transition(next).unwrap();
        }
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn connecting_times_out_after_carrier_wait_secs() {
        let config = cfg();
        let session = Session::new(&config);
        session.transition(SessionState::Initializing).unwrap();
        session.transition(SessionState::Ready).unwrap();
        session.transition(SessionState::Connecting).unwrap();
        assert!(!session.check_timeout(60).unwrap());

        // Forge entered_at into the past to simulate elapsed time.
        {
            let mut lc = session.lifecycle.lock().unwrap();
            lc.current.entered_at = Instant::now() - Duration::from_secs(61);
        }
        assert!(session.check_timeout(60).unwrap());
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn counters_snapshot_reflects_recorded_bytes() {
        let config = cfg();
        let session = Session::new(&config);
        session.record_serial_to_tcp(21);
        session.record_tcp_to_serial(3);
        let snap = session.counters.snapshot();
        assert_eq!(snap.serial_to_tcp_bytes, 21);
        assert_eq!(snap.tcp_to_serial_bytes, 3);
    }
}
