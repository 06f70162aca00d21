//! The lifecycle supervisor (§4.G): owns the `Session` end to end, drives
//! it through READY → CONNECTING → NEGOTIATING → DATA_TRANSFER → FLUSHING
//! → SHUTTING_DOWN → TERMINATED for each call, and re-arms back to READY
//! afterward rather than exiting the process — a session is one
//! serial-port-to-one-TCP-peer bridge that outlives any single call.
//!
//! Grounded on this codebase's own crash-supervisor: spawn → wait →
//! classify → sleep with doubling backoff capped at a maximum, reset after
//! a stable-uptime threshold. Adapted from "restart a crashed child
//! process" to "reopen a serial session after the caller hangs up" — there
//! is no child process here, everything runs as threads in this process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::endpoint::Endpoint;
use crate::error::{BridgeError, BridgeResult};
use crate::hayes_filter::HayesFilter;
use crate::modem::{HardwareMessage, Modem, ModemState};
use crate::pipeline::adapters::{SerialOnlineSource, TelnetSink, TelnetSource};
use crate::pipeline::{Direction, DualPipeline};
use crate::serial::{LineParams, SerialEndpoint};
use crate::session::{Session, SessionState};
use crate::tcp::TcpEndpoint;
use crate::telnet::TelnetFramer;

const MIN_BUFFER: usize = 4096;
const MAX_BUFFER: usize = 65536;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const STABLE_UPTIME: Duration = Duration::from_secs(60);

/// Run `;`-separated AT commands against `modem` directly (it answers
/// itself — no serial I/O at this stage). Returns `false` if any command
/// came back `ERROR`, used by the startup health check and the
/// exit(1)-on-unresponsive-modem rule in §4.G step 1.
pub fn run_init_commands(modem: &mut Modem, commands: &str) -> bool {
    let mut ok = true;
    for raw in commands.split(';') {
        let cmd = raw.trim();
        if cmd.is_empty() {
            continue;
        }
        let response = modem.feed_command_line(cmd.as_bytes());
        let trimmed = response.trim();
        if trimmed.eq_ignore_ascii_case("ERROR") || trimmed == "4" {
            tracing::warn!("modem init command {cmd:?} returned {trimmed}");
            ok = false;
        }
    }
    ok
}

/// Open the serial endpoint, run init/autoanswer commands, and drive
/// repeated call cycles until `shutdown` is set. The same `SerialEndpoint`
/// and `Modem` persist across the whole process lifetime; only the TCP
/// side is per-call.
pub fn run(config: &Config, shutdown: &AtomicBool) -> BridgeResult<()> {
    let session = Session::new(config);
    session.transition(SessionState::Initializing)?;

    let params = LineParams {
        baud: config.baudrate,
        parity: config.bit_parity,
        data_bits: config.bit_data,
        stop_bits: config.bit_stop,
        flow: config.flow,
    };
    let mut serial = SerialEndpoint::open(&config.serial_port, params)?;
    let mut modem = Modem::new();
    run_init_commands(&mut modem, &config.modem_init_command);
    run_init_commands(&mut modem, &config.modem_autoanswer_command);

    session.transition(SessionState::Ready)?;

    let mut backoff = INITIAL_BACKOFF;

    while !shutdown.load(Ordering::SeqCst) {
        let cycle_started = Instant::now();
        let (returned_serial, returned_modem, outcome) =
            run_one_call(config, &session, serial, modem, shutdown);
        serial = returned_serial;
        modem = returned_modem;

        match outcome {
            Ok(()) | Err(BridgeError::Hangup) => {
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                tracing::warn!("call cycle ended in error: {e}");
                if cycle_started.elapsed() < STABLE_UPTIME {
                    tracing::warn!("re-arming after {backoff:?} backoff");
                    sleep_checking_shutdown(backoff, shutdown);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                } else {
                    backoff = INITIAL_BACKOFF;
                }
            }
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        // Re-arm: the call cycle always leaves the session in TERMINATED
        // (see `run_one_call`'s teardown tail); TERMINATED → READY is the
        // one re-arm edge the lifecycle matrix allows (§4.F).
        session.transition(SessionState::Ready)?;
    }

    let _ = session.transition(SessionState::Flushing);
    let _ = session.transition(SessionState::ShuttingDown);
    let _ = session.transition(SessionState::Terminated);
    serial.close()?;
    Ok(())
}

fn sleep_checking_shutdown(total: Duration, shutdown: &AtomicBool) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < total {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(step.min(total - waited));
        waited += step;
    }
}

/// One READY→...→TERMINATED cycle: wait for a call, bridge it, tear it
/// down. Returns ownership of `serial`/`modem` (they outlive the call) and
/// the outcome — `Err(Hangup)` is the ordinary end of a call, any other
/// `Err` is a fault the caller backs off on.
fn run_one_call(
    config: &Config,
    session: &Session,
    mut serial: SerialEndpoint,
    mut modem: Modem,
    shutdown: &AtomicBool,
) -> (SerialEndpoint, Modem, BridgeResult<()>) {
    if let Err(e) = wait_for_call(&mut serial, &mut modem, session, shutdown) {
        return (serial, modem, Err(e));
    }
    if shutdown.load(Ordering::SeqCst) {
        return (serial, modem, Ok(()));
    }

    let outcome = bridge_call(config, session, &mut serial, &mut modem, shutdown);

    // Whatever happened, bring the session to a terminal point before
    // handing control back — the outer loop re-arms from TERMINATED.
    if session.state() != SessionState::Error && outcome.is_err() {
        let _ = session.transition(SessionState::Error);
    }
    if !matches!(session.state(), SessionState::Flushing) {
        let _ = session.transition(SessionState::Flushing);
    }
    let _ = session.transition(SessionState::ShuttingDown);
    let _ = session.transition(SessionState::Terminated);

    (serial, modem, outcome)
}

/// Wait in READY for a call: either a hardware modem's unsolicited `RING`
/// (auto-answered once `should_auto_answer()` is true) or a manually typed
/// AT command line (`ATA`, or a hardware `CONNECT`). No timeout — READY
/// may wait indefinitely (§4.D).
fn wait_for_call(
    serial: &mut SerialEndpoint,
    modem: &mut Modem,
    session: &Session,
    shutdown: &AtomicBool,
) -> BridgeResult<()> {
    let mut cmd_line = Vec::new();

    while !shutdown.load(Ordering::SeqCst) {
        let mut buf = [0u8; 256];
        let n = serial.read(&mut buf)?;
        if n == 0 {
            continue;
        }
        let chunk = &buf[..n];

        for msg in modem.feed_hardware_message(chunk) {
            match msg {
                HardwareMessage::Ring(_) if modem.should_auto_answer() => {
                    let resp = modem.feed_command_line(b"ATA\r");
                    let _ = serial.write_robust(resp.as_bytes());
                    session.transition(SessionState::Connecting)?;
                    return Ok(());
                }
                HardwareMessage::Connect(speed) => {
                    if let Some(baud) = speed {
                        let _ = serial.set_baud(baud);
                    }
                    session.transition(SessionState::Connecting)?;
                    return Ok(());
                }
                _ => {}
            }
        }

        for &b in chunk {
            if b == b'\r' || b == b'\n' {
                if cmd_line.is_empty() {
                    continue;
                }
                let resp = modem.feed_command_line(&cmd_line);
                let _ = serial.write_robust(resp.as_bytes());
                cmd_line.clear();
                if matches!(modem.state(), ModemState::Online | ModemState::Connecting) {
                    session.transition(SessionState::Connecting)?;
                    return Ok(());
                }
            } else {
                cmd_line.push(b);
            }
        }
    }

    Ok(())
}

/// Connect out, negotiate, and run the dual pipeline until the call ends
/// (hangup on either side) or shutdown is requested.
fn bridge_call(
    config: &Config,
    session: &Session,
    serial: &mut SerialEndpoint,
    modem: &mut Modem,
    shutdown: &AtomicBool,
) -> BridgeResult<()> {
    let host = config
        .telnet_host
        .as_deref()
        .ok_or_else(|| BridgeError::InvalidArg("TELNET_HOST missing".to_string()))?;
    let carrier_wait = Duration::from_secs(u64::from(modem.carrier_wait_secs().max(1)));

    let mut tcp = match TcpEndpoint::connect(host, config.telnet_port, carrier_wait) {
        Ok(t) => t,
        Err(e) => {
            let _ = serial.write_robust(b"NO CARRIER\r\n");
            return Err(e);
        }
    };

    session.transition(SessionState::Negotiating)?;
    send_all(&mut tcp, &TelnetFramer::initial_negotiation())?;
    // Brief settle window for the peer's own option replies to start
    // arriving before DATA_TRANSFER begins draining them as application
    // data.
    std::thread::sleep(Duration::from_millis(150));

    session.transition(SessionState::DataTransfer)?;
    let _ = serial.write_robust(b"CONNECT\r\n");
    tracing::info!("data transfer started: {}:{}", host, config.telnet_port);

    let hayes = HayesFilter::new();
    let framer = TelnetFramer::new();
    let serial_mx: Mutex<&mut SerialEndpoint> = Mutex::new(serial);
    let tcp_mx = Mutex::new(tcp);
    let pipeline_mx = Mutex::new(DualPipeline::new(MIN_BUFFER, MAX_BUFFER));
    let error_slot: Mutex<Option<BridgeError>> = Mutex::new(None);
    // Set by `serial_to_tcp_loop` while the modem is in COMMAND mode (an
    // in-call `+++` escape), so `tcp_to_serial_loop` holds off writing
    // relayed data to the serial port until `ATO` hands control back to the
    // pipeline — otherwise a command response like `OK\r\n` could interleave
    // with application bytes mid-stream.
    let command_mode = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            serial_to_tcp_loop(
                &serial_mx,
                modem,
                hayes,
                &tcp_mx,
                &pipeline_mx,
                session,
                shutdown,
                &error_slot,
                &command_mode,
            );
        });
        scope.spawn(|| {
            tcp_to_serial_loop(
                &tcp_mx,
                framer,
                &serial_mx,
                &pipeline_mx,
                session,
                shutdown,
                &error_slot,
                &command_mode,
            );
        });
    });

    let mut tcp = tcp_mx.into_inner().unwrap_or_else(|e| e.into_inner());
    let _ = tcp.close();

    match error_slot.into_inner().unwrap_or_else(|e| e.into_inner()) {
        Some(e) => Err(e),
        None => Err(BridgeError::Hangup),
    }
}

fn send_all(tcp: &mut TcpEndpoint, bytes: &[u8]) -> BridgeResult<()> {
    let mut sent = 0;
    while sent < bytes.len() {
        let (n, _status) = tcp.try_write(&bytes[sent..])?;
        if n == 0 {
            std::thread::sleep(Duration::from_millis(10));
            continue;
        }
        sent += n;
    }
    Ok(())
}

fn record_error(slot: &Mutex<Option<BridgeError>>, e: BridgeError) {
    let mut guard = slot.lock().unwrap_or_else(|p| p.into_inner());
    if guard.is_none() {
        *guard = Some(e);
    }
}

fn should_stop(shutdown: &AtomicBool, error_slot: &Mutex<Option<BridgeError>>) -> bool {
    shutdown.load(Ordering::SeqCst) || error_slot.lock().unwrap_or_else(|p| p.into_inner()).is_some()
}

/// Serial thread: drives `SerialToTcp` ticks (serial → Hayes filter →
/// telnet escape → TCP) whenever the modem is ONLINE and it's that
/// direction's turn; while the modem is in COMMAND mode (an in-call `+++`
/// escape), it instead reads raw serial bytes straight into
/// `Modem::feed_command_line` and writes the response back, bypassing the
/// pipeline entirely — `ATO` resumes the pipeline, `ATH` ends the call.
/// `modem`/`hayes` are never touched by the other thread, so they're owned
/// locally rather than behind a shared mutex.
fn serial_to_tcp_loop(
    serial_mx: &Mutex<&mut SerialEndpoint>,
    modem: &mut Modem,
    mut hayes: HayesFilter,
    tcp_mx: &Mutex<TcpEndpoint>,
    pipeline_mx: &Mutex<DualPipeline>,
    session: &Session,
    shutdown: &AtomicBool,
    error_slot: &Mutex<Option<BridgeError>>,
    command_mode: &AtomicBool,
) {
    let mut cmd_line = Vec::new();

    while !should_stop(shutdown, error_slot) {
        if matches!(modem.state(), ModemState::Command) {
            command_mode.store(true, Ordering::SeqCst);
            match run_command_mode_step(serial_mx, modem, &mut cmd_line) {
                Ok(true) => {
                    record_error(error_slot, BridgeError::Hangup);
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    record_error(error_slot, e);
                    break;
                }
            }
            continue;
        }
        command_mode.store(false, Ordering::SeqCst);

        let mut pipeline = pipeline_mx.lock().unwrap_or_else(|p| p.into_inner());
        if pipeline.current() != Direction::SerialToTcp {
            drop(pipeline);
            std::thread::sleep(DualPipeline::idle_backoff());
            continue;
        }

        let mut serial_guard = serial_mx.lock().unwrap_or_else(|p| p.into_inner());
        let mut tcp_guard = tcp_mx.lock().unwrap_or_else(|p| p.into_inner());
        let mut source = SerialOnlineSource::new(*serial_guard, modem, &mut hayes);
        let mut sink = TelnetSink::new(&mut tcp_guard);

        match pipeline.tick(&mut source, &mut sink) {
            Ok(report) => {
                drop(pipeline);
                drop(tcp_guard);
                drop(serial_guard);
                if report.bytes_moved > 0 {
                    session.record_serial_to_tcp(report.bytes_moved as u64);
                } else {
                    std::thread::sleep(DualPipeline::idle_backoff());
                }
            }
            Err(e) => {
                drop(pipeline);
                drop(tcp_guard);
                drop(serial_guard);
                record_error(error_slot, e);
                break;
            }
        }
    }

    command_mode.store(false, Ordering::SeqCst);
}

/// Read raw serial bytes while the modem is in COMMAND mode, accumulate
/// one line, and run it through `feed_command_line` on the terminator.
/// Returns `Ok(true)` if that command was `ATH` (hang up the call).
fn run_command_mode_step(
    serial_mx: &Mutex<&mut SerialEndpoint>,
    modem: &mut Modem,
    cmd_line: &mut Vec<u8>,
) -> BridgeResult<bool> {
    let mut buf = [0u8; 256];
    let n = {
        let mut serial_guard = serial_mx.lock().unwrap_or_else(|p| p.into_inner());
        serial_guard.read(&mut buf)?
    };
    if n == 0 {
        std::thread::sleep(DualPipeline::idle_backoff());
        return Ok(false);
    }

    for &b in &buf[..n] {
        if b == b'\r' || b == b'\n' {
            if cmd_line.is_empty() {
                continue;
            }
            let resp = modem.feed_command_line(cmd_line);
            cmd_line.clear();
            let mut serial_guard = serial_mx.lock().unwrap_or_else(|p| p.into_inner());
            let _ = serial_guard.write_robust(resp.as_bytes());
            drop(serial_guard);
            if modem.take_hangup_requested() {
                return Ok(true);
            }
        } else {
            cmd_line.push(b);
        }
    }
    Ok(false)
}

/// Network thread: drives `TcpToSerial` ticks (TCP → telnet
/// unescape/option handling → serial) whenever it's that direction's turn.
/// Holds off entirely while `command_mode` is set, so relayed data never
/// interleaves with the serial thread's direct command-mode writes.
/// `framer` is never touched by the other thread, so it's owned locally.
fn tcp_to_serial_loop(
    tcp_mx: &Mutex<TcpEndpoint>,
    mut framer: TelnetFramer,
    serial_mx: &Mutex<&mut SerialEndpoint>,
    pipeline_mx: &Mutex<DualPipeline>,
    session: &Session,
    shutdown: &AtomicBool,
    error_slot: &Mutex<Option<BridgeError>>,
    command_mode: &AtomicBool,
) {
    while !should_stop(shutdown, error_slot) {
        if command_mode.load(Ordering::SeqCst) {
            std::thread::sleep(DualPipeline::idle_backoff());
            continue;
        }

        let mut pipeline = pipeline_mx.lock().unwrap_or_else(|p| p.into_inner());
        if pipeline.current() != Direction::TcpToSerial {
            drop(pipeline);
            std::thread::sleep(DualPipeline::idle_backoff());
            continue;
        }

        let mut tcp_guard = tcp_mx.lock().unwrap_or_else(|p| p.into_inner());
        let mut serial_guard = serial_mx.lock().unwrap_or_else(|p| p.into_inner());
        let mut source = TelnetSource::new(&mut tcp_guard, &mut framer);
        let sink: &mut SerialEndpoint = *serial_guard;

        match pipeline.tick(&mut source, sink) {
            Ok(report) => {
                drop(pipeline);
                drop(serial_guard);
                drop(tcp_guard);
                if report.bytes_moved > 0 {
                    session.record_tcp_to_serial(report.bytes_moved as u64);
                } else {
                    std::thread::sleep(DualPipeline::idle_backoff());
                }
            }
            Err(e) => {
                drop(pipeline);
                drop(serial_guard);
                drop(tcp_guard);
                record_error(error_slot, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_init_commands_empty_string_is_responsive() {
        let mut modem = Modem::new();
        assert!(run_init_commands(&mut modem, ""));
    }

    #[test]
    fn run_init_commands_flags_error_response() {
        let mut modem = Modem::new();
        assert!(!run_init_commands(&mut modem, "ATQQ9"));
    }

    #[test]
    fn run_init_commands_runs_each_semicolon_separated_command() {
        let mut modem = Modem::new();
        assert!(run_init_commands(&mut modem, "ATZ;ATE0;ATS0=2"));
        assert_eq!(modem.register(0), Some(2));
    }
}
