#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # modembridge
//!
//! Bridges a Hayes-command modem attached to a serial port to a telnet peer:
//! callers dial in over POTS as always, and once the modem answers, the
//! bridge relays the call's bytes to a remote telnet host instead of a
//! physical second line.
//!
//! ## Usage
//!
//! `modembridge [-c PATH] [-d] [-v...] [-p PATH]`

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use clap::Parser;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{error, info, warn};

use modembridge::config::Config;
use modembridge::error::BridgeError;
use modembridge::health::Health;
use modembridge::serial::{LineParams, SerialEndpoint};
use modembridge::supervisor;
use modembridge::tcp::TcpEndpoint;

/// Bridges a Hayes-command modem to a telnet peer.
#[derive(Parser)]
#[command(name = "modembridge", version)]
struct Cli {
    /// Path to the configuration file (defaults to `./modembridge.conf`).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Daemonize: fork to the background, redirect stdio to the log file.
    #[arg(short, long)]
    daemon: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to write the daemon's PID (only meaningful with `--daemon`).
    #[arg(short, long, default_value = "/var/run/modembridge.pid")]
    pidfile: PathBuf,
}

const DAEMON_LOG_PATH: &str = "/var/log/modembridge.log";
const GRACE_PERIOD: Duration = Duration::from_secs(2);
const FORCED_TIMEOUT_EXIT: i32 = 124;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static SIGNAL_COUNT: AtomicU8 = AtomicU8::new(0);
static HEALTH_REQUESTED: AtomicBool = AtomicBool::new(false);
static LAST_HEALTH: Mutex<Option<Health>> = Mutex::new(None);

extern "C" fn handle_shutdown_signal(sig: libc::c_int) {
    let prior = SIGNAL_COUNT.fetch_add(1, Ordering::SeqCst);
    SHUTDOWN.store(true, Ordering::SeqCst);
    if prior > 0 {
        // A second SIGINT/SIGTERM means "stop now" — bypass the grace
        // period entirely. _exit is async-signal-safe; process::exit is not.
        unsafe { libc::_exit(128 + sig) };
    }
}

extern "C" fn handle_health_signal(_sig: libc::c_int) {
    HEALTH_REQUESTED.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<(), nix::Error> {
    let shutdown_action = SigAction::new(
        SigHandler::Handler(handle_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: handler touches only `AtomicBool`/`AtomicU8` (async-signal-safe)
    // and, on the second call, `libc::_exit` directly.
    unsafe {
        signal::sigaction(Signal::SIGINT, &shutdown_action)?;
        signal::sigaction(Signal::SIGTERM, &shutdown_action)?;
    }

    let health_action = SigAction::new(
        SigHandler::Handler(handle_health_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: handler touches only an `AtomicBool`.
    unsafe {
        signal::sigaction(Signal::SIGUSR1, &health_action)?;
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| format!("modembridge={level}"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Double-fork daemonize, redirect stdio to `DAEMON_LOG_PATH` (stdin to
/// `/dev/null`), and write the PID file. Must run before `init_tracing` so
/// `tracing-subscriber`'s default stderr writer lands in the log file
/// without a custom writer layer.
fn daemonize(pidfile: &Path) -> std::io::Result<()> {
    // SAFETY: fork() duplicates the process; the parent exits immediately
    // below and the child continues alone, so no shared mutable state is
    // observed from two live execution contexts.
    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    if unsafe { libc::setsid() } == -1 {
        return Err(std::io::Error::last_os_error());
    }

    std::env::set_current_dir("/")?;

    match unsafe { libc::fork() } {
        -1 => return Err(std::io::Error::last_os_error()),
        0 => {}
        _ => std::process::exit(0),
    }

    let devnull = OpenOptions::new().read(true).open("/dev/null")?;
    let log = OpenOptions::new().create(true).append(true).open(DAEMON_LOG_PATH)?;

    // SAFETY: dup2 on freshly-opened, still-live fds; stdin/stdout/stderr
    // are valid targets for any process.
    unsafe {
        libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
        libc::dup2(log.as_raw_fd(), libc::STDOUT_FILENO);
        libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO);
    }

    std::fs::write(pidfile, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Open the serial port transiently, run init/autoanswer commands against
/// the AT emulator to confirm the modem answers, probe the telnet peer,
/// and assemble the four-check health report (§4.H). Returns `Err` only
/// when the serial port itself can't be opened — an unresponsive modem is
/// reported as a `WARNING`, not a hard failure.
fn run_startup_checks(config: &Config) -> Result<Health, BridgeError> {
    let serial_port = Health::check_serial_port(config);

    let params = LineParams {
        baud: config.baudrate,
        parity: config.bit_parity,
        data_bits: config.bit_data,
        stop_bits: config.bit_stop,
        flow: config.flow,
    };

    let (serial_init, modem_responsive) = match SerialEndpoint::open(&config.serial_port, params) {
        Ok(mut endpoint) => {
            let mut modem = modembridge::modem::Modem::new();
            let responded = supervisor::run_init_commands(&mut modem, "AT");
            let _ = supervisor::run_init_commands(&mut modem, &config.modem_init_command);
            let _ = supervisor::run_init_commands(&mut modem, &config.modem_autoanswer_command);
            let _ = endpoint.close();
            (Health::serial_init_ok(config), Health::modem_responsive(responded))
        }
        Err(e) => {
            warn!("{}", Health::serial_init_failed(&e));
            return Err(e);
        }
    };

    let host = config.telnet_host.as_deref().unwrap_or("");
    let reachable = TcpEndpoint::probe(host, config.telnet_port, Duration::from_secs(5));
    let tcp_reachable = Health::tcp_reachable(reachable, host, config.telnet_port);

    Ok(Health { serial_port, serial_init, modem_responsive, tcp_reachable })
}

fn main() {
    let cli = Cli::parse();

    if cli.daemon {
        if let Err(e) = daemonize(&cli.pidfile) {
            eprintln!("failed to daemonize: {e}");
            std::process::exit(1);
        }
    }

    init_tracing(cli.verbose);

    if let Err(e) = install_signal_handlers() {
        error!("failed to install signal handlers: {e}");
        std::process::exit(1);
    }

    let config = Config::load(cli.config.as_deref());
    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!("config error: {e}");
        }
        std::process::exit(2);
    }

    info!("modembridge v{} starting", env!("CARGO_PKG_VERSION"));

    let health = match run_startup_checks(&config) {
        Ok(h) => h,
        Err(e) => {
            error!("startup check failed: {e}");
            std::process::exit(1);
        }
    };
    info!("startup health:\n{health}");
    *LAST_HEALTH.lock().unwrap_or_else(|p| p.into_inner()) = Some(health);

    let exit_code = std::thread::scope(|scope| {
        let handle = scope.spawn(|| supervisor::run(&config, &SHUTDOWN));

        let mut grace_deadline: Option<Instant> = None;
        loop {
            if handle.is_finished() {
                break match handle.join() {
                    Ok(Ok(())) => 0,
                    Ok(Err(e)) => {
                        error!("supervisor exited with error: {e}");
                        1
                    }
                    Err(_) => {
                        error!("supervisor thread panicked");
                        1
                    }
                };
            }

            if HEALTH_REQUESTED.swap(false, Ordering::SeqCst) {
                if let Some(h) = LAST_HEALTH.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
                    info!("health report requested:\n{h}");
                }
            }

            if SHUTDOWN.load(Ordering::SeqCst) {
                let deadline = *grace_deadline.get_or_insert_with(|| Instant::now() + GRACE_PERIOD);
                if Instant::now() >= deadline {
                    // `thread::scope` would otherwise block here waiting for
                    // the supervisor thread to join; exit the whole process
                    // immediately instead of returning from the scope.
                    warn!("graceful shutdown exceeded {GRACE_PERIOD:?}, forcing exit");
                    let _ = std::fs::remove_file(&cli.pidfile);
                    std::process::exit(FORCED_TIMEOUT_EXIT);
                }
            }

            std::thread::sleep(Duration::from_millis(50));
        }
    });

    let _ = std::fs::remove_file(&cli.pidfile);
    std::process::exit(exit_code);
}
