//! Serial endpoint: tty open/close/lock, line configuration, robust
//! read/write, DCD observation and DTR-drop hangup (§4.A).
//!
//! Termios configuration follows the native-serial idiom used elsewhere in
//! this codebase for talking to a real modem (`nix::sys::termios`, raw
//! mode via `cfmakeraw`, explicit `VMIN`/`VTIME`), generalized to the
//! parameters the config allows instead of a fixed 115200 8N1. DCD
//! observation and the advisory lock file are not things that codebase's
//! modem client needs (it always owns its one fixed USB device); those are
//! grounded on the `TIOCMGET`/`TIOCEXCL` ioctl idiom from the pack's other
//! serial-device example (an ITM trace source over a tty).

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::fcntl::{self, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::stat::Mode;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices as CC};
use nix::sys::time::TimeVal;
use nix::unistd;
use tracing::{debug, info, warn};

use crate::config::{Flow, Parity};
use crate::endpoint::Endpoint;
use crate::error::{BridgeError, BridgeResult, Status};

/// Line parameters derived from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct LineParams {
    pub baud: u32,
    pub parity: Parity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub flow: Flow,
}

fn baud_rate_const(baud: u32) -> BridgeResult<BaudRate> {
    Ok(match baud {
        300 => BaudRate::B300,
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        other => return Err(BridgeError::InvalidArg(format!("unsupported baud {other}"))),
    })
}

/// Advisory lock file at `/var/lock/LCK..<basename>`. Holds the current
/// process PID as a 10-wide decimal followed by a newline (§6). A stale
/// lock (PID no longer running) is reclaimed rather than refused.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(device: &Path) -> BridgeResult<Self> {
        let basename = device
            .file_name()
            .ok_or_else(|| BridgeError::InvalidArg("serial path has no basename".to_string()))?
            .to_string_lossy()
            .to_string();
        let path = PathBuf::from(format!("/var/lock/LCK..{basename}"));

        if let Ok(existing) = std::fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if pid_is_alive(pid) {
                    return Err(BridgeError::Locked { pid });
                }
                warn!("reclaiming stale lock {} held by dead pid {pid}", path.display());
            }
        }

        let pid = std::process::id();
        std::fs::write(&path, format!("{pid:>10}\n"))
            .map_err(|e| BridgeError::io("write lock file", e))?;
        Ok(Self { path })
    }

    fn release(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

fn pid_is_alive(pid: u32) -> bool {
    // SAFETY: kill(pid, 0) performs no signal delivery, only existence/
    // permission checks; pid is a plain integer, no memory is touched.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 || std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH) }
}

/// # Safety
/// `fd` must be a currently-open file descriptor for the lifetime of the
/// borrow.
unsafe fn borrow(fd: RawFd) -> BorrowedFd<'static> {
    BorrowedFd::borrow_raw(fd)
}

/// Owns the serial file descriptor, the saved original termios for
/// restore-on-close, current baud, last-observed DCD state, and the
/// advisory lock. `is_open ⇒ fd ≥ 0 ∧ lock held` (§3 invariant) is upheld
/// by construction: a `SerialEndpoint` only exists once both are true.
pub struct SerialEndpoint {
    fd: RawFd,
    original_termios: termios::Termios,
    current_baud: u32,
    dcd_observed: bool,
    carrier_detect_enabled: bool,
    _lock: LockFile,
    device: PathBuf,
}

impl SerialEndpoint {
    /// Open `path`, acquiring the lock first (§4.A). Applies raw mode,
    /// `CS8 | CREAD | HUPCL | CLOCAL`, the requested parity/data/stop bits,
    /// the requested baud, `VMIN=1 VTIME=0`.
    pub fn open(path: &Path, params: LineParams) -> BridgeResult<Self> {
        let lock = LockFile::acquire(path)?;

        let fd = fcntl::open(
            path,
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| BridgeError::io("open", std::io::Error::from_raw_os_error(e as i32)))?;

        // SAFETY: fd was just opened successfully and is owned by this struct.
        let borrowed = unsafe { borrow(fd) };
        let original = termios::tcgetattr(borrowed)
            .map_err(|e| BridgeError::io("tcgetattr", std::io::Error::from_raw_os_error(e as i32)))?;

        let mut tio = original.clone();
        configure_raw(&mut tio, params)?;
        termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
            .map_err(|e| BridgeError::io("tcsetattr", std::io::Error::from_raw_os_error(e as i32)))?;

        clear_nonblocking(fd)?;

        info!(
            "serial endpoint opened: {} at {} baud",
            path.display(),
            params.baud
        );

        Ok(Self {
            fd,
            original_termios: original,
            current_baud: params.baud,
            dcd_observed: false,
            carrier_detect_enabled: false,
            _lock: lock,
            device: path.to_path_buf(),
        })
    }

    /// Restore original termios, close the fd, release the lock (dropping
    /// `_lock`). Idempotent — calling twice is a no-op on the second call
    /// since `fd` is set to `-1`.
    pub fn close(&mut self) -> BridgeResult<()> {
        if self.fd < 0 {
            return Ok(());
        }
        // SAFETY: fd is open until this function closes it below.
        let borrowed = unsafe { borrow(self.fd) };
        let _ = termios::tcsetattr(borrowed, SetArg::TCSANOW, &self.original_termios);
        let _ = unistd::close(self.fd);
        info!("serial endpoint closed: {}", self.device.display());
        self.fd = -1;
        Ok(())
    }

    /// Bounded-wait read: `select()` with a 100 ms timeout on both the read
    /// and exception fd sets. Returns `0` on timeout, `HANGUP` on exception
    /// or `EPIPE`/`ECONNRESET`, else the byte count.
    pub fn read(&mut self, buf: &mut [u8]) -> BridgeResult<usize> {
        let mut readfds = FdSet::new();
        let mut exceptfds = FdSet::new();
        readfds.insert(self.fd);
        exceptfds.insert(self.fd);
        let mut timeout = TimeVal::new(0, 100_000);

        let n = select(None, &mut readfds, None, &mut exceptfds, &mut timeout)
            .map_err(|e| BridgeError::io("select", std::io::Error::from_raw_os_error(e as i32)))?;
        if n == 0 {
            return Ok(0);
        }
        if exceptfds.contains(self.fd) {
            return Err(BridgeError::Hangup);
        }

        // SAFETY: fd is open and readable per the select() result above.
        match unistd::read(self.fd, buf) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EPIPE | nix::errno::Errno::ECONNRESET) => Err(BridgeError::Hangup),
            Err(e) => Err(BridgeError::io("read", std::io::Error::from_raw_os_error(e as i32))),
        }
    }

    /// Write with carrier verification, retry-on-`EAGAIN` (up to 3×, 100 ms
    /// backoff), and a final `tcdrain`.
    pub fn write_robust(&mut self, buf: &[u8]) -> BridgeResult<usize> {
        if self.carrier_detect_enabled && !self.check_carrier() {
            return Err(BridgeError::Hangup);
        }

        let mut written = 0;
        let mut attempts = 0;
        while written < buf.len() {
            match unistd::write(unsafe { borrow(self.fd) }, &buf[written..]) {
                Ok(n) => {
                    written += n;
                    attempts = 0;
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    attempts += 1;
                    if attempts > 3 {
                        return Err(BridgeError::Io {
                            syscall: "write",
                            source: std::io::Error::from_raw_os_error(libc::EAGAIN),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(nix::errno::Errno::EPIPE | nix::errno::Errno::ECONNRESET) => {
                    return Err(BridgeError::Hangup)
                }
                Err(e) => {
                    return Err(BridgeError::io(
                        "write",
                        std::io::Error::from_raw_os_error(e as i32),
                    ))
                }
            }
        }

        termios::tcdrain(unsafe { borrow(self.fd) })
            .map_err(|e| BridgeError::io("tcdrain", std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(written)
    }

    /// Flush both directions, apply the new speed via `TCSADRAIN`, wait
    /// 100 ms for the line to settle.
    pub fn set_baud(&mut self, baud: u32) -> BridgeResult<()> {
        let rate = baud_rate_const(baud)?;
        let borrowed = unsafe { borrow(self.fd) };
        let mut tio = termios::tcgetattr(borrowed)
            .map_err(|e| BridgeError::io("tcgetattr", std::io::Error::from_raw_os_error(e as i32)))?;

        termios::tcflush(borrowed, termios::FlushArg::TCIOFLUSH)
            .map_err(|e| BridgeError::io("tcflush", std::io::Error::from_raw_os_error(e as i32)))?;

        termios::cfsetispeed(&mut tio, rate)
            .map_err(|e| BridgeError::io("cfsetispeed", std::io::Error::from_raw_os_error(e as i32)))?;
        termios::cfsetospeed(&mut tio, rate)
            .map_err(|e| BridgeError::io("cfsetospeed", std::io::Error::from_raw_os_error(e as i32)))?;

        termios::tcsetattr(borrowed, SetArg::TCSADRAIN, &tio)
            .map_err(|e| BridgeError::io("tcsetattr", std::io::Error::from_raw_os_error(e as i32)))?;

        std::thread::sleep(Duration::from_millis(100));
        self.current_baud = baud;
        debug!("serial endpoint {}: baud changed to {baud}", self.device.display());
        Ok(())
    }

    pub fn get_baud(&self) -> u32 {
        self.current_baud
    }

    /// Toggle `CLOCAL` (ignore vs. honor carrier) and hardware flow
    /// control together, per §4.A.
    pub fn enable_carrier_detect(&mut self) -> BridgeResult<()> {
        self.set_clocal(false)?;
        self.carrier_detect_enabled = true;
        Ok(())
    }

    pub fn disable_carrier_detect(&mut self) -> BridgeResult<()> {
        self.set_clocal(true)?;
        self.carrier_detect_enabled = false;
        Ok(())
    }

    fn set_clocal(&mut self, clocal: bool) -> BridgeResult<()> {
        let borrowed = unsafe { borrow(self.fd) };
        let mut tio = termios::tcgetattr(borrowed)
            .map_err(|e| BridgeError::io("tcgetattr", std::io::Error::from_raw_os_error(e as i32)))?;
        if clocal {
            tio.control_flags |= termios::ControlFlags::CLOCAL;
            tio.control_flags &= !termios::ControlFlags::CRTSCTS;
        } else {
            tio.control_flags &= !termios::ControlFlags::CLOCAL;
            tio.control_flags |= termios::ControlFlags::CRTSCTS;
        }
        termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
            .map_err(|e| BridgeError::io("tcsetattr", std::io::Error::from_raw_os_error(e as i32)))?;
        Ok(())
    }

    /// Read DCD from the modem status lines via `TIOCMGET`.
    pub fn check_carrier(&mut self) -> bool {
        let mut flags: libc::c_int = 0;
        // SAFETY: fd is open; flags is a valid out-pointer for TIOCMGET.
        let rc = unsafe { libc::ioctl(self.fd, libc::TIOCMGET, std::ptr::addr_of_mut!(flags)) };
        self.dcd_observed = rc == 0 && (flags & libc::TIOCM_CAR) != 0;
        self.dcd_observed
    }

    /// Drop DTR by momentarily setting line speed to 0 (POSIX convention),
    /// wait 1 s, restore the previous speed.
    pub fn dtr_drop_hangup(&mut self) -> BridgeResult<()> {
        let saved = self.current_baud;
        let borrowed = unsafe { borrow(self.fd) };
        let mut tio = termios::tcgetattr(borrowed)
            .map_err(|e| BridgeError::io("tcgetattr", std::io::Error::from_raw_os_error(e as i32)))?;
        termios::cfsetispeed(&mut tio, BaudRate::B0)
            .map_err(|e| BridgeError::io("cfsetispeed", std::io::Error::from_raw_os_error(e as i32)))?;
        termios::cfsetospeed(&mut tio, BaudRate::B0)
            .map_err(|e| BridgeError::io("cfsetospeed", std::io::Error::from_raw_os_error(e as i32)))?;
        termios::tcsetattr(borrowed, SetArg::TCSANOW, &tio)
            .map_err(|e| BridgeError::io("tcsetattr", std::io::Error::from_raw_os_error(e as i32)))?;

        std::thread::sleep(Duration::from_secs(1));

        self.set_baud(saved)
    }
}

impl Drop for SerialEndpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn configure_raw(tio: &mut termios::Termios, params: LineParams) -> BridgeResult<()> {
    termios::cfmakeraw(tio);

    // OPOST + CR->CRLF on output, per §4.A ("output processing = OPOST+CR→CRLF").
    tio.output_flags |= termios::OutputFlags::OPOST | termios::OutputFlags::ONLCR;

    tio.control_flags |= termios::ControlFlags::CS8
        | termios::ControlFlags::CREAD
        | termios::ControlFlags::HUPCL
        | termios::ControlFlags::CLOCAL;
    tio.control_flags &= !(termios::ControlFlags::PARENB
        | termios::ControlFlags::PARODD
        | termios::ControlFlags::CSTOPB
        | termios::ControlFlags::CSIZE);

    match params.data_bits {
        5 => tio.control_flags |= termios::ControlFlags::CS5,
        6 => tio.control_flags |= termios::ControlFlags::CS6,
        7 => tio.control_flags |= termios::ControlFlags::CS7,
        _ => tio.control_flags |= termios::ControlFlags::CS8,
    }

    match params.parity {
        Parity::None => {}
        Parity::Even => tio.control_flags |= termios::ControlFlags::PARENB,
        Parity::Odd => {
            tio.control_flags |= termios::ControlFlags::PARENB | termios::ControlFlags::PARODD
        }
    }

    if params.stop_bits == 2 {
        tio.control_flags |= termios::ControlFlags::CSTOPB;
    }

    match params.flow {
        Flow::None => {
            tio.control_flags &= !termios::ControlFlags::CRTSCTS;
            tio.input_flags &= !(termios::InputFlags::IXON | termios::InputFlags::IXOFF);
        }
        Flow::Software => {
            tio.control_flags &= !termios::ControlFlags::CRTSCTS;
            tio.input_flags |= termios::InputFlags::IXON | termios::InputFlags::IXOFF;
        }
        Flow::Hardware => {
            tio.control_flags |= termios::ControlFlags::CRTSCTS;
            tio.input_flags &= !(termios::InputFlags::IXON | termios::InputFlags::IXOFF);
        }
        Flow::Both => {
            tio.control_flags |= termios::ControlFlags::CRTSCTS;
            tio.input_flags |= termios::InputFlags::IXON | termios::InputFlags::IXOFF;
        }
    }

    let rate = baud_rate_const(params.baud)?;
    termios::cfsetispeed(tio, rate)
        .map_err(|e| BridgeError::io("cfsetispeed", std::io::Error::from_raw_os_error(e as i32)))?;
    termios::cfsetospeed(tio, rate)
        .map_err(|e| BridgeError::io("cfsetospeed", std::io::Error::from_raw_os_error(e as i32)))?;

    tio.control_chars[CC::VMIN as usize] = 1;
    tio.control_chars[CC::VTIME as usize] = 0;

    Ok(())
}

fn clear_nonblocking(fd: RawFd) -> BridgeResult<()> {
    let flags = fcntl::fcntl(fd, fcntl::FcntlArg::F_GETFL)
        .map_err(|e| BridgeError::io("F_GETFL", std::io::Error::from_raw_os_error(e as i32)))?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.remove(OFlag::O_NONBLOCK);
    fcntl::fcntl(fd, fcntl::FcntlArg::F_SETFL(oflags))
        .map_err(|e| BridgeError::io("F_SETFL", std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(())
}

impl Endpoint for SerialEndpoint {
    fn try_read(&mut self, buf: &mut [u8]) -> BridgeResult<(usize, Status)> {
        let n = self.read(buf)?;
        Ok((n, Status::Complete))
    }

    fn try_write(&mut self, buf: &[u8]) -> BridgeResult<(usize, Status)> {
        let n = self.write_robust(buf)?;
        Ok((n, Status::Complete))
    }

    fn is_healthy(&self) -> bool {
        self.fd >= 0
    }

    fn close(&mut self) -> BridgeResult<()> {
        SerialEndpoint::close(self)
    }
}

impl AsRawFd for SerialEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baud_rate_const_rejects_unsupported_value() {
        assert!(baud_rate_const(1_000_000).is_err());
    }

    #[test]
    fn baud_rate_const_accepts_all_documented_rates() {
        for b in [300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400] {
            assert!(baud_rate_const(b).is_ok(), "baud {b} should be accepted");
        }
    }

    #[test]
    fn configure_raw_sets_vmin_vtime_per_spec() {
        let mut tio: termios::Termios = unsafe { std::mem::zeroed() };
        let params = LineParams {
            baud: 9600,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: 1,
            flow: Flow::None,
        };
        configure_raw(&mut tio, params).unwrap();
        assert_eq!(tio.control_chars[CC::VMIN as usize], 1);
        assert_eq!(tio.control_chars[CC::VTIME as usize], 0);
    }

    #[test]
    fn pid_is_alive_true_for_current_process() {
        assert!(pid_is_alive(std::process::id()));
    }

    #[test]
    fn pid_is_alive_false_for_unlikely_pid() {
        assert!(!pid_is_alive(u32::MAX - 1));
    }
}
