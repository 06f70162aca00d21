//! TCP endpoint: the network thread's side of the dual pipeline (§5 "the
//! TCP fd likewise"). Implements the same [`Endpoint`] capability set as
//! the serial side (§9 "Dynamic dispatch / interfaces") with an analogous
//! 100 ms bounded-wait read via `select`, so the scheduler in
//! `pipeline::mod` never branches on which kind of fd it holds.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;

use crate::endpoint::Endpoint;
use crate::error::{BridgeError, BridgeResult, Status};

/// Owns the TCP connection to `TELNET_HOST:TELNET_PORT`. Single-writer,
/// single-reader by convention (the network thread), mirroring
/// `SerialEndpoint`.
pub struct TcpEndpoint {
    stream: TcpStream,
}

impl TcpEndpoint {
    /// Connect to `host:port` with a bounded connect timeout (matches the
    /// bounded-wait philosophy in §5 — "There is no unbounded wait").
    pub fn connect(host: &str, port: u16, timeout: Duration) -> BridgeResult<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| BridgeError::io("resolve", e))?
            .next()
            .ok_or_else(|| BridgeError::InvalidArg(format!("no address for {host}:{port}")))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| BridgeError::io("connect", e))?;
        stream.set_nonblocking(true).map_err(|e| BridgeError::io("set_nonblocking", e))?;
        stream.set_nodelay(true).map_err(|e| BridgeError::io("set_nodelay", e))?;

        Ok(Self { stream })
    }

    /// Best-effort reachability probe used by the health report (§4.H) —
    /// connects and immediately drops the socket.
    pub fn probe(host: &str, port: u16, timeout: Duration) -> bool {
        (host, port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .and_then(|addr| TcpStream::connect_timeout(&addr, timeout).ok())
            .is_some()
    }

    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Endpoint for TcpEndpoint {
    /// Bounded-wait read: `select` with a 100 ms timeout, mirroring the
    /// serial endpoint's `read()` contract (§4.A) so the scheduler's tick
    /// loop has a uniform timing model on both sides.
    fn try_read(&mut self, buf: &mut [u8]) -> BridgeResult<(usize, Status)> {
        let mut readfds = FdSet::new();
        let mut exceptfds = FdSet::new();
        readfds.insert(self.fd());
        exceptfds.insert(self.fd());
        let mut timeout = TimeVal::new(0, 100_000);

        let n = select(None, &mut readfds, None, &mut exceptfds, &mut timeout)
            .map_err(|e| BridgeError::io("select", std::io::Error::from_raw_os_error(e as i32)))?;
        if n == 0 {
            return Ok((0, Status::Complete));
        }
        if exceptfds.contains(self.fd()) {
            return Err(BridgeError::Hangup);
        }

        match self.stream.read(buf) {
            Ok(0) => Err(BridgeError::Hangup),
            Ok(n) => Ok((n, Status::Complete)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok((0, Status::Complete)),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) => {
                Err(BridgeError::Hangup)
            }
            Err(e) => Err(BridgeError::io("read", e)),
        }
    }

    /// Best-effort non-blocking write; a short write is reported as
    /// `Status::Partial` so the caller retries with the remaining suffix,
    /// matching the telnet framer's own `PARTIAL` contract (§4.C).
    fn try_write(&mut self, buf: &[u8]) -> BridgeResult<(usize, Status)> {
        match self.stream.write(buf) {
            Ok(n) if n == buf.len() => Ok((n, Status::Complete)),
            Ok(n) => Ok((n, Status::Partial)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok((0, Status::WouldBlock)),
            Err(e) if matches!(e.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) => {
                Err(BridgeError::Hangup)
            }
            Err(e) => Err(BridgeError::io("write", e)),
        }
    }

    fn is_healthy(&self) -> bool {
        self.stream.take_error().ok().flatten().is_none()
    }

    fn close(&mut self) -> BridgeResult<()> {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connect_and_round_trip_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            sock.write_all(&buf).unwrap();
        });

        let mut ep = TcpEndpoint::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();
        // Block briefly to let the connection establish before writing.
        std::thread::sleep(Duration::from_millis(20));
        let (n, status) = ep.try_write(b"hello").unwrap();
        assert_eq!(n, 5);
        assert_eq!(status, Status::Complete);

        let mut buf = [0u8; 16];
        let mut total = 0;
        for _ in 0..50 {
            let (n, _) = ep.try_read(&mut buf[total..]).unwrap();
            total += n;
            if total >= 5 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(&buf[..5], b"hello");
        server.join().unwrap();
    }

    #[test]
    fn probe_false_for_closed_port() {
        assert!(!TcpEndpoint::probe("127.0.0.1", 1, Duration::from_millis(200)));
    }
}
