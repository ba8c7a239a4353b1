//! Blocking client for the helper socket.

use std::io::{self, Read, Write};
use std::time::Duration;

use interprocess::local_socket::{GenericFilePath, GenericNamespaced, prelude::*};
use tracing::trace;

use crate::protocol::{self, Command, ProtocolError, Response};
use crate::transport::SocketAddress;

/// Timeout for liveness checks (must be fast).
const PING_TIMEOUT: Duration = Duration::from_millis(200);

pub struct Client {
    inner: interprocess::local_socket::Stream,
}

impl Client {
    /// Connect to the helper at `address`, bounding every read and write by
    /// `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the helper is unreachable. Inherited descriptors
    /// cannot be connected to.
    pub fn connect(address: &SocketAddress, timeout: Duration) -> io::Result<Self> {
        let name = match address {
            SocketAddress::Path(path) => path
                .clone()
                .to_fs_name::<GenericFilePath>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            SocketAddress::Abstract(name) => name
                .clone()
                .to_ns_name::<GenericNamespaced>()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            SocketAddress::Fd(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "cannot connect to an inherited descriptor",
                ));
            }
        };
        let inner = interprocess::local_socket::Stream::connect(name)?;
        let _ = inner.set_recv_timeout(Some(timeout));
        let _ = inner.set_send_timeout(Some(timeout));
        Ok(Self { inner })
    }

    /// Send one command and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange fails or the helper hangs up.
    pub fn call(&mut self, command: &Command) -> Result<Response, ProtocolError> {
        trace!(command = command.name(), "call");
        protocol::write_frame(self, command)?;
        protocol::read_frame(self)
    }
}

impl Read for Client {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for Client {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Check that something accepts connections at `address`.
///
/// # Errors
///
/// Returns the connection error if nothing is listening.
pub fn ping(address: &SocketAddress) -> io::Result<()> {
    Client::connect(address, PING_TIMEOUT).map(drop)
}

#[must_use]
pub fn is_helper_running(address: &SocketAddress) -> bool {
    let running = ping(address).is_ok();
    trace!(%address, running, "helper running check");
    running
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_running_without_listener() {
        let dir = tempfile::tempdir().unwrap();
        let address = SocketAddress::Path(dir.path().join("w.sock"));
        assert!(!is_helper_running(&address));
    }

    #[test]
    fn stale_socket_file_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        std::fs::write(&path, b"").unwrap();
        assert!(!is_helper_running(&SocketAddress::Path(path)));
    }

    #[test]
    fn fd_addresses_are_unsupported() {
        let err = Client::connect(&SocketAddress::Fd(3), PING_TIMEOUT)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn call_round_trips_a_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let command: Command = protocol::read_frame(&mut stream).unwrap();
            assert_eq!(command.name(), "config_sync");
            protocol::write_frame(&mut stream, &Response::ConfigSync {}).unwrap();
        });

        let mut client =
            Client::connect(&SocketAddress::Path(path), Duration::from_secs(5)).unwrap();
        let response = client
            .call(&Command::ConfigSync(crate::protocol::ConfigSyncArgs::default()))
            .unwrap();
        assert_eq!(response, Response::ConfigSync {});
        server.join().unwrap();
    }
}
