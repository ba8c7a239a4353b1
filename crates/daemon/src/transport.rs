//! Local socket acceptor.

use std::fmt;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, info};

const BACKLOG: i32 = 20;

/// `sun_path` capacity including the trailing NUL.
const MAX_PATH_LEN: usize = 108;

/// Where the helper listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Path(PathBuf),
    /// Linux abstract namespace, written `@name`.
    Abstract(String),
    /// Already-bound descriptor inherited from the parent, written `fd:N`.
    Fd(RawFd),
}

impl SocketAddress {
    /// Default socket in the runtime directory (`~/.warden/warden.sock`).
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime directory cannot be determined.
    pub fn default_path() -> io::Result<Self> {
        Ok(Self::Path(warden_core::runtime_dir()?.join("warden.sock")))
    }
}

impl FromStr for SocketAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix('@') {
            if name.is_empty() {
                return Err("abstract socket name is empty".into());
            }
            return Ok(Self::Abstract(name.to_string()));
        }
        if let Some(fd) = s.strip_prefix("fd:") {
            return fd
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .map(Self::Fd)
                .ok_or_else(|| format!("invalid descriptor {fd:?}"));
        }
        if s.is_empty() {
            return Err("socket path is empty".into());
        }
        Ok(Self::Path(PathBuf::from(s)))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(p) => write!(f, "{}", p.display()),
            Self::Abstract(name) => write!(f, "@{name}"),
            Self::Fd(fd) => write!(f, "fd:{fd}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("socket path {path} is longer than {max} bytes")]
    PathTooLong { path: String, max: usize },
    #[error("abstract namespace sockets are not supported on this platform")]
    AbstractUnsupported,
    #[error("cannot create socket: {0}")]
    Socket(#[source] io::Error),
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot listen: {0}")]
    Listen(#[source] io::Error),
    #[error("inherited descriptor {fd} is not a usable socket: {source}")]
    InvalidFd {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

pub struct Acceptor {
    socket: Socket,
    address: SocketAddress,
}

impl Acceptor {
    /// Bind and listen on `address`.
    ///
    /// A stale socket file left at a filesystem path is removed first.
    ///
    /// # Errors
    ///
    /// Returns a [`SetupError`] if the socket cannot be set up.
    pub fn bind(address: &SocketAddress) -> Result<Self, SetupError> {
        let socket = match address {
            SocketAddress::Path(path) => bind_path(path)?,
            SocketAddress::Abstract(name) => bind_abstract(name)?,
            SocketAddress::Fd(fd) => {
                // SAFETY: the caller hands over ownership of an inherited descriptor.
                let socket = unsafe { Socket::from_raw_fd(*fd) };
                socket
                    .local_addr()
                    .map_err(|source| SetupError::InvalidFd { fd: *fd, source })?;
                socket
            }
        };
        socket.listen(BACKLOG).map_err(SetupError::Listen)?;
        info!(%address, "listening");

        Ok(Self {
            socket,
            address: address.clone(),
        })
    }

    #[must_use]
    pub const fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// Bound how long `accept()` blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the timeout cannot be set.
    pub fn set_accept_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.socket.set_read_timeout(Some(timeout))
    }

    /// Wait for a connection. `Ok(None)` means the timeout elapsed or the
    /// call was interrupted.
    ///
    /// # Errors
    ///
    /// Any other accept failure is fatal and returned.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.socket.accept() {
            Ok((socket, _)) => {
                socket.set_read_timeout(None)?;
                Ok(Some(UnixStream::from(socket)))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if let SocketAddress::Path(path) = &self.address {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn new_socket() -> Result<Socket, SetupError> {
    Socket::new(Domain::UNIX, Type::STREAM, None).map_err(SetupError::Socket)
}

fn bind_path(path: &Path) -> Result<Socket, SetupError> {
    let len = path.as_os_str().len();
    if len >= MAX_PATH_LEN {
        return Err(SetupError::PathTooLong {
            path: path.display().to_string(),
            max: MAX_PATH_LEN - 1,
        });
    }
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|source| SetupError::Bind {
            address: path.display().to_string(),
            source,
        })?;
    }
    if path.exists() {
        debug!(path = %path.display(), "removing stale socket");
        let _ = std::fs::remove_file(path);
    }

    let bind_err = |source: io::Error| SetupError::Bind {
        address: path.display().to_string(),
        source,
    };
    let addr = SockAddr::unix(path).map_err(bind_err)?;
    let socket = new_socket()?;
    socket.bind(&addr).map_err(bind_err)?;
    Ok(socket)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(name: &str) -> Result<Socket, SetupError> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    if name.len() + 1 > MAX_PATH_LEN {
        return Err(SetupError::PathTooLong {
            path: format!("@{name}"),
            max: MAX_PATH_LEN - 1,
        });
    }
    let mut raw = Vec::with_capacity(name.len() + 1);
    raw.push(0u8);
    raw.extend_from_slice(name.as_bytes());

    let bind_err = |source: io::Error| SetupError::Bind {
        address: format!("@{name}"),
        source,
    };
    let addr = SockAddr::unix(OsStr::from_bytes(&raw)).map_err(bind_err)?;
    let socket = new_socket()?;
    socket.bind(&addr).map_err(bind_err)?;
    Ok(socket)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(_name: &str) -> Result<Socket, SetupError> {
    Err(SetupError::AbstractUnsupported)
}

/// PID file next to the default socket.
///
/// # Errors
///
/// Returns an error if the runtime directory cannot be determined.
pub fn pid_file_path() -> io::Result<PathBuf> {
    Ok(warden_core::runtime_dir()?.join("warden.pid"))
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};

    use super::*;

    #[test]
    fn parses_addresses() {
        assert_eq!(
            "/tmp/w.sock".parse::<SocketAddress>().unwrap(),
            SocketAddress::Path("/tmp/w.sock".into())
        );
        assert_eq!(
            "@warden".parse::<SocketAddress>().unwrap(),
            SocketAddress::Abstract("warden".into())
        );
        assert_eq!("fd:3".parse::<SocketAddress>().unwrap(), SocketAddress::Fd(3));
        assert!("fd:x".parse::<SocketAddress>().is_err());
        assert!("@".parse::<SocketAddress>().is_err());
        assert!("".parse::<SocketAddress>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for s in ["/run/warden.sock", "@warden-1", "fd:7"] {
            assert_eq!(s.parse::<SocketAddress>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn rejects_long_path() {
        let path = PathBuf::from(format!("/tmp/{}", "x".repeat(MAX_PATH_LEN)));
        assert!(matches!(
            Acceptor::bind(&SocketAddress::Path(path)),
            Err(SetupError::PathTooLong { .. })
        ));
    }

    #[test]
    fn accept_times_out_then_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        let acceptor = Acceptor::bind(&SocketAddress::Path(path.clone())).unwrap();
        acceptor
            .set_accept_timeout(Duration::from_millis(20))
            .unwrap();

        assert!(acceptor.accept().unwrap().is_none());

        let mut client = UnixStream::connect(&path).unwrap();
        client.write_all(b"hi").unwrap();
        let mut server = acceptor.accept().unwrap().unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn replaces_stale_socket_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.sock");
        std::fs::write(&path, b"stale").unwrap();

        let acceptor = Acceptor::bind(&SocketAddress::Path(path.clone())).unwrap();
        assert!(UnixStream::connect(&path).is_ok());
        drop(acceptor);
        assert!(!path.exists());
    }

    #[test]
    fn invalid_inherited_fd() {
        let file = tempfile::tempfile().unwrap();
        let fd = std::os::fd::IntoRawFd::into_raw_fd(file);
        assert!(matches!(
            Acceptor::bind(&SocketAddress::Fd(fd)),
            Err(SetupError::InvalidFd { .. })
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn binds_abstract_name() {
        let name = format!("warden-test-{}", std::process::id());
        let acceptor = Acceptor::bind(&SocketAddress::Abstract(name)).unwrap();
        assert!(matches!(acceptor.address(), SocketAddress::Abstract(_)));
    }
}
