//! Point-to-point transports: TCP loopback and Unix domain sockets

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Address of the remote end of a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Tcp(addr) => write!(f, "localhost:{}", addr.port()),
            PeerAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// An established byte-stream connection
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream, PathBuf),
}

impl Transport {
    /// Connect to a TCP server on the loopback interface
    pub async fn connect_tcp(port: u16) -> io::Result<Self> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Transport::Tcp(stream))
    }

    #[cfg(unix)]
    pub async fn connect_unix(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        Ok(Transport::Unix(stream, path.to_path_buf()))
    }

    #[cfg(not(unix))]
    pub async fn connect_unix(_path: impl AsRef<Path>) -> io::Result<Self> {
        Err(unsupported())
    }

    pub fn peer_addr(&self) -> io::Result<PeerAddr> {
        match self {
            Transport::Tcp(stream) => stream.peer_addr().map(PeerAddr::Tcp),
            #[cfg(unix)]
            Transport::Unix(_, path) => Ok(PeerAddr::Unix(path.clone())),
        }
    }

    /// Split into independently owned read and write halves
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            Transport::Tcp(stream) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
            #[cfg(unix)]
            Transport::Unix(stream, _) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
        }
    }
}

/// A listening socket. A Unix socket file is removed when the listener is
/// dropped.
pub enum TransportListener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
}

impl TransportListener {
    /// Bind on the loopback interface. Port 0 picks a free port.
    pub async fn bind_tcp(port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await?;
        Ok(TransportListener::Tcp(listener))
    }

    /// Bind a Unix socket, replacing a stale socket file at the same path
    #[cfg(unix)]
    pub fn bind_unix(path: impl AsRef<Path>) -> io::Result<Self> {
        use std::os::unix::fs::FileTypeExt;

        let path = path.as_ref();
        if let Ok(meta) = std::fs::symlink_metadata(path) {
            if meta.file_type().is_socket() {
                tracing::debug!("Removing stale socket {}", path.display());
                std::fs::remove_file(path)?;
            }
        }
        let listener = UnixListener::bind(path)?;
        Ok(TransportListener::Unix {
            listener,
            path: path.to_path_buf(),
        })
    }

    #[cfg(not(unix))]
    pub fn bind_unix(_path: impl AsRef<Path>) -> io::Result<Self> {
        Err(unsupported())
    }

    pub async fn accept(&self) -> io::Result<Transport> {
        match self {
            TransportListener::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Transport::Tcp(stream))
            }
            #[cfg(unix)]
            TransportListener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(Transport::Unix(stream, path.clone()))
            }
        }
    }

    pub fn local_addr(&self) -> io::Result<PeerAddr> {
        match self {
            TransportListener::Tcp(listener) => listener.local_addr().map(PeerAddr::Tcp),
            #[cfg(unix)]
            TransportListener::Unix { path, .. } => Ok(PeerAddr::Unix(path.clone())),
        }
    }

    /// Bound TCP port, if this is a TCP listener
    pub fn port(&self) -> Option<u16> {
        match self.local_addr() {
            Ok(PeerAddr::Tcp(addr)) => Some(addr.port()),
            _ => None,
        }
    }

    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            TransportListener::Tcp(_) => None,
            #[cfg(unix)]
            TransportListener::Unix { path, .. } => Some(path),
        }
    }
}

impl Drop for TransportListener {
    fn drop(&mut self) {
        if let Some(path) = self.socket_path() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(not(unix))]
fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "Unix domain sockets are not supported on this platform",
    )
}

/// Conventional socket path for an application: `/tmp/<app>@<pid>.sock`
pub fn unix_socket_path(app: &str) -> PathBuf {
    PathBuf::from("/tmp").join(format!("{}@{}.sock", app, std::process::id()))
}

pub fn supports_unix_sockets() -> bool {
    cfg!(unix)
}

/// Ask the OS for a free loopback port. The port is released before
/// returning, so it can be taken by someone else in between.
pub async fn discover_open_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_socket_path() {
        let path = unix_socket_path("loopwire");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(path.starts_with("/tmp"));
        assert!(name.starts_with("loopwire@"));
        assert!(name.ends_with(".sock"));
    }

    #[test]
    fn test_peer_addr_display() {
        let addr = PeerAddr::Tcp("127.0.0.1:4862".parse().unwrap());
        assert_eq!(addr.to_string(), "localhost:4862");
    }

    #[tokio::test]
    async fn test_tcp_bind_and_connect() {
        let listener = TransportListener::bind_tcp(0).await.unwrap();
        let port = listener.port().unwrap();
        assert_ne!(port, 0);

        let (accepted, connected) = tokio::join!(listener.accept(), Transport::connect_tcp(port));
        assert!(accepted.is_ok());
        let peer = connected.unwrap().peer_addr().unwrap();
        assert_eq!(peer.to_string(), format!("localhost:{}", port));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_listener_removes_socket_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.sock");

        let listener = TransportListener::bind_unix(&path).unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());

        // A stale file from an earlier run is replaced
        let first = std::os::unix::net::UnixListener::bind(&path).unwrap();
        drop(first);
        assert!(path.exists());
        let listener = TransportListener::bind_unix(&path).unwrap();
        assert_eq!(listener.socket_path(), Some(path.as_path()));
    }
}
