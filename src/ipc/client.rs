//! Blocking UNIX-domain socket client for the execution engine.
//!
//! This module provides `Client`, which owns exactly one socket descriptor
//! and drives it through `Unopened -> Connected -> Closed`. Reads may be
//! short and report end-of-stream as `0`; writes are looped internally so a
//! caller never observes a partially sent buffer.

use std::fmt;
use std::io::{self, Read};
use std::net::Shutdown;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use socket2::{Domain, SockAddr, Socket, Type};
use thiserror::Error;
use tracing::{debug, trace};

/// Flags passed to every `send(2)`. A dead peer must surface as `EPIPE`,
/// not as a process-wide `SIGPIPE`.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Transport error types.
///
/// Retry policy never lives in the transport: only `Connect` is worth
/// retrying, and that decision belongs to the caller.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The OS could not allocate a socket descriptor.
    #[error("Failed to allocate socket: {0}")]
    Resource(#[source] io::Error),

    /// The peer socket is absent, refusing, or unreachable.
    #[error("Failed to connect to {}: {source}", path.display())]
    Connect {
        /// Endpoint that was dialed
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Mid-stream failure (reset, broken pipe, timeout, unexpected EOF).
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Operation attempted on a handle that is not connected.
    #[error("Cannot {op} on a {state} handle")]
    InvalidHandle {
        /// State the handle was in
        state: ConnectionState,
        /// Operation that was rejected
        op: &'static str,
    },

    /// Buffer view does not fit inside the buffer.
    #[error("Buffer view {offset}+{length} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        capacity: usize,
    },
}

impl TransportError {
    /// Whether a fresh connection attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Connect { .. })
    }

    /// The underlying OS error kind, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Resource(e) | TransportError::Io(e) => Some(e.kind()),
            TransportError::Connect { source, .. } => Some(source.kind()),
            _ => None,
        }
    }
}

/// Lifecycle of a client's descriptor. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Descriptor allocated, no peer bound yet.
    Unopened,
    /// Bound to a listening peer; reads and writes are allowed.
    Connected,
    /// Descriptor released. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Unopened => "unconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The five primitives a runtime binding needs to drive the engine socket.
///
/// `Client` is the OS-backed implementation. The trait also lets framing and
/// session code run against in-memory transports in tests.
pub trait Transport {
    /// Allocate a new, unconnected transport.
    fn open() -> Result<Self, TransportError>
    where
        Self: Sized;

    /// Connect to the peer listening at `path`. No retry is performed.
    fn connect(&mut self, path: &Path) -> Result<(), TransportError>;

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer shut down.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write every byte of `buf` or fail.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    /// Release the descriptor. Safe to call in any state, any number of times.
    fn close(&mut self);

    /// Fill `buf` completely, looping over short reads.
    ///
    /// End-of-stream before `buf` is full is an `Io` error of kind
    /// `UnexpectedEof`.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        fill_exact(buf, |chunk| self.read(chunk))
    }

    /// `read` into the view `buf[offset..offset + length]`.
    fn read_into(
        &mut self,
        buf: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<usize, TransportError> {
        let range = buffer_view(buf.len(), offset, length)?;
        self.read(&mut buf[range])
    }

    /// `write_all` from the view `buf[offset..offset + length]`.
    fn write_from(
        &mut self,
        buf: &[u8],
        offset: usize,
        length: usize,
    ) -> Result<(), TransportError> {
        let range = buffer_view(buf.len(), offset, length)?;
        self.write_all(&buf[range])
    }
}

/// Validate a `(offset, length)` view against a buffer of `capacity` bytes.
pub fn buffer_view(
    capacity: usize,
    offset: usize,
    length: usize,
) -> Result<Range<usize>, TransportError> {
    match offset.checked_add(length) {
        Some(end) if end <= capacity => Ok(offset..end),
        _ => Err(TransportError::OutOfBounds {
            offset,
            length,
            capacity,
        }),
    }
}

#[derive(Debug)]
enum Handle {
    Unconnected(Socket),
    Connected(Socket),
    Closed,
}

impl Handle {
    fn state(&self) -> ConnectionState {
        match self {
            Handle::Unconnected(_) => ConnectionState::Unopened,
            Handle::Connected(_) => ConnectionState::Connected,
            Handle::Closed => ConnectionState::Closed,
        }
    }
}

/// Client side of the engine socket.
///
/// Owns one descriptor for its whole life. Once closed (explicitly, by a
/// failed `connect`, or by drop) the descriptor is gone and the client can
/// never be reused; open a new one instead.
///
/// # Example
///
/// ```ignore
/// use ee_ipc::ipc::{Client, Transport};
///
/// let mut client = Client::open()?;
/// client.connect("/tmp/ee.sock".as_ref())?;
/// client.write_all(&[0x01, 0x02, 0x03])?;
///
/// let mut buf = [0u8; 16];
/// let n = client.read(&mut buf)?;
/// client.close();
/// ```
#[derive(Debug)]
pub struct Client {
    handle: Handle,
    /// Endpoint supplied to `connect`, kept for diagnostics.
    peer: Option<PathBuf>,
}

impl Client {
    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.handle, Handle::Connected(_))
    }

    /// Path passed to the last `connect`, even if it failed.
    pub fn peer_path(&self) -> Option<&Path> {
        self.peer.as_deref()
    }

    /// Set `SO_RCVTIMEO`. `None` blocks indefinitely.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.live_socket("set read timeout")?
            .set_read_timeout(timeout)
            .map_err(TransportError::Io)
    }

    /// Set `SO_SNDTIMEO`. `None` blocks indefinitely.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        self.live_socket("set write timeout")?
            .set_write_timeout(timeout)
            .map_err(TransportError::Io)
    }

    /// Split a connected client into independently owned read and write
    /// halves, so one thread per direction can block without the other.
    ///
    /// Both halves share the same connection. Closing the writer shuts the
    /// connection down and wakes a blocked reader.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHandle` unless connected, and `Resource` if the
    /// descriptor cannot be duplicated. The client is consumed either way.
    pub fn try_split(mut self) -> Result<(ClientReader, ClientWriter), TransportError> {
        let socket = match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Connected(socket) => socket,
            other => {
                return Err(TransportError::InvalidHandle {
                    state: other.state(),
                    op: "split",
                })
            }
        };
        let writer = socket.try_clone().map_err(TransportError::Resource)?;
        debug!("Split engine connection into reader and writer");

        Ok((
            ClientReader {
                socket: Some(socket),
            },
            ClientWriter {
                socket: Some(writer),
            },
        ))
    }

    fn live_socket(&self, op: &'static str) -> Result<&Socket, TransportError> {
        match &self.handle {
            Handle::Unconnected(socket) | Handle::Connected(socket) => Ok(socket),
            Handle::Closed => Err(TransportError::InvalidHandle {
                state: ConnectionState::Closed,
                op,
            }),
        }
    }

    fn connected_socket(&mut self, op: &'static str) -> Result<&mut Socket, TransportError> {
        match &mut self.handle {
            Handle::Connected(socket) => Ok(socket),
            other => Err(TransportError::InvalidHandle {
                state: other.state(),
                op,
            }),
        }
    }
}

impl Transport for Client {
    fn open() -> Result<Self, TransportError> {
        let socket =
            Socket::new(Domain::UNIX, Type::STREAM, None).map_err(TransportError::Resource)?;
        debug!("Opened unix socket");

        Ok(Self {
            handle: Handle::Unconnected(socket),
            peer: None,
        })
    }

    fn connect(&mut self, path: &Path) -> Result<(), TransportError> {
        let socket = match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Unconnected(socket) => socket,
            other => {
                let state = other.state();
                self.handle = other;
                return Err(TransportError::InvalidHandle {
                    state,
                    op: "connect",
                });
            }
        };
        self.peer = Some(path.to_path_buf());

        // On failure `socket` drops here and the client stays Closed.
        let result = SockAddr::unix(path).and_then(|addr| socket.connect(&addr));
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Connected to engine socket");
                self.handle = Handle::Connected(socket);
                Ok(())
            }
            Err(source) => {
                debug!(path = %path.display(), error = %source, "Connect failed");
                Err(TransportError::Connect {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        recv(self.connected_socket("read")?, buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        send_all(self.connected_socket("write")?, buf)
    }

    fn close(&mut self) {
        match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Connected(socket) => {
                shutdown_quietly(&socket);
                debug!("Closed engine connection");
            }
            Handle::Unconnected(_) => debug!("Closed unconnected socket"),
            Handle::Closed => {}
        }
    }
}

/// Read half of a split `Client`.
///
/// Blocks independently of the matching `ClientWriter`, so one thread can
/// wait for the engine while another sends to it.
#[derive(Debug)]
pub struct ClientReader {
    socket: Option<Socket>,
}

impl ClientReader {
    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer shut down or
    /// the writer half was closed.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        recv(half_socket(&mut self.socket, "read")?, buf)
    }

    /// Fill `buf` completely, looping over short reads.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        fill_exact(buf, |chunk| self.read(chunk))
    }

    /// Set `SO_RCVTIMEO` on the shared socket.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        half_socket(&mut self.socket, "set read timeout")?
            .set_read_timeout(timeout)
            .map_err(TransportError::Io)
    }

    /// Release this half's descriptor. The connection stays up until the
    /// writer is closed or dropped too.
    pub fn close(&mut self) {
        self.socket = None;
    }
}

/// Write half of a split `Client`.
#[derive(Debug)]
pub struct ClientWriter {
    socket: Option<Socket>,
}

impl ClientWriter {
    /// Write every byte of `buf` or fail.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        send_all(half_socket(&mut self.socket, "write")?, buf)
    }

    /// Set `SO_SNDTIMEO` on the shared socket.
    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<(), TransportError> {
        half_socket(&mut self.socket, "set write timeout")?
            .set_write_timeout(timeout)
            .map_err(TransportError::Io)
    }

    /// Shut the connection down in both directions and release this half.
    ///
    /// A read blocked on the matching `ClientReader` wakes with `Ok(0)`.
    /// Second and later calls do nothing.
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            shutdown_quietly(&socket);
            debug!("Closed engine connection from writer");
        }
    }
}

fn half_socket<'a>(
    socket: &'a mut Option<Socket>,
    op: &'static str,
) -> Result<&'a mut Socket, TransportError> {
    socket.as_mut().ok_or(TransportError::InvalidHandle {
        state: ConnectionState::Closed,
        op,
    })
}

fn fill_exact<F>(buf: &mut [u8], mut read: F) -> Result<(), TransportError>
where
    F: FnMut(&mut [u8]) -> Result<usize, TransportError>,
{
    let mut filled = 0;
    while filled < buf.len() {
        match read(&mut buf[filled..])? {
            0 => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {} of {} bytes", filled, buf.len()),
                )))
            }
            n => filled += n,
        }
    }
    Ok(())
}

fn recv(socket: &mut Socket, buf: &mut [u8]) -> Result<usize, TransportError> {
    if buf.is_empty() {
        return Ok(0);
    }

    loop {
        match socket.read(buf) {
            Ok(0) => {
                debug!("Peer closed the connection");
                return Ok(0);
            }
            Ok(n) => {
                trace!(bytes = n, requested = buf.len(), "read");
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
}

fn send_all(socket: &Socket, buf: &[u8]) -> Result<(), TransportError> {
    let mut written = 0;
    while written < buf.len() {
        match socket.send_with_flags(&buf[written..], SEND_FLAGS) {
            Ok(0) => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("socket accepted 0 bytes after {} of {}", written, buf.len()),
                )))
            }
            Ok(n) => {
                trace!(bytes = n, "write");
                written += n;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransportError::Io(e)),
        }
    }
    Ok(())
}

/// Shut down both directions, waking readers on any clone of `socket`.
fn shutdown_quietly(socket: &Socket) {
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        if e.kind() != io::ErrorKind::NotConnected {
            debug!(error = %e, "Shutdown before close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::os::unix::net::UnixListener;
    use std::thread;

    fn test_socket_path(test_name: &str) -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        PathBuf::from(format!(
            "/tmp/ee-ipc-unit-{}-{}-{}.sock",
            test_name,
            std::process::id(),
            timestamp
        ))
    }

    #[test]
    fn test_open_starts_unconnected() {
        let client = Client::open().expect("open");
        assert_eq!(client.state(), ConnectionState::Unopened);
        assert!(!client.is_connected());
        assert!(client.peer_path().is_none());
    }

    #[test]
    fn test_read_write_rejected_before_connect() {
        let mut client = Client::open().expect("open");
        let mut buf = [0u8; 4];

        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidHandle {
                state: ConnectionState::Unopened,
                op: "read"
            }
        ));

        let err = client.write_all(b"abc").unwrap_err();
        assert!(matches!(err, TransportError::InvalidHandle { op: "write", .. }));
    }

    #[test]
    fn test_connect_missing_peer_closes_handle() {
        let path = test_socket_path("missing");
        let mut client = Client::open().expect("open");

        let err = client.connect(&path).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert!(err.is_retryable());
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.peer_path(), Some(path.as_path()));

        let mut buf = [0u8; 4];
        assert!(matches!(
            client.read(&mut buf),
            Err(TransportError::InvalidHandle {
                state: ConnectionState::Closed,
                ..
            })
        ));
        assert!(matches!(
            client.connect(&path),
            Err(TransportError::InvalidHandle { op: "connect", .. })
        ));
    }

    #[test]
    fn test_connect_rejects_overlong_path() {
        let path = PathBuf::from(format!("/tmp/{}.sock", "x".repeat(200)));
        let mut client = Client::open().expect("open");

        let err = client.connect(&path).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_second_connect_is_rejected() {
        let path = test_socket_path("reconnect");
        let listener = UnixListener::bind(&path).expect("bind");
        let peer = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let mut client = Client::open().expect("open");
        client.connect(&path).expect("connect");
        let _stream = peer.join().unwrap().expect("accept");

        let err = client.connect(&path).unwrap_err();
        assert!(matches!(
            err,
            TransportError::InvalidHandle {
                state: ConnectionState::Connected,
                op: "connect"
            }
        ));
        assert!(client.is_connected());

        client.close();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_close_twice_is_noop() {
        let mut client = Client::open().expect("open");
        client.close();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(matches!(
            client.set_read_timeout(Some(Duration::from_millis(5))),
            Err(TransportError::InvalidHandle { .. })
        ));
    }

    #[test]
    fn test_read_timeout_surfaces_as_io() {
        let path = test_socket_path("timeout");
        let listener = UnixListener::bind(&path).expect("bind");
        let peer = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let mut client = Client::open().expect("open");
        client
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("timeout before connect");
        client.connect(&path).expect("connect");
        let _stream = peer.join().unwrap().expect("accept");

        let mut buf = [0u8; 8];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(
            err.io_kind(),
            Some(io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        ));

        client.close();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_split_requires_connection() {
        let client = Client::open().expect("open");
        assert!(matches!(
            client.try_split(),
            Err(TransportError::InvalidHandle {
                state: ConnectionState::Unopened,
                op: "split"
            })
        ));
    }

    #[test]
    fn test_split_halves_close_independently() {
        let path = test_socket_path("split_close");
        let listener = UnixListener::bind(&path).expect("bind");
        let peer = thread::spawn(move || listener.accept().map(|(stream, _)| stream));

        let mut client = Client::open().expect("open");
        client.connect(&path).expect("connect");
        let mut stream = peer.join().unwrap().expect("accept");
        let (mut reader, mut writer) = client.try_split().expect("split");

        // Dropping the reader's descriptor leaves the connection up.
        reader.close();
        let mut buf = [0u8; 2];
        assert!(matches!(
            reader.read(&mut buf),
            Err(TransportError::InvalidHandle { op: "read", .. })
        ));
        writer.write_all(b"ok").expect("writer still usable");
        std::io::Read::read_exact(&mut stream, &mut buf).unwrap();
        assert_eq!(&buf, b"ok");

        writer.close();
        writer.close();
        assert!(matches!(
            writer.write_all(b"x"),
            Err(TransportError::InvalidHandle {
                state: ConnectionState::Closed,
                ..
            })
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_buffer_view_bounds() {
        assert_eq!(buffer_view(10, 2, 8).unwrap(), 2..10);
        assert_eq!(buffer_view(10, 10, 0).unwrap(), 10..10);
        assert!(matches!(
            buffer_view(10, 3, 8),
            Err(TransportError::OutOfBounds {
                offset: 3,
                length: 8,
                capacity: 10
            })
        ));
        assert!(buffer_view(10, usize::MAX, 2).is_err());
    }

    #[test]
    fn test_error_display() {
        let err = TransportError::InvalidHandle {
            state: ConnectionState::Closed,
            op: "read",
        };
        assert_eq!(err.to_string(), "Cannot read on a closed handle");

        let err = TransportError::Connect {
            path: PathBuf::from("/tmp/ee.sock"),
            source: io::Error::new(io::ErrorKind::NotFound, "not found"),
        };
        assert_eq!(err.to_string(), "Failed to connect to /tmp/ee.sock: not found");
        assert_eq!(err.io_kind(), Some(io::ErrorKind::NotFound));

        let err = TransportError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
        assert!(!err.is_retryable());
    }
}
