//! Framed TCP connection to a remote node
//!
//! A `Connection` wraps one socket split into independent read and write
//! halves:
//! - writes are serialized behind a single write lock, so concurrent
//!   senders never interleave partial frames
//! - reads fill a buffer owned by the connection and hand out exactly the
//!   requested byte count, or fail
//! - the usable flag is a one-way latch: the first EOF, hard socket error
//!   or explicit close clears it for good
//!
//! Timed reads run against their own deadline. When the deadline fires the
//! read future is dropped in place; whatever bytes already arrived stay in
//! the connection buffer, so the next read resumes at the exact stream
//! position.

use bytes::{Bytes, BytesMut};
use socket2::SockRef;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Network error: {0}")]
    Network(#[from] io::Error),
    #[error("I/O timeout")]
    Timeout,
    #[error("Connection is not usable")]
    Unusable,
    #[error("Connection closed by remote")]
    Eof,
}

/// Read side of the socket together with the bytes received but not yet consumed
struct ReadState {
    stream: OwnedReadHalf,
    buffer: BytesMut,
}

/// A duplex byte stream to one remote node
pub struct Connection {
    /// Remote endpoint as dialed or accepted
    remote: String,
    /// Local endpoint of the socket
    local_id: String,
    reader: Mutex<ReadState>,
    writer: Mutex<OwnedWriteHalf>,
    /// Default deadline for reads, in milliseconds (0 = none)
    read_timeout_ms: AtomicU64,
    usable: AtomicBool,
    /// Flips to true once on close; wakes pending reads and writes
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Dial a remote endpoint with TCP keep-alive enabled
    pub async fn dial(address: &str, connect_timeout: Duration) -> Result<Self, ConnectionError> {
        let stream = tokio::time::timeout(connect_timeout, connect_any(address))
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        log::debug!("Connected to {}", address);
        Self::from_stream(stream, address.to_string())
    }

    /// Wrap a socket produced by the accept loop, turning keep-alive on
    pub fn wrap(stream: TcpStream) -> Result<Self, ConnectionError> {
        SockRef::from(&stream).set_keepalive(true)?;
        let remote = stream.peer_addr()?.to_string();
        Self::from_stream(stream, remote)
    }

    fn from_stream(stream: TcpStream, remote: String) -> Result<Self, ConnectionError> {
        stream.set_nodelay(true)?;
        let local_id = stream.local_addr()?.to_string();
        let (read, write) = stream.into_split();
        let (closed, _) = watch::channel(false);

        Ok(Self {
            remote,
            local_id,
            reader: Mutex::new(ReadState {
                stream: read,
                buffer: BytesMut::with_capacity(4096),
            }),
            writer: Mutex::new(write),
            read_timeout_ms: AtomicU64::new(0),
            usable: AtomicBool::new(true),
            closed,
        })
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn is_usable(&self) -> bool {
        self.usable.load(Ordering::Acquire)
    }

    /// Set the deadline applied to reads that do not pass their own
    pub fn set_read_timeout(&self, timeout: Duration) {
        self.read_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.load(Ordering::Acquire))
    }

    /// Send every byte of `data`, or fail and latch the connection unusable
    pub async fn send_data(&self, data: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_usable()?;
        let mut closed = self.closed.subscribe();

        tokio::select! {
            res = self.write_locked(data) => res,
            _ = wait_closed(&mut closed) => Err(ConnectionError::Unusable),
        }
    }

    /// Read exactly `size` bytes.
    ///
    /// `timeout` of zero falls back to the connection's read timeout; if that
    /// is zero as well the read waits until data arrives or the socket dies.
    pub async fn read_data(&self, size: usize, timeout: Duration) -> Result<Bytes, ConnectionError> {
        self.ensure_usable()?;

        let timeout = if timeout.is_zero() {
            self.read_timeout()
        } else {
            timeout
        };
        let mut closed = self.closed.subscribe();

        let read = async {
            if timeout.is_zero() {
                self.fill(size).await
            } else {
                tokio::time::timeout_at(Instant::now() + timeout, self.fill(size))
                    .await
                    .unwrap_or(Err(ConnectionError::Timeout))
            }
        };

        tokio::select! {
            res = read => res,
            _ = wait_closed(&mut closed) => Err(ConnectionError::Unusable),
        }
    }

    async fn write_locked(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let mut writer = self.writer.lock().await;
        self.ensure_usable()?;

        let mut written = 0;
        while written < data.len() {
            match writer.write(&data[written..]).await {
                Ok(0) => {
                    self.mark_unusable();
                    return Err(ConnectionError::Eof);
                }
                Ok(n) => written += n,
                Err(e) => {
                    self.mark_unusable();
                    return Err(e.into());
                }
            }
        }

        writer.flush().await.map_err(|e| {
            self.mark_unusable();
            ConnectionError::from(e)
        })
    }

    /// Buffer until `size` bytes are available, then split them off.
    ///
    /// Cancel safe: `read_buf` only appends to the shared buffer, so dropping
    /// this future loses nothing.
    async fn fill(&self, size: usize) -> Result<Bytes, ConnectionError> {
        let mut state = self.reader.lock().await;
        let ReadState { stream, buffer } = &mut *state;

        if buffer.len() < size {
            buffer.reserve(size - buffer.len());
        }

        while buffer.len() < size {
            match stream.read_buf(buffer).await {
                Ok(0) => {
                    self.mark_unusable();
                    return Err(ConnectionError::Eof);
                }
                Ok(_) => {}
                Err(e) => {
                    self.mark_unusable();
                    return Err(e.into());
                }
            }
        }

        Ok(buffer.split_to(size).freeze())
    }

    /// Close the socket. Safe to call any number of times.
    pub async fn close(&self) {
        let was_usable = self.usable.swap(false, Ordering::AcqRel);
        self.closed.send_replace(true);

        // Pending writers bail out on the closed signal, so this lock is short.
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            if was_usable {
                log::debug!("Shutdown of {} failed: {}", self.remote, e);
            }
        }
    }

    fn ensure_usable(&self) -> Result<(), ConnectionError> {
        if self.is_usable() {
            Ok(())
        } else {
            Err(ConnectionError::Unusable)
        }
    }

    fn mark_unusable(&self) {
        if self.usable.swap(false, Ordering::AcqRel) {
            log::debug!("Connection to {} is no longer usable", self.remote);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("local_id", &self.local_id)
            .field("usable", &self.is_usable())
            .finish()
    }
}

/// Try every resolved address in turn, with keep-alive probing on
async fn connect_any(address: &str) -> io::Result<TcpStream> {
    let mut last_err = None;

    for addr in lookup_host(address).await? {
        match connect_keepalive(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("could not resolve {}", address),
        )
    }))
}

async fn connect_keepalive(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    socket.connect(addr).await
}

/// Resolve once the flag behind `rx` is set (or its sender is gone)
pub(crate) async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
