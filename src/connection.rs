//! Byte-stream connections a [`Streamer`](crate::rpc::Streamer) attaches to.
//!
//! A connection hands out its incoming and outgoing streams once each and
//! keeps enough of the underlying resource to close it afterwards.
//!
//! - [`TcpConnection`]: `nvim --listen 127.0.0.1:6666`
//! - [`UnixConnection`]: `nvim --listen /tmp/nvim.sock` (the usual case)
//! - [`ChildConnection`]: a spawned `nvim --embed` over its stdio
//! - [`StdioConnection`]: this process's own stdio, when Neovim spawned us
//! - [`StreamConnection`]: any reader/writer pair (tests, custom transports)

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::rpc::{BoxReader, BoxWriter};

/// A duplex byte stream owned by the caller.
#[async_trait]
pub trait Connection: Send {
    /// Takes the stream frames are read from. Fails if already taken.
    fn incoming_stream(&mut self) -> io::Result<BoxReader>;

    /// Takes the stream frames are written to. Fails if already taken.
    fn outgoing_stream(&mut self) -> io::Result<BoxWriter>;

    /// Closes the underlying resource. Streams already handed out observe
    /// end of stream or write errors.
    async fn close(&mut self) -> io::Result<()>;
}

fn taken(which: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Other,
        format!("{which} stream already taken"),
    )
}

/// Wraps an arbitrary reader/writer pair.
pub struct StreamConnection {
    reader: Option<BoxReader>,
    writer: Option<BoxWriter>,
}

impl StreamConnection {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
        }
    }
}

#[async_trait]
impl Connection for StreamConnection {
    fn incoming_stream(&mut self) -> io::Result<BoxReader> {
        self.reader.take().ok_or_else(|| taken("incoming"))
    }

    fn outgoing_stream(&mut self) -> io::Result<BoxWriter> {
        self.writer.take().ok_or_else(|| taken("outgoing"))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

/// A TCP socket.
pub struct TcpConnection {
    streams: StreamConnection,
    control: std::net::TcpStream,
}

impl TcpConnection {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> io::Result<Self> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        // Keep a clone of the socket so close() works after the halves are handed out.
        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        let (reader, writer) = tokio::net::TcpStream::from_std(std_stream)?.into_split();

        Ok(Self {
            streams: StreamConnection::new(reader, writer),
            control,
        })
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.control.peer_addr()
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn incoming_stream(&mut self) -> io::Result<BoxReader> {
        self.streams.incoming_stream()
    }

    fn outgoing_stream(&mut self) -> io::Result<BoxWriter> {
        self.streams.outgoing_stream()
    }

    async fn close(&mut self) -> io::Result<()> {
        self.streams.close().await?;
        match self.control.shutdown(std::net::Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// A Unix domain socket, as created by `nvim --listen <path>`.
#[cfg(unix)]
pub struct UnixConnection {
    streams: StreamConnection,
    control: std::os::unix::net::UnixStream,
    path: PathBuf,
}

#[cfg(unix)]
impl UnixConnection {
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = tokio::net::UnixStream::connect(&path).await?;

        let std_stream = stream.into_std()?;
        let control = std_stream.try_clone()?;
        let (reader, writer) = tokio::net::UnixStream::from_std(std_stream)?.into_split();

        Ok(Self {
            streams: StreamConnection::new(reader, writer),
            control,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
#[async_trait]
impl Connection for UnixConnection {
    fn incoming_stream(&mut self) -> io::Result<BoxReader> {
        self.streams.incoming_stream()
    }

    fn outgoing_stream(&mut self) -> io::Result<BoxWriter> {
        self.streams.outgoing_stream()
    }

    async fn close(&mut self) -> io::Result<()> {
        self.streams.close().await?;
        match self.control.shutdown(std::net::Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }
}

/// A child process spoken to over its stdin/stdout.
pub struct ChildConnection {
    streams: StreamConnection,
    child: Child,
}

impl ChildConnection {
    /// Spawns `program` with piped stdin/stdout. Stderr is inherited. The
    /// child is killed when the connection is dropped.
    pub fn spawn<I, S>(program: impl AsRef<std::ffi::OsStr>, args: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| taken("child stdout"))?;
        let stdin = child.stdin.take().ok_or_else(|| taken("child stdin"))?;
        tracing::debug!(pid = ?child.id(), "Spawned child process");

        Ok(Self {
            streams: StreamConnection::new(stdout, stdin),
            child,
        })
    }

    /// Spawns a headless, embedded Neovim.
    pub fn embed(nvim_path: impl AsRef<std::ffi::OsStr>) -> io::Result<Self> {
        Self::spawn(nvim_path, ["--embed", "--headless"])
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

#[async_trait]
impl Connection for ChildConnection {
    fn incoming_stream(&mut self) -> io::Result<BoxReader> {
        self.streams.incoming_stream()
    }

    fn outgoing_stream(&mut self) -> io::Result<BoxWriter> {
        self.streams.outgoing_stream()
    }

    async fn close(&mut self) -> io::Result<()> {
        self.streams.close().await?;
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        Ok(())
    }
}

/// This process's own stdin/stdout, for when Neovim started us as an RPC
/// job (`jobstart(..., {'rpc': v:true})`). Nothing else may write to stdout.
pub struct StdioConnection {
    streams: StreamConnection,
}

impl Default for StdioConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl StdioConnection {
    pub fn new() -> Self {
        Self {
            streams: StreamConnection::new(tokio::io::stdin(), tokio::io::stdout()),
        }
    }
}

#[async_trait]
impl Connection for StdioConnection {
    fn incoming_stream(&mut self) -> io::Result<BoxReader> {
        self.streams.incoming_stream()
    }

    fn outgoing_stream(&mut self) -> io::Result<BoxWriter> {
        self.streams.outgoing_stream()
    }

    async fn close(&mut self) -> io::Result<()> {
        self.streams.close().await
    }
}

/// Where a running Neovim listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// Unix domain socket path.
    Unix(PathBuf),
    /// `host:port`.
    Tcp(String),
}

impl Address {
    /// Interprets `s` as `host:port` when it ends in a numeric port and
    /// contains no path separator, otherwise as a socket path.
    pub fn parse(s: &str) -> Self {
        let looks_like_path = s.contains('/') || s.contains('\\');
        match s.rsplit_once(':') {
            Some((host, port))
                if !looks_like_path && !host.is_empty() && port.parse::<u16>().is_ok() =>
            {
                Self::Tcp(s.to_string())
            }
            _ => Self::Unix(PathBuf::from(s)),
        }
    }

    /// Finds a running Neovim without configuration.
    ///
    /// Checks `$NVIM` (set by Neovim for processes it starts), then
    /// `.nvim/nvim.sock` in the current directory.
    pub fn discover() -> Option<Self> {
        if let Some(addr) = std::env::var("NVIM").ok().filter(|s| !s.is_empty()) {
            tracing::debug!(address = %addr, "Using $NVIM");
            return Some(Self::parse(&addr));
        }

        let cwd = std::env::current_dir().ok()?;
        let socket_path = cwd.join(".nvim").join("nvim.sock");
        tracing::debug!(socket = %socket_path.display(), "Looking for nvim socket");
        if socket_path.exists() {
            return Some(Self::Unix(socket_path));
        }

        tracing::debug!("Socket file does not exist");
        None
    }

    /// Opens a connection to this address.
    pub async fn connect(&self) -> io::Result<Box<dyn Connection>> {
        match self {
            Self::Tcp(addr) => Ok(Box::new(TcpConnection::connect(addr.as_str()).await?)),
            #[cfg(unix)]
            Self::Unix(path) => Ok(Box::new(UnixConnection::connect(path).await?)),
            #[cfg(not(unix))]
            Self::Unix(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unix sockets are not supported here: {}", path.display()),
            )),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => f.write_str(addr),
        }
    }
}
