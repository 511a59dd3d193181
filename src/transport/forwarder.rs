//! Connection forwarding
//!
//! Besides serving in-process, the binary can act as a dumb relay to a
//! shared backend instance: every editor process talks to its own `langd`,
//! but all of them converge on one engine holding one session. The relay
//! never interprets payloads, it just moves bytes both ways.
//!
//! In `SeparateProcess` mode the backend is spawned on demand from the
//! current executable, with [`RUN_AS_SERVER_ENV`] set so the child knows to
//! run the engine loop instead of re-entering normal CLI handling. The
//! socket is probed before each spawn, so one backend is reused across
//! forwarder instances.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::error::{EngineError, Result};

/// Environment marker telling a spawned child to run as the backend engine.
pub const RUN_AS_SERVER_ENV: &str = "_LANGD_RUN_AS_SERVER";

/// How long a forwarder waits for a freshly spawned backend to come up.
const SPAWN_DEADLINE: Duration = Duration::from_secs(10);

/// A network endpoint, written `tcp;host:port` or `unix;/path/to.sock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl Address {
    /// Parse an address literal.
    ///
    /// Panics on malformed input: addresses reach this point as
    /// caller-supplied constants, so a bad one is a bug, not a runtime
    /// condition to recover from.
    pub fn parse(s: &str) -> Address {
        match s.split_once(';') {
            Some(("tcp", addr)) if !addr.is_empty() => Address::Tcp(addr.to_string()),
            #[cfg(unix)]
            Some(("unix", path)) if !path.is_empty() => Address::Unix(PathBuf::from(path)),
            _ => panic!("malformed address {s:?}, want tcp;host:port or unix;/path"),
        }
    }

    pub async fn connect(&self) -> Result<Stream> {
        match self {
            Address::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(|e| {
                    EngineError::Transport(format!("connecting to tcp;{addr}: {e}"))
                })?;
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    EngineError::Transport(format!("connecting to unix;{}: {e}", path.display()))
                })?;
                Ok(Stream::Unix(stream))
            }
        }
    }

    pub async fn bind(&self) -> Result<Listener> {
        match self {
            Address::Tcp(addr) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| EngineError::Transport(format!("binding tcp;{addr}: {e}")))?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                // A stale socket file from a dead backend would block the bind.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path).map_err(|e| {
                    EngineError::Transport(format!("binding unix;{}: {e}", path.display()))
                })?;
                Ok(Listener::Unix(listener))
            }
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Tcp(addr) => write!(f, "tcp;{addr}"),
            #[cfg(unix)]
            Address::Unix(path) => write!(f, "unix;{}", path.display()),
        }
    }
}

/// A bound server endpoint.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    pub async fn accept(&self) -> Result<Stream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener
                    .accept()
                    .await
                    .map_err(|e| EngineError::Transport(format!("accepting connection: {e}")))?;
                tracing::debug!(%peer, "accepted tcp connection");
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, _) = listener
                    .accept()
                    .await
                    .map_err(|e| EngineError::Transport(format!("accepting connection: {e}")))?;
                tracing::debug!("accepted unix connection");
                Ok(Stream::Unix(stream))
            }
        }
    }

    /// The address actually bound, useful when binding port 0 in tests.
    pub fn local_address(&self) -> Result<Address> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener
                    .local_addr()
                    .map_err(|e| EngineError::Transport(e.to_string()))?;
                Ok(Address::Tcp(addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let addr = listener
                    .local_addr()
                    .map_err(|e| EngineError::Transport(e.to_string()))?;
                let path = addr
                    .as_pathname()
                    .ok_or_else(|| EngineError::Transport("unnamed unix socket".to_string()))?;
                Ok(Address::Unix(path.to_path_buf()))
            }
        }
    }
}

/// One accepted or dialed connection.
pub enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(unix)]
            Stream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Where the engine actually runs relative to this process.
#[derive(Debug, Clone)]
pub enum ExecutionMode {
    /// In-process engine, no network hop.
    Singleton,
    /// Relay to an already-running backend at a fixed address.
    Forwarded { backend: Address },
    /// Relay to a backend process spawned on demand behind a unix socket.
    #[cfg(unix)]
    SeparateProcess { socket: PathBuf },
}

/// Relays one client connection to the shared backend.
pub struct Forwarder {
    backend: Address,
    /// Set in `SeparateProcess` mode; absent means never spawn.
    spawn_socket: Option<PathBuf>,
    spawn_guard: tokio::sync::Mutex<()>,
}

impl Forwarder {
    pub fn new(mode: &ExecutionMode) -> Option<Forwarder> {
        match mode {
            ExecutionMode::Singleton => None,
            ExecutionMode::Forwarded { backend } => Some(Forwarder {
                backend: backend.clone(),
                spawn_socket: None,
                spawn_guard: tokio::sync::Mutex::new(()),
            }),
            #[cfg(unix)]
            ExecutionMode::SeparateProcess { socket } => Some(Forwarder {
                backend: Address::Unix(socket.clone()),
                spawn_socket: Some(socket.clone()),
                spawn_guard: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Relay bytes between `client` and the backend until either side
    /// closes. Spawns the backend first if this forwarder owns one and it
    /// is not running yet.
    pub async fn relay(&self, mut client: Stream) -> Result<()> {
        let mut backend = self.obtain_backend().await?;
        tokio::io::copy_bidirectional(&mut client, &mut backend)
            .await
            .map_err(|e| EngineError::Transport(format!("relaying to {}: {e}", self.backend)))?;
        Ok(())
    }

    /// Relay this process's stdin/stdout to the backend. Ends when either
    /// side closes its half.
    pub async fn relay_stdio(&self) -> Result<()> {
        let backend = self.obtain_backend().await?;
        let (mut from_backend, mut to_backend) = tokio::io::split(backend);
        let mut stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        tokio::select! {
            r = tokio::io::copy(&mut stdin, &mut to_backend) => {
                r.map_err(|e| EngineError::Transport(format!("relaying stdin: {e}")))?;
            }
            r = tokio::io::copy(&mut from_backend, &mut stdout) => {
                r.map_err(|e| EngineError::Transport(format!("relaying stdout: {e}")))?;
            }
        }
        Ok(())
    }

    async fn obtain_backend(&self) -> Result<Stream> {
        if let Ok(stream) = self.backend.connect().await {
            return Ok(stream);
        }
        let Some(socket) = &self.spawn_socket else {
            // Forwarded mode never starts the backend itself.
            return self.backend.connect().await;
        };

        // One spawn at a time; losers of the race reuse the winner's backend.
        let _guard = self.spawn_guard.lock().await;
        if let Ok(stream) = self.backend.connect().await {
            return Ok(stream);
        }
        spawn_backend(socket)?;
        let deadline = tokio::time::Instant::now() + SPAWN_DEADLINE;
        loop {
            match self.backend.connect().await {
                Ok(stream) => return Ok(stream),
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    return Err(EngineError::Transport(format!(
                        "backend did not come up at {}: {e}",
                        self.backend
                    )));
                }
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    }
}

/// Start the backend engine as a child of this process, listening on
/// `socket`. The child outlives us; every later forwarder reuses it.
fn spawn_backend(socket: &Path) -> Result<()> {
    let exe = std::env::current_exe()
        .map_err(|e| EngineError::Transport(format!("resolving current executable: {e}")))?;
    tracing::info!(socket = %socket.display(), "spawning backend engine");
    std::process::Command::new(exe)
        .arg("serve")
        .arg("--listen")
        .arg(format!("unix;{}", socket.display()))
        .env(RUN_AS_SERVER_ENV, "1")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| EngineError::Transport(format!("spawning backend: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_address_parsing() {
        assert_eq!(
            Address::parse("tcp;127.0.0.1:4389"),
            Address::Tcp("127.0.0.1:4389".to_string())
        );
        assert_eq!(
            Address::parse("unix;/tmp/langd.sock"),
            Address::Unix(PathBuf::from("/tmp/langd.sock"))
        );
    }

    #[test]
    #[should_panic(expected = "malformed address")]
    fn test_malformed_address_panics() {
        Address::parse("udp;127.0.0.1:1");
    }

    #[test]
    #[should_panic(expected = "malformed address")]
    fn test_empty_address_panics() {
        Address::parse("tcp;");
    }

    #[tokio::test]
    async fn test_forwarder_relays_bytes_verbatim() {
        // Echo backend.
        let backend = Address::Tcp("127.0.0.1:0".to_string()).bind().await.unwrap();
        let backend_addr = backend.local_address().unwrap();
        tokio::spawn(async move {
            let mut stream = backend.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                stream.write_all(&buf[..n]).await.unwrap();
            }
        });

        // Forwarder front door.
        let front = Address::Tcp("127.0.0.1:0".to_string()).bind().await.unwrap();
        let front_addr = front.local_address().unwrap();
        tokio::spawn(async move {
            let forwarder = Forwarder::new(&ExecutionMode::Forwarded {
                backend: backend_addr,
            })
            .unwrap();
            let client = front.accept().await.unwrap();
            forwarder.relay(client).await.unwrap();
        });

        let mut client = front_addr.connect().await.unwrap();
        client.write_all(b"Content-Length: 2\r\n\r\n{}").await.unwrap();
        let mut echoed = vec![0u8; 23];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"Content-Length: 2\r\n\r\n{}");
    }

    #[test]
    fn test_singleton_has_no_forwarder() {
        assert!(Forwarder::new(&ExecutionMode::Singleton).is_none());
    }
}
