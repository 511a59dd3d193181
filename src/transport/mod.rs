//! Transport layer
//!
//! Accepts editor connections over stdio, TCP, or a unix socket. Stdio
//! serves a single connection owning its own session. A listening socket
//! serves any number of connections multiplexed onto one shared session and
//! pipeline, so every editor sees the same workspace state; diagnostics and
//! progress fan out to all live connections. Outbound traffic is funneled
//! through an unbounded channel so background tasks can send without
//! holding the writer.

pub mod codec;
pub mod forwarder;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::config::EngineOptions;
use crate::error::Result;
use crate::protocol;
use crate::server::diagnostics::{ConflictMarkerDiagnoser, DiagnosticScheduler, Diagnoser};
use crate::server::pipeline::ModificationPipeline;
use crate::server::{Client, ProgressEvent, Server};
use crate::session::Session;

use codec::{FrameReader, FrameWriter, MessageLog};
use forwarder::Address;

/// How long a closing connection waits for in-flight diagnosis to publish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Where to accept editor connections.
#[derive(Debug, Clone)]
pub enum ListenMode {
    /// Single connection over this process's stdin/stdout.
    Stdio,
    /// Accept any number of connections on a bound socket.
    Socket(Address),
}

impl ListenMode {
    /// Parse a `--listen` value. Panics on a malformed socket address, same
    /// as [`Address::parse`].
    pub fn parse(s: &str) -> ListenMode {
        if s == "stdio" {
            ListenMode::Stdio
        } else {
            ListenMode::Socket(Address::parse(s))
        }
    }
}

fn diagnostics_frame(params: protocol::PublishDiagnosticsParams) -> Option<Value> {
    match serde_json::to_value(&params) {
        Ok(value) => Some(protocol::notification(
            "textDocument/publishDiagnostics",
            value,
        )),
        Err(e) => {
            tracing::error!("encoding diagnostics for {}: {e}", params.uri);
            None
        }
    }
}

fn show_message_frame(kind: protocol::MessageType, message: &str) -> Value {
    protocol::notification(
        "window/showMessage",
        json!({ "type": u8::from(kind), "message": message }),
    )
}

fn progress_frame(event: ProgressEvent) -> Value {
    let params = match event {
        ProgressEvent::Begin { token, title } => json!({
            "token": token,
            "value": { "kind": "begin", "title": title },
        }),
        ProgressEvent::End { token, message } => json!({
            "token": token,
            "value": { "kind": "end", "message": message },
        }),
    };
    protocol::notification("$/progress", params)
}

/// Sends server-initiated messages down one connection's outbound channel.
struct ConnectionClient {
    outbound: mpsc::UnboundedSender<Value>,
}

impl ConnectionClient {
    fn send(&self, frame: Value) {
        // A closed channel means the connection is going away; drop quietly.
        let _ = self.outbound.send(frame);
    }
}

impl Client for ConnectionClient {
    fn publish_diagnostics(&self, params: protocol::PublishDiagnosticsParams) {
        if let Some(frame) = diagnostics_frame(params) {
            self.send(frame);
        }
    }

    fn show_message(&self, kind: protocol::MessageType, message: &str) {
        self.send(show_message_frame(kind, message));
    }

    fn progress(&self, event: ProgressEvent) {
        self.send(progress_frame(event));
    }
}

/// Fans server-initiated messages out to every live connection on a shared
/// session. Holds only weak senders so a closing connection's channel can
/// drain and shut; dead entries are pruned on the next send.
#[derive(Default)]
struct BroadcastClient {
    conns: Mutex<Vec<mpsc::WeakUnboundedSender<Value>>>,
}

impl BroadcastClient {
    fn register(&self, tx: &mpsc::UnboundedSender<Value>) {
        self.conns.lock().push(tx.downgrade());
    }

    fn send(&self, frame: Value) {
        self.conns.lock().retain(|weak| match weak.upgrade() {
            Some(tx) => tx.send(frame.clone()).is_ok(),
            None => false,
        });
    }
}

impl Client for BroadcastClient {
    fn publish_diagnostics(&self, params: protocol::PublishDiagnosticsParams) {
        if let Some(frame) = diagnostics_frame(params) {
            self.send(frame);
        }
    }

    fn show_message(&self, kind: protocol::MessageType, message: &str) {
        self.send(show_message_frame(kind, message));
    }

    fn progress(&self, event: ProgressEvent) {
        self.send(progress_frame(event));
    }
}

/// Everything a connection needs beyond its byte stream.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub options: EngineOptions,
    /// Record every frame for post-hoc inspection.
    pub rpc_log: Option<MessageLog>,
    /// Start a native file watcher on this root.
    pub watch_root: Option<std::path::PathBuf>,
    /// Analysis pass run over each new snapshot.
    pub diagnoser: Arc<dyn Diagnoser>,
}

impl ConnectionConfig {
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            rpc_log: None,
            watch_root: None,
            diagnoser: Arc::new(ConflictMarkerDiagnoser),
        }
    }
}

/// One session and pipeline shared by every connection on a socket.
struct SharedBackend {
    session: Arc<Session>,
    pipeline: ModificationPipeline,
    clients: Arc<BroadcastClient>,
}

impl SharedBackend {
    fn new(config: &ConnectionConfig) -> Self {
        let clients = Arc::new(BroadcastClient::default());
        let client: Arc<dyn Client> = clients.clone();
        let session = Arc::new(Session::new(config.options.clone()));
        let scheduler =
            DiagnosticScheduler::new(Arc::clone(&client), Arc::clone(&config.diagnoser));
        let pipeline =
            ModificationPipeline::new(Arc::clone(&session), scheduler, Arc::clone(&client));
        Self {
            session,
            pipeline,
            clients,
        }
    }

    /// Attach one connection to the shared session. Broadcast traffic and
    /// this connection's own replies share the outbound channel.
    async fn attach<R, W>(&self, reader: R, writer: W, rpc_log: Option<MessageLog>) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Value>();
        self.clients.register(&outbound);
        let client: Arc<dyn Client> = Arc::new(ConnectionClient {
            outbound: outbound.clone(),
        });
        let server = Server::attached(
            Arc::clone(&self.session),
            self.pipeline.clone(),
            client,
        );
        drive(reader, writer, rpc_log, server, outbound, outbound_rx).await
    }
}

/// Serve until the listener fails or, for stdio, the single connection ends.
pub async fn run(mode: ListenMode, config: ConnectionConfig) -> Result<()> {
    match mode {
        ListenMode::Stdio => {
            tracing::info!("serving on stdio");
            serve_connection(tokio::io::stdin(), tokio::io::stdout(), config).await
        }
        ListenMode::Socket(address) => {
            let backend = Arc::new(SharedBackend::new(&config));
            let _watcher = match &config.watch_root {
                Some(root) => Some(crate::watcher::FileWatcher::start(
                    root.clone(),
                    backend.pipeline.clone(),
                )?),
                None => None,
            };
            let listener = address.bind().await?;
            tracing::info!(address = %address, "serving");
            loop {
                let stream = listener.accept().await?;
                let backend = Arc::clone(&backend);
                let rpc_log = config.rpc_log.clone();
                tokio::spawn(async move {
                    let (reader, writer) = tokio::io::split(stream);
                    if let Err(e) = backend.attach(reader, writer, rpc_log).await {
                        tracing::error!("connection ended with error: {e}");
                    }
                });
            }
        }
    }
}

/// Run one connection with its own session to completion.
pub async fn serve_connection<R, W>(reader: R, writer: W, config: ConnectionConfig) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, outbound_rx) = mpsc::unbounded_channel::<Value>();
    let client: Arc<dyn Client> = Arc::new(ConnectionClient {
        outbound: outbound.clone(),
    });
    let session = Arc::new(Session::new(config.options.clone()));
    let server = Server::new(session, client, Arc::clone(&config.diagnoser));

    let _watcher = match &config.watch_root {
        Some(root) => Some(crate::watcher::FileWatcher::start(
            root.clone(),
            server.pipeline().clone(),
        )?),
        None => None,
    };

    drive(reader, writer, config.rpc_log, server, outbound, outbound_rx).await
}

/// Read frames, dispatch, write replies and server-initiated notifications
/// until the stream closes or the client exits, then tear down in order:
/// grace period for in-flight diagnosis, session shutdown (when owned),
/// writer drain.
async fn drive<R, W>(
    reader: R,
    writer: W,
    rpc_log: Option<MessageLog>,
    server: Server,
    outbound: mpsc::UnboundedSender<Value>,
    mut outbound_rx: mpsc::UnboundedReceiver<Value>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut frames = FrameReader::new(reader);
    let mut sink = FrameWriter::new(writer);
    if let Some(log) = rpc_log {
        frames = frames.with_log(log.clone());
        sink = sink.with_log(log);
    }

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = sink.write_frame(&frame).await {
                tracing::error!("writing outbound frame: {e}");
                break;
            }
        }
    });

    let result = loop {
        match frames.read_frame().await {
            Ok(Some(frame)) => {
                if let Some(response) = server.handle(frame) {
                    let _ = outbound.send(response);
                }
                if server.exited() {
                    break Ok(());
                }
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        }
    };

    // Give diagnosis of the last applied batch a bounded window to publish
    // before the connection goes away.
    if let Some(last) = server.pipeline().last_batch() {
        if tokio::time::timeout(SHUTDOWN_GRACE, last.wait())
            .await
            .is_err()
        {
            tracing::warn!("closing with diagnosis still in flight");
        }
    }
    if server.owns_session() {
        server.session().shutdown();
    }
    drop(outbound);
    let _ = writer_task.await;
    result
}
