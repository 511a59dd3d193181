//! Language server front end
//!
//! Translates JSON-RPC traffic into session operations. Notifications about
//! document and workspace changes become modification batches submitted to
//! the [`ModificationPipeline`]; the one custom request, `langd/fileSnapshot`,
//! reads whatever snapshot is current without waiting for in-flight writes.
//!
//! The server never pushes data to the client directly. Everything outbound
//! goes through the [`Client`] trait, which the transport layer implements
//! over the connection and tests implement with a recorder.

pub mod diagnostics;
pub mod latch;
pub mod pipeline;
pub mod text;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::file::{FileAction, Modification, ModificationSource};
use crate::protocol::{
    self, DidChangeParams, DidChangeWatchedFilesParams, DidCloseParams, DidOpenParams,
    DidSaveParams, FileChangeType, Incoming, MessageType, RequestId, TextDocumentIdentifier,
};
use crate::session::Session;
use crate::uri::Uri;

use diagnostics::{DiagnosticScheduler, Diagnoser};
use latch::Latch;
use pipeline::ModificationPipeline;

/// Work-in-progress reporting, sent when verbose progress is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Begin { token: String, title: String },
    End { token: String, message: String },
}

/// Outbound channel to the editor. Implementations must not block.
pub trait Client: Send + Sync + 'static {
    fn publish_diagnostics(&self, params: protocol::PublishDiagnosticsParams);
    fn show_message(&self, kind: MessageType, message: &str);
    fn progress(&self, event: ProgressEvent);
}

/// One server instance bound to one client connection.
pub struct Server {
    session: Arc<Session>,
    pipeline: ModificationPipeline,
    client: Arc<dyn Client>,
    /// Whether this connection's exit tears the session down. False for
    /// servers attached to a session shared with other connections.
    owns_session: bool,
    /// Generated files already warned about, one warning per file.
    warned_generated: Mutex<HashSet<Uri>>,
    exited: Mutex<bool>,
}

impl Server {
    pub fn new(
        session: Arc<Session>,
        client: Arc<dyn Client>,
        diagnoser: Arc<dyn Diagnoser>,
    ) -> Self {
        let scheduler = DiagnosticScheduler::new(Arc::clone(&client), diagnoser);
        let pipeline = ModificationPipeline::new(
            Arc::clone(&session),
            scheduler,
            Arc::clone(&client),
        );
        Self {
            session,
            pipeline,
            client,
            owns_session: true,
            warned_generated: Mutex::new(HashSet::new()),
            exited: Mutex::new(false),
        }
    }

    /// A server attached to a session and pipeline shared with other
    /// connections. Its `exit` closes only this connection; the session
    /// keeps running for everyone else.
    pub fn attached(
        session: Arc<Session>,
        pipeline: ModificationPipeline,
        client: Arc<dyn Client>,
    ) -> Self {
        Self {
            session,
            pipeline,
            client,
            owns_session: false,
            warned_generated: Mutex::new(HashSet::new()),
            exited: Mutex::new(false),
        }
    }

    pub fn owns_session(&self) -> bool {
        self.owns_session
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn pipeline(&self) -> &ModificationPipeline {
        &self.pipeline
    }

    /// True once an `exit` notification has been handled; the transport
    /// closes the connection when it sees this.
    pub fn exited(&self) -> bool {
        *self.exited.lock()
    }

    /// Dispatch one incoming message. Returns the response to send for
    /// requests, `None` for notifications and responses.
    pub fn handle(&self, raw: Value) -> Option<Value> {
        match Incoming::from_value(raw) {
            Some(Incoming::Request { id, method, params }) => {
                Some(self.handle_request(&id, &method, params))
            }
            Some(Incoming::Notification { method, params }) => {
                if let Err(e) = self.handle_notification(&method, params) {
                    tracing::error!(method, "handling notification: {e}");
                }
                None
            }
            Some(Incoming::Response { .. }) => None,
            None => {
                tracing::warn!("discarding malformed message");
                None
            }
        }
    }

    fn handle_request(&self, id: &RequestId, method: &str, params: Value) -> Value {
        let result = match method {
            "initialize" => Ok(initialize_result()),
            "shutdown" => {
                if self.owns_session {
                    self.session.begin_shutdown();
                }
                Ok(Value::Null)
            }
            "langd/fileSnapshot" => parse(params).and_then(|p| self.file_snapshot(p)),
            _ => {
                return protocol::error_response(
                    id,
                    protocol::METHOD_NOT_FOUND,
                    &format!("unhandled method {method}"),
                );
            }
        };
        match result {
            Ok(value) => protocol::response(id, value),
            Err(e) => {
                let code = match e {
                    EngineError::InvalidEdit { .. } | EngineError::NoViewFound { .. } => {
                        protocol::INVALID_PARAMS
                    }
                    _ => protocol::INTERNAL_ERROR,
                };
                protocol::error_response(id, code, &e.to_string())
            }
        }
    }

    fn handle_notification(&self, method: &str, params: Value) -> Result<()> {
        match method {
            "initialized" => Ok(()),
            "exit" => {
                if self.owns_session {
                    self.session.shutdown();
                }
                *self.exited.lock() = true;
                Ok(())
            }
            "textDocument/didOpen" => self.did_open(parse(params)?).map(drop),
            "textDocument/didChange" => self.did_change(parse(params)?).map(drop),
            "textDocument/didSave" => self.did_save(parse(params)?).map(drop),
            "textDocument/didClose" => self.did_close(parse(params)?).map(drop),
            "workspace/didChangeWatchedFiles" => {
                self.did_change_watched_files(parse(params)?).map(drop)
            }
            other => {
                tracing::debug!(method = other, "ignoring notification");
                Ok(())
            }
        }
    }

    /// Open a document, registering a view for its folder when no existing
    /// view contains it.
    pub fn did_open(&self, params: DidOpenParams) -> Result<Latch> {
        let doc = params.text_document;
        if self.session.view_of(&doc.uri).is_err() {
            let root = folder_of(&doc.uri)?;
            let name = root
                .to_path()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| root.to_string());
            self.session.create_view(&name, root)?;
        }
        self.pipeline.submit(
            vec![Modification {
                uri: doc.uri,
                action: FileAction::Open,
                version: doc.version,
                text: Some(doc.text),
                language_id: Some(doc.language_id),
                on_disk: false,
            }],
            ModificationSource::DidOpen,
        )
    }

    /// Apply incremental edits to an open document's buffer.
    pub fn did_change(&self, params: DidChangeParams) -> Result<Latch> {
        let uri = params.text_document.uri;
        let view = self.session.view_of(&uri)?;
        let snapshot = view.snapshot();
        let handle = snapshot
            .file(&uri)
            .ok_or_else(|| EngineError::invalid_edit(format!("{uri} is not open")))?;
        let prior = handle
            .text()
            .ok_or_else(|| EngineError::invalid_edit(format!("{uri} has no buffered content")))?;

        self.warn_if_generated(&uri, prior);
        let text = text::apply_content_changes(prior, &params.content_changes)?;
        drop(snapshot);

        self.pipeline.submit(
            vec![Modification {
                uri,
                action: FileAction::Change,
                version: params.text_document.version,
                text: Some(text),
                language_id: None,
                on_disk: false,
            }],
            ModificationSource::DidChange,
        )
    }

    pub fn did_save(&self, params: DidSaveParams) -> Result<Latch> {
        self.pipeline.submit(
            vec![Modification {
                uri: params.text_document.uri,
                action: FileAction::Save,
                version: 0,
                text: params.text,
                language_id: None,
                on_disk: false,
            }],
            ModificationSource::DidSave,
        )
    }

    pub fn did_close(&self, params: DidCloseParams) -> Result<Latch> {
        self.pipeline.submit(
            vec![Modification {
                uri: params.text_document.uri,
                action: FileAction::Close,
                version: 0,
                text: None,
                language_id: None,
                on_disk: false,
            }],
            ModificationSource::DidClose,
        )
    }

    /// Forward watcher events from the client as one on-disk batch.
    pub fn did_change_watched_files(
        &self,
        params: DidChangeWatchedFilesParams,
    ) -> Result<Latch> {
        let mods: Vec<Modification> = params
            .changes
            .into_iter()
            .map(|event| {
                let action = match event.change_type {
                    FileChangeType::Created => FileAction::Create,
                    FileChangeType::Changed => FileAction::Change,
                    FileChangeType::Deleted => FileAction::Delete,
                };
                Modification::on_disk(event.uri, action)
            })
            .collect();
        self.pipeline
            .submit(mods, ModificationSource::DidChangeWatchedFiles)
    }

    /// Read-only view of one file in the owning view's current snapshot.
    /// Served even while a write is in flight; the reply describes whichever
    /// snapshot was current when it ran.
    fn file_snapshot(&self, params: TextDocumentIdentifier) -> Result<Value> {
        let view = self.session.view_of(&params.uri)?;
        let snapshot = view.snapshot();
        let handle = snapshot.file(&params.uri).ok_or_else(|| {
            EngineError::invalid_edit(format!("{} is not tracked", params.uri))
        })?;
        Ok(json!({
            "uri": handle.uri,
            "generation": snapshot.generation(),
            "version": handle.version,
            "kind": format!("{:?}", handle.kind),
            "onDisk": handle.on_disk,
            "digest": handle.digest().map(|d| d.short()),
            "text": handle.text(),
        }))
    }

    /// Warn once per file when the user edits a file that declares itself
    /// machine-generated.
    fn warn_if_generated(&self, uri: &Uri, content: &str) {
        if !looks_generated(content) {
            return;
        }
        let mut warned = self.warned_generated.lock();
        if !warned.insert(uri.clone()) {
            return;
        }
        drop(warned);
        self.client.show_message(
            MessageType::Warning,
            &format!("{uri} is a generated file; edits may be overwritten"),
        );
    }
}

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| EngineError::invalid_edit(format!("bad params: {e}")))
}

fn initialize_result() -> Value {
    json!({
        "capabilities": {
            "textDocumentSync": {
                "openClose": true,
                // Incremental sync.
                "change": 2,
                "save": { "includeText": true },
            },
        },
        "serverInfo": {
            "name": "langd",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Root for an implicitly created view: the file's containing directory.
fn folder_of(uri: &Uri) -> Result<Uri> {
    let path = uri.to_path()?;
    let dir = path.parent().ok_or_else(|| EngineError::InvalidUri {
        uri: uri.to_string(),
    })?;
    Uri::from_path(dir)
}

/// Conventional generated-file marker, looked for near the top of the file.
fn looks_generated(content: &str) -> bool {
    content
        .lines()
        .take(5)
        .any(|line| line.contains("DO NOT EDIT"))
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingClient;
    use super::*;
    use crate::config::EngineOptions;
    use crate::protocol::{ContentChange, Position, Range, TextDocumentItem, VersionedTextDocumentIdentifier};

    fn server() -> (Arc<Server>, Arc<RecordingClient>) {
        let client = Arc::new(RecordingClient::default());
        let session = Arc::new(Session::new(EngineOptions::default()));
        let server = Arc::new(Server::new(
            session,
            client.clone(),
            Arc::new(diagnostics::ConflictMarkerDiagnoser),
        ));
        (server, client)
    }

    fn open(server: &Arc<Server>, path: &str, text: &str) -> Latch {
        server
            .did_open(DidOpenParams {
                text_document: TextDocumentItem {
                    uri: Uri::from_path(std::path::Path::new(path)).unwrap(),
                    language_id: "rust".to_string(),
                    version: 1,
                    text: text.to_string(),
                },
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_did_open_registers_folder_view() {
        let (server, _client) = server();
        open(&server, "/w/src/main.rs", "fn main() {}").wait().await;

        let views = server.session().views();
        assert_eq!(views.len(), 1);
        assert!(views[0].root().to_string().ends_with("/w/src"));
        let uri = Uri::from_path(std::path::Path::new("/w/src/main.rs")).unwrap();
        let snap = views[0].snapshot();
        assert_eq!(snap.file(&uri).unwrap().text(), Some("fn main() {}"));
    }

    #[tokio::test]
    async fn test_did_change_applies_incremental_edit() {
        let (server, _client) = server();
        let uri = Uri::from_path(std::path::Path::new("/w/src/main.rs")).unwrap();
        open(&server, "/w/src/main.rs", "abc\ndef\n").wait().await;

        server
            .did_change(DidChangeParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: uri.clone(),
                    version: 2,
                },
                content_changes: vec![ContentChange {
                    range: Some(Range {
                        start: Position { line: 0, character: 0 },
                        end: Position { line: 0, character: 3 },
                    }),
                    range_length: None,
                    text: "xyz".to_string(),
                }],
            })
            .unwrap()
            .wait()
            .await;

        let view = server.session().view_of(&uri).unwrap();
        let snap = view.snapshot();
        let handle = snap.file(&uri).unwrap();
        assert_eq!(handle.text(), Some("xyz\ndef\n"));
        assert_eq!(handle.version, 2);
    }

    #[tokio::test]
    async fn test_did_change_on_unopened_file_is_invalid() {
        let (server, _client) = server();
        open(&server, "/w/src/main.rs", "fn main() {}").wait().await;

        let err = server
            .did_change(DidChangeParams {
                text_document: VersionedTextDocumentIdentifier {
                    uri: Uri::from_path(std::path::Path::new("/w/src/other.rs")).unwrap(),
                    version: 1,
                },
                content_changes: vec![ContentChange {
                    range: None,
                    range_length: None,
                    text: "x".to_string(),
                }],
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidEdit { .. }));
    }

    #[tokio::test]
    async fn test_generated_file_warning_fires_once() {
        let (server, client) = server();
        let uri = Uri::from_path(std::path::Path::new("/w/src/gen.rs")).unwrap();
        open(&server, "/w/src/gen.rs", "// Code generated by bindgen. DO NOT EDIT.\nfn a() {}\n")
            .wait()
            .await;

        for version in 2..4 {
            server
                .did_change(DidChangeParams {
                    text_document: VersionedTextDocumentIdentifier {
                        uri: uri.clone(),
                        version,
                    },
                    content_changes: vec![ContentChange {
                        range: None,
                        range_length: None,
                        text: format!("// Code generated by bindgen. DO NOT EDIT.\nfn a() {{}} // {version}\n"),
                    }],
                })
                .unwrap()
                .wait()
                .await;
        }

        let messages = client.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, MessageType::Warning);
        assert!(messages[0].1.contains("generated"));
    }

    #[tokio::test]
    async fn test_file_snapshot_request_reports_current_state() {
        let (server, _client) = server();
        let uri = Uri::from_path(std::path::Path::new("/w/src/main.rs")).unwrap();
        open(&server, "/w/src/main.rs", "fn main() {}").wait().await;

        let response = server.handle(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "langd/fileSnapshot",
            "params": { "uri": uri },
        }));
        let response = response.unwrap();
        let result = &response["result"];
        assert_eq!(result["generation"], 1);
        assert_eq!(result["version"], 1);
        assert_eq!(result["text"], "fn main() {}");
        assert!(result["digest"].is_string());
    }

    #[tokio::test]
    async fn test_shutdown_then_exit() {
        let (server, _client) = server();
        open(&server, "/w/src/main.rs", "fn main() {}").wait().await;

        let response = server
            .handle(json!({ "jsonrpc": "2.0", "id": 1, "method": "shutdown" }))
            .unwrap();
        assert_eq!(response["result"], Value::Null);

        // Mutations now fail, reads still work.
        let err = server
            .did_close(DidCloseParams {
                text_document: TextDocumentIdentifier {
                    uri: Uri::from_path(std::path::Path::new("/w/src/main.rs")).unwrap(),
                },
            })
            .unwrap_err();
        assert!(err.is_terminal());

        assert!(!server.exited());
        server.handle(json!({ "jsonrpc": "2.0", "method": "exit" }));
        assert!(server.exited());
    }

    #[tokio::test]
    async fn test_attached_server_exit_leaves_session_running() {
        let client: Arc<dyn Client> = Arc::new(RecordingClient::default());
        let session = Arc::new(Session::new(EngineOptions::default()));
        let scheduler = DiagnosticScheduler::new(
            Arc::clone(&client),
            Arc::new(diagnostics::ConflictMarkerDiagnoser),
        );
        let pipeline =
            ModificationPipeline::new(Arc::clone(&session), scheduler, Arc::clone(&client));
        let attached = Server::attached(Arc::clone(&session), pipeline, client);
        assert!(!attached.owns_session());

        attached.handle(json!({ "jsonrpc": "2.0", "id": 1, "method": "shutdown" }));
        attached.handle(json!({ "jsonrpc": "2.0", "method": "exit" }));
        assert!(attached.exited());
        // The shared session stays available to other connections.
        assert!(!session.is_shut_down());
        session.create_view("w", Uri::parse("file:///w").unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_request_gets_method_not_found() {
        let (server, _client) = server();
        let response = server
            .handle(json!({ "jsonrpc": "2.0", "id": 3, "method": "textDocument/hover" }))
            .unwrap();
        assert_eq!(response["error"]["code"], protocol::METHOD_NOT_FOUND);
    }

    #[test]
    fn test_generated_marker_detection() {
        assert!(looks_generated("// Code generated by protoc. DO NOT EDIT.\n"));
        assert!(!looks_generated("fn main() {}\n"));
        // Marker past the top of the file does not count.
        let buried = format!("{}// DO NOT EDIT\n", "\n".repeat(10));
        assert!(!looks_generated(&buried));
    }
}
