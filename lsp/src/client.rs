//! Language client over a connected [`Channel`].
//!
//! A writer task owns the write half and drains an mpsc queue of frames; a reader
//! task owns the read half, routes responses to pending requests, answers server
//! requests, and turns notifications into [`ServerEvent`]s or sink output. When
//! the read half ends, the reader publishes [`ChannelClosed`] once.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use yls_types::{RULE_LANGUAGE_ID, RuleDiagnostic};

use crate::codec::{FrameReader, FrameWriter};
use crate::protocol::{self, MessageParams, Notification, PublishDiagnosticsParams, Request};
use crate::sink::DiagnosticSink;
use crate::transport::Channel;

const WRITER_CHANNEL_CAPACITY: usize = 64;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bounded wait for the writer to flush and close on shutdown.
const WRITER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type PendingMap = Arc<tokio::sync::Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Why the read half of the channel ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelClosed {
    Eof,
    ReadError(String),
}

impl fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("closed by the server"),
            Self::ReadError(e) => write!(f, "read failed: {e}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ServerEvent {
    Diagnostics {
        uri: String,
        items: Vec<RuleDiagnostic>,
    },
    Closed(ChannelClosed),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("channel to the server is closed")]
    Closed,
    #[error("{method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("{method} failed: {message} (code {code})")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("serializing {method}: {source}")]
    Serialize {
        method: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub language_id: String,
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            language_id: String::from(RULE_LANGUAGE_ID),
            request_timeout: Duration::from_secs(30),
        }
    }
}

struct Shared {
    writer_tx: mpsc::Sender<WriterCommand>,
    pending: PendingMap,
    next_id: AtomicU64,
    /// Open documents and their last sent version.
    versions: tokio::sync::Mutex<HashMap<String, i32>>,
    options: ClientOptions,
}

/// Cheap, cloneable handle for sending requests and notifications.
#[derive(Clone)]
pub struct ClientHandle {
    shared: Arc<Shared>,
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("language_id", &self.shared.options.language_id)
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    /// Send a request and wait for its result, bounded by the request timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ClientError> {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        shared.pending.lock().await.insert(id, tx);

        let frame = match serde_json::to_value(Request::new(id, method, params)) {
            Ok(frame) => frame,
            Err(source) => {
                shared.pending.lock().await.remove(&id);
                return Err(ClientError::Serialize {
                    method: method.to_string(),
                    source,
                });
            }
        };
        if shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            shared.pending.lock().await.remove(&id);
            return Err(ClientError::Closed);
        }

        let timeout = shared.options.request_timeout;
        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                shared.pending.lock().await.remove(&id);
                return Err(ClientError::Closed);
            }
            Err(_) => {
                shared.pending.lock().await.remove(&id);
                return Err(ClientError::Timeout {
                    method: method.to_string(),
                    timeout,
                });
            }
        };

        if let Some(error) = response.get("error") {
            return Err(ClientError::Rpc {
                method: method.to_string(),
                code: error["code"].as_i64().unwrap_or_default(),
                message: error["message"]
                    .as_str()
                    .unwrap_or("unknown error")
                    .to_string(),
            });
        }
        Ok(response
            .get("result")
            .cloned()
            .unwrap_or(serde_json::Value::Null))
    }

    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), ClientError> {
        let frame = serde_json::to_value(Notification::new(method, params)).map_err(|source| {
            ClientError::Serialize {
                method: method.to_string(),
                source,
            }
        })?;
        self.shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// `initialize` followed by `initialized`. Returns the server's result (capabilities).
    pub async fn initialize(
        &self,
        root_uri: Option<&str>,
    ) -> Result<serde_json::Value, ClientError> {
        let result = self
            .request("initialize", Some(protocol::initialize_params(root_uri)))
            .await?;
        self.notify("initialized", Some(serde_json::json!({})))
            .await?;
        Ok(result)
    }

    /// `shutdown` followed by `exit`.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.request("shutdown", None).await?;
        self.notify("exit", None).await
    }

    pub async fn did_open(&self, uri: &str, text: &str) -> Result<(), ClientError> {
        let version = 1;
        self.shared
            .versions
            .lock()
            .await
            .insert(uri.to_string(), version);
        let params =
            protocol::did_open_params(uri, &self.shared.options.language_id, version, text);
        self.notify("textDocument/didOpen", Some(params)).await
    }

    /// Full-text change. Opens the document first if it was never opened.
    pub async fn did_change(&self, uri: &str, text: &str) -> Result<(), ClientError> {
        let version = self.shared.versions.lock().await.get_mut(uri).map(|v| {
            *v += 1;
            *v
        });
        let Some(version) = version else {
            return self.did_open(uri, text).await;
        };
        let params = protocol::did_change_params(uri, version, text);
        self.notify("textDocument/didChange", Some(params)).await
    }

    pub async fn did_save(&self, uri: &str) -> Result<(), ClientError> {
        self.notify("textDocument/didSave", Some(protocol::did_save_params(uri)))
            .await
    }

    pub async fn did_close(&self, uri: &str) -> Result<(), ClientError> {
        self.shared.versions.lock().await.remove(uri);
        self.notify("textDocument/didClose", Some(protocol::did_close_params(uri)))
            .await
    }

    /// Last version sent for `uri`, `None` if it is not open.
    pub async fn document_version(&self, uri: &str) -> Option<i32> {
        self.shared.versions.lock().await.get(uri).copied()
    }

    /// Push the `yara` settings section, e.g. `{"compile_on_save": true}`.
    pub async fn did_change_configuration(
        &self,
        settings: serde_json::Value,
    ) -> Result<(), ClientError> {
        let params = protocol::did_change_configuration_params(settings);
        self.notify("workspace/didChangeConfiguration", Some(params))
            .await
    }

    pub async fn execute_command(
        &self,
        command: &str,
        arguments: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ClientError> {
        let params = protocol::execute_command_params(command, arguments);
        self.request("workspace/executeCommand", Some(params)).await
    }

    pub async fn compile_rule(&self) -> Result<serde_json::Value, ClientError> {
        self.execute_command(protocol::COMPILE_RULE, Vec::new())
            .await
    }

    pub async fn compile_all_rules(&self) -> Result<serde_json::Value, ClientError> {
        self.execute_command(protocol::COMPILE_ALL_RULES, Vec::new())
            .await
    }
}

/// Owns the reader and writer tasks for one channel.
pub struct LanguageClient {
    handle: ClientHandle,
    closed_rx: watch::Receiver<Option<ChannelClosed>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl LanguageClient {
    pub fn start(
        channel: Channel,
        options: ClientOptions,
        sink: Arc<dyn DiagnosticSink>,
    ) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (reader, writer) = channel.into_split();
        let pending: PendingMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(None);

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_frame(&frame).await {
                            tracing::warn!("LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
            let _ = writer.close().await;
        });

        let reader_pending = pending.clone();
        let reader_writer_tx = writer_tx.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader);
            let closed = loop {
                match reader.read_frame().await {
                    Ok(Some(frame)) => {
                        dispatch_frame(
                            &frame,
                            &reader_pending,
                            &event_tx,
                            &reader_writer_tx,
                            sink.as_ref(),
                        )
                        .await;
                    }
                    Ok(None) => {
                        tracing::info!("language server closed the channel");
                        break ChannelClosed::Eof;
                    }
                    Err(e) => {
                        tracing::warn!("LSP reader error: {e}");
                        break ChannelClosed::ReadError(e.to_string());
                    }
                }
            };
            // Fail outstanding requests now rather than at their timeout.
            reader_pending.lock().await.clear();
            let _ = closed_tx.send(Some(closed.clone()));
            let _ = event_tx.try_send(ServerEvent::Closed(closed));
        });

        let handle = ClientHandle {
            shared: Arc::new(Shared {
                writer_tx,
                pending,
                next_id: AtomicU64::new(1),
                versions: tokio::sync::Mutex::new(HashMap::new()),
                options,
            }),
        };

        (
            Self {
                handle,
                closed_rx,
                reader_handle,
                writer_handle,
            },
            event_rx,
        )
    }

    #[must_use]
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Becomes `Some` once the read half ends.
    #[must_use]
    pub fn closed(&self) -> watch::Receiver<Option<ChannelClosed>> {
        self.closed_rx.clone()
    }

    /// Close the channel: stop the writer (shutting down the write half), then the reader.
    pub async fn close(mut self) {
        let _ = self
            .handle
            .shared
            .writer_tx
            .send(WriterCommand::Shutdown)
            .await;
        if tokio::time::timeout(WRITER_CLOSE_TIMEOUT, &mut self.writer_handle)
            .await
            .is_err()
        {
            tracing::debug!("LSP writer did not finish in time");
        }
        self.reader_handle.abort();
    }
}

impl Drop for LanguageClient {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

async fn dispatch_frame(
    frame: &serde_json::Value,
    pending: &tokio::sync::Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
    event_tx: &mpsc::Sender<ServerEvent>,
    writer_tx: &mpsc::Sender<WriterCommand>,
    sink: &dyn DiagnosticSink,
) {
    let Some(incoming) = parse_incoming(frame) else {
        tracing::trace!("Ignoring malformed JSON-RPC frame");
        return;
    };

    match incoming {
        IncomingFrame::Response { id, body } => {
            let sender = pending.lock().await.remove(&id);
            if let Some(tx) = sender {
                let _ = tx.send(body);
            }
        }
        IncomingFrame::ServerRequest { id, method } => {
            // Unanswered requests can stall the server.
            tracing::debug!("server sent request {method}, replying method not found");
            let response = protocol::method_not_found(&id, &method);
            let _ = writer_tx.send(WriterCommand::Send(response)).await;
        }
        IncomingFrame::Notification { method, params } => {
            handle_notification(&method, params, event_tx, sink).await;
        }
    }
}

async fn handle_notification(
    method: &str,
    params: Option<serde_json::Value>,
    event_tx: &mpsc::Sender<ServerEvent>,
    sink: &dyn DiagnosticSink,
) {
    match method {
        "textDocument/publishDiagnostics" => {
            let Some(params) = params else { return };
            match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                Ok(params) => {
                    let items = params
                        .diagnostics
                        .iter()
                        .map(protocol::LspDiagnostic::to_rule_diagnostic)
                        .collect();
                    // Nobody may be consuming events; never stall the reader on them.
                    if event_tx
                        .try_send(ServerEvent::Diagnostics {
                            uri: params.uri,
                            items,
                        })
                        .is_err()
                    {
                        tracing::debug!("event queue full or closed, dropping diagnostics");
                    }
                }
                Err(e) => {
                    tracing::debug!("Failed to parse publishDiagnostics: {e}");
                }
            }
        }
        "window/logMessage" | "window/showMessage" | "window/showMessageRequest" => {
            let Some(params) = params else { return };
            match serde_json::from_value::<MessageParams>(params) {
                Ok(MessageParams { kind: 1, message }) => sink.error(&message),
                Ok(MessageParams { kind: 2, message }) => sink.warn(&message),
                Ok(MessageParams { message, .. }) => sink.info(&message),
                Err(e) => tracing::debug!("Failed to parse {method}: {e}"),
            }
        }
        _ => {
            tracing::trace!("Ignoring notification: {method}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;
    use yls_types::{DiagnosticSeverity, TransportKind};

    use super::*;
    use crate::sink::{RecordingSink, SinkLevel};

    fn test_channels() -> (
        PendingMap,
        mpsc::Sender<ServerEvent>,
        mpsc::Receiver<ServerEvent>,
        mpsc::Sender<WriterCommand>,
        mpsc::Receiver<WriterCommand>,
    ) {
        let pending: PendingMap = Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let (event_tx, event_rx) = mpsc::channel(32);
        let (writer_tx, writer_rx) = mpsc::channel(32);
        (pending, event_tx, event_rx, writer_tx, writer_rx)
    }

    #[tokio::test]
    async fn response_routes_to_pending() {
        let (pending, event_tx, _event_rx, writer_tx, _writer_rx) = test_channels();
        let sink = RecordingSink::new("test");

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(1, tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": { "capabilities": {} }
        });
        dispatch_frame(&frame, &pending, &event_tx, &writer_tx, &sink).await;

        let response = rx.await.unwrap();
        assert!(response["result"]["capabilities"].is_object());
        assert!(pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn publish_diagnostics_becomes_event() {
        let (pending, event_tx, mut event_rx, writer_tx, _writer_rx) = test_channels();
        let sink = RecordingSink::new("test");

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": {
                "uri": "file:///rules/peek_rules.yara",
                "diagnostics": [{
                    "range": { "start": { "line": 5, "character": 0 }, "end": { "line": 5, "character": 10 } },
                    "severity": 1,
                    "source": "yara",
                    "message": "undefined identifier \"$b\""
                }]
            }
        });
        dispatch_frame(&frame, &pending, &event_tx, &writer_tx, &sink).await;

        match event_rx.try_recv().unwrap() {
            ServerEvent::Diagnostics { uri, items } => {
                assert_eq!(uri, "file:///rules/peek_rules.yara");
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].severity(), DiagnosticSeverity::Error);
                assert_eq!(items[0].line(), 5);
            }
            other @ ServerEvent::Closed(_) => panic!("expected Diagnostics, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_request_gets_method_not_found() {
        let (pending, event_tx, _event_rx, writer_tx, mut writer_rx) = test_channels();
        let sink = RecordingSink::new("test");

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 5,
            "method": "workspace/configuration",
            "params": {}
        });
        dispatch_frame(&frame, &pending, &event_tx, &writer_tx, &sink).await;

        match writer_rx.try_recv().unwrap() {
            WriterCommand::Send(response) => {
                assert_eq!(response["id"], 5);
                assert_eq!(response["error"]["code"], -32601);
            }
            WriterCommand::Shutdown => panic!("expected Send, got Shutdown"),
        }
    }

    #[tokio::test]
    async fn log_and_show_messages_go_to_sink() {
        let (pending, event_tx, mut event_rx, writer_tx, mut writer_rx) = test_channels();
        let sink = RecordingSink::new("test");

        for (method, kind, message) in [
            ("window/logMessage", 3, "Client connected"),
            ("window/showMessage", 1, "yara-python is not installed"),
            ("window/showMessageRequest", 2, "Successfully connected"),
        ] {
            let frame = serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": { "type": kind, "message": message }
            });
            dispatch_frame(&frame, &pending, &event_tx, &writer_tx, &sink).await;
        }

        assert!(sink.contains(SinkLevel::Info, "Client connected"));
        assert!(sink.contains(SinkLevel::Error, "yara-python"));
        assert!(sink.contains(SinkLevel::Warn, "Successfully connected"));
        assert!(event_rx.try_recv().is_err());
        assert!(writer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn response_for_unknown_id_ignored() {
        let (pending, event_tx, mut event_rx, writer_tx, _writer_rx) = test_channels();
        let sink = RecordingSink::new("test");
        let frame = serde_json::json!({ "jsonrpc": "2.0", "id": 999, "result": {} });
        dispatch_frame(&frame, &pending, &event_tx, &writer_tx, &sink).await;
        assert!(event_rx.try_recv().is_err());
    }

    /// A scripted peer on the far end of an in-memory duplex stream.
    fn duplex_client(
        request_timeout: Duration,
    ) -> (LanguageClient, mpsc::Receiver<ServerEvent>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(ours);
        let channel = Channel::new(TransportKind::Socket, Box::new(reader), Box::new(writer));
        let options = ClientOptions {
            request_timeout,
            ..ClientOptions::default()
        };
        let (client, events) =
            LanguageClient::start(channel, options, Arc::new(RecordingSink::new("test")));
        (client, events, theirs)
    }

    #[tokio::test]
    async fn request_round_trip_and_rpc_error() {
        let (client, _events, peer) = duplex_client(Duration::from_secs(5));
        let (peer_read, peer_write) = tokio::io::split(peer);
        tokio::spawn(async move {
            let mut reader = FrameReader::new(peer_read);
            let mut writer = FrameWriter::new(peer_write);
            while let Ok(Some(frame)) = reader.read_frame().await {
                let Some(id) = frame.get("id").cloned() else {
                    continue;
                };
                let reply = if frame["method"] == "initialize" {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {"capabilities": {"textDocumentSync": 1}}})
                } else {
                    serde_json::json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32600, "message": "not initialized"}})
                };
                writer.write_frame(&reply).await.unwrap();
            }
        });

        let handle = client.handle();
        let caps = handle.initialize(None).await.unwrap();
        assert_eq!(caps["capabilities"]["textDocumentSync"], 1);

        let err = handle.compile_rule().await.unwrap_err();
        match err {
            ClientError::Rpc { code, message, .. } => {
                assert_eq!(code, -32600);
                assert_eq!(message, "not initialized");
            }
            other => panic!("expected Rpc error, got {other}"),
        }
        client.close().await;
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let (client, _events, _peer) = duplex_client(Duration::from_millis(100));
        let err = client.handle().request("shutdown", None).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }), "{err}");
    }

    #[tokio::test]
    async fn peer_close_is_reported_once() {
        let (client, mut events, peer) = duplex_client(Duration::from_secs(5));
        let mut closed = client.closed();
        drop(peer);

        let state = tokio::time::timeout(Duration::from_secs(2), closed.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(state, Some(ChannelClosed::Eof));

        match events.recv().await.unwrap() {
            ServerEvent::Closed(reason) => assert_eq!(reason, ChannelClosed::Eof),
            other @ ServerEvent::Diagnostics { .. } => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn document_versions_increase_per_uri() {
        let (client, _events, _peer) = duplex_client(Duration::from_secs(5));
        let handle = client.handle();
        let uri = "file:///rules/a.yara";

        handle.did_change(uri, "rule a { condition: true }").await.unwrap();
        assert_eq!(handle.document_version(uri).await, Some(1));
        handle.did_change(uri, "rule a { condition: false }").await.unwrap();
        handle.did_change(uri, "rule a { condition: true }").await.unwrap();
        assert_eq!(handle.document_version(uri).await, Some(3));
        assert_eq!(handle.document_version("file:///rules/b.yara").await, None);

        handle.did_close(uri).await.unwrap();
        assert_eq!(handle.document_version(uri).await, None);
    }
}
