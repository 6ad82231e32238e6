//! Line-delimited JSON-RPC sessions with worker processes.
//!
//! One [`ProtocolSession`] wraps one worker's stdin/stdout pair. Outbound
//! messages are serialized as single newline-terminated JSON lines; inbound
//! lines are parsed and replies are correlated back to pending calls by
//! message id. A malformed line is logged and discarded - it never tears the
//! session down.
//!
//! The session itself never times out a pending call; callers bound their
//! waits (see the dispatcher and the initialize handshake).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Protocol version sent during the initialize handshake
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC error object carried in a reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Wire envelope: one JSON object per line.
///
/// `id` is present on calls and replies, absent on notifications. A reply
/// carries exactly one of `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl ProtocolMessage {
    /// Build a request (a call expecting a reply)
    pub fn request(id: impl Into<String>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(Value::String(id.into())),
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Build a notification (no reply expected)
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.into()),
            params,
            result: None,
            error: None,
        }
    }

    /// Classify an inbound message
    fn classify(self) -> Option<Incoming> {
        if self.result.is_some() || self.error.is_some() {
            let id = id_string(self.id.as_ref()?)?;
            let outcome = match self.error {
                Some(error) => Err(error),
                None => Ok(self.result.unwrap_or(Value::Null)),
            };
            return Some(Incoming::Reply { id, outcome });
        }
        self.method.map(|method| Incoming::Notification {
            method,
            params: self.params,
        })
    }
}

/// Inbound messages after classification
#[derive(Debug)]
enum Incoming {
    Reply {
        id: String,
        outcome: std::result::Result<Value, RpcError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

fn id_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

type ReplyOutcome = std::result::Result<Value, RpcError>;
type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<ReplyOutcome>>>>;

/// A call that has been sent and awaits its correlated reply
#[derive(Debug)]
pub struct PendingCall {
    pub id: String,
    rx: oneshot::Receiver<ReplyOutcome>,
}

impl PendingCall {
    /// Wait for the reply. An error reply becomes [`Error::Worker`]; a
    /// session that closes before replying becomes [`Error::SessionClosed`].
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(Error::Worker {
                code: error.code,
                message: error.message,
            }),
            Err(_) => Err(Error::SessionClosed),
        }
    }
}

/// Framing and request/reply correlation over one worker's byte streams.
pub struct ProtocolSession {
    service_id: String,
    outbound: mpsc::Sender<String>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    next_call: AtomicU64,
}

impl ProtocolSession {
    /// Create a session over a writer (worker stdin) and reader (worker
    /// stdout), spawning the writer and reader tasks.
    pub fn new<W, R>(service_id: impl Into<String>, writer: W, reader: R) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let service_id = service_id.into();
        let (outbound, outbound_rx) = mpsc::channel::<String>(32);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(
            service_id.clone(),
            writer,
            outbound_rx,
            Arc::clone(&closed),
        ));
        tokio::spawn(read_loop(
            service_id.clone(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Arc::new(Self {
            service_id,
            outbound,
            pending,
            closed,
            next_call: AtomicU64::new(1),
        })
    }

    /// Whether the underlying streams are known to be gone
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialize a message as one line and queue it for the worker's stdin
    pub async fn send(&self, message: &ProtocolMessage) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        let line = serde_json::to_string(message)?;
        debug!(
            service_id = %self.service_id,
            method = message.method.as_deref().unwrap_or(""),
            "Sending protocol message"
        );
        self.outbound
            .send(line)
            .await
            .map_err(|_| Error::SessionClosed)
    }

    /// Issue a call with a freshly generated id
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<PendingCall> {
        let id = format!("call-{}", self.next_call.fetch_add(1, Ordering::SeqCst));
        self.call_with_id(&id, method, params).await
    }

    /// Issue a call using a caller-chosen id (the dispatcher uses the task
    /// id, so a reply correlates directly to its task).
    pub async fn call_with_id(
        &self,
        id: &str,
        method: &str,
        params: Option<Value>,
    ) -> Result<PendingCall> {
        let rx = self.register(id)?;
        let message = ProtocolMessage::request(id, method, params);
        if let Err(e) = self.send(&message).await {
            self.forget(id);
            return Err(e);
        }
        Ok(PendingCall {
            id: id.to_string(),
            rx,
        })
    }

    /// Issue a call and wait for the reply, bounded by `timeout`
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let pending = self.call(method, params).await?;
        let id = pending.id.clone();
        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                self.forget(&id);
                Err(Error::CallTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Perform the initialize handshake; returns the worker's reply result
    /// (declared capabilities and server info).
    pub async fn initialize(&self, timeout: Duration) -> Result<Value> {
        self.request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {}, "resources": {} },
                "clientInfo": {
                    "name": "mcpd",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
            timeout,
        )
        .await
    }

    /// Send a liveness ping without registering a waiter. The reply, if any,
    /// is dropped by the unknown-id path.
    pub async fn ping(&self) -> Result<()> {
        let id = format!("ping-{}", self.next_call.fetch_add(1, Ordering::SeqCst));
        self.send(&ProtocolMessage::request(id, "ping", None)).await
    }

    /// Drop the pending entry for an id, if present
    pub fn forget(&self, id: &str) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(id);
        }
    }

    /// Number of calls currently awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    fn register(&self, id: &str) -> Result<oneshot::Receiver<ReplyOutcome>> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().map_err(|_| Error::LockPoisoned)?;
        if pending.contains_key(id) {
            return Err(Error::Other(format!("duplicate pending call id: {id}")));
        }
        pending.insert(id.to_string(), tx);
        Ok(rx)
    }
}

async fn write_loop<W>(
    service_id: String,
    mut writer: W,
    mut outbound_rx: mpsc::Receiver<String>,
    closed: Arc<AtomicBool>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = outbound_rx.recv().await {
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(service_id = %service_id, error = %e, "Worker stdin write failed");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!(service_id = %service_id, error = %e, "Worker stdin flush failed");
            break;
        }
    }
    closed.store(true, Ordering::SeqCst);
}

async fn read_loop<R>(service_id: String, reader: R, pending: PendingMap, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    // BufReader::lines accumulates until a newline and splits a read that
    // contains several messages, which is exactly the intake contract.
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let message: ProtocolMessage = match serde_json::from_str(line) {
                    Ok(message) => message,
                    Err(e) => {
                        // One bad line never kills the session.
                        warn!(
                            service_id = %service_id,
                            error = %Error::ProtocolParse(e.to_string()),
                            "Discarding malformed protocol line"
                        );
                        continue;
                    }
                };
                match message.classify() {
                    Some(Incoming::Reply { id, outcome }) => {
                        let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(outcome);
                            }
                            None => {
                                debug!(
                                    service_id = %service_id,
                                    reply_id = %id,
                                    "Dropping reply with no pending call"
                                );
                            }
                        }
                    }
                    Some(Incoming::Notification { method, params: _ }) => {
                        debug!(
                            service_id = %service_id,
                            method = %method,
                            "Worker notification"
                        );
                    }
                    None => {
                        debug!(service_id = %service_id, "Dropping unclassifiable message");
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(service_id = %service_id, error = %e, "Worker stdout read failed");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the senders resolves every in-flight wait() with SessionClosed.
    if let Ok(mut pending) = pending.lock() {
        pending.clear();
    }
    debug!(service_id = %service_id, "Protocol session closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    struct FakeWorker {
        reader: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeWorker {
        /// Read the next request the session sent and return its parsed form
        async fn next_request(&mut self) -> ProtocolMessage {
            let line = self.reader.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn write_raw(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn reply_ok(&mut self, id: &str, result: Value) {
            let line = format!(
                "{}\n",
                serde_json::to_string(&json!({"jsonrpc": "2.0", "id": id, "result": result}))
                    .unwrap()
            );
            self.write_raw(&line).await;
        }

        async fn reply_err(&mut self, id: &str, code: i64, message: &str) {
            let line = format!(
                "{}\n",
                serde_json::to_string(
                    &json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
                )
                .unwrap()
            );
            self.write_raw(&line).await;
        }
    }

    fn session_pair() -> (Arc<ProtocolSession>, FakeWorker) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (our_read, our_write) = tokio::io::split(ours);
        let (their_read, their_write) = tokio::io::split(theirs);
        let session = ProtocolSession::new("svc-test", our_write, our_read);
        let worker = FakeWorker {
            reader: BufReader::new(their_read).lines(),
            writer: their_write,
        };
        (session, worker)
    }

    #[tokio::test]
    async fn test_call_reply_roundtrip() {
        let (session, mut worker) = session_pair();

        let pending = session.call("tools/call", Some(json!({"name": "add"}))).await.unwrap();
        let request = worker.next_request().await;
        assert_eq!(request.method.as_deref(), Some("tools/call"));
        let id = id_string(request.id.as_ref().unwrap()).unwrap();

        worker.reply_ok(&id, json!({"answer": 8})).await;
        let result = pending.wait().await.unwrap();
        assert_eq!(result, json!({"answer": 8}));
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_replies_route_correctly() {
        let (session, mut worker) = session_pair();

        let first = session.call("tools/call", Some(json!({"n": 1}))).await.unwrap();
        let second = session.call("tools/call", Some(json!({"n": 2}))).await.unwrap();

        let req1 = worker.next_request().await;
        let req2 = worker.next_request().await;
        let id1 = id_string(req1.id.as_ref().unwrap()).unwrap();
        let id2 = id_string(req2.id.as_ref().unwrap()).unwrap();

        // Reply to the second call first
        worker.reply_ok(&id2, json!("second")).await;
        worker.reply_ok(&id1, json!("first")).await;

        assert_eq!(second.wait().await.unwrap(), json!("second"));
        assert_eq!(first.wait().await.unwrap(), json!("first"));
    }

    #[tokio::test]
    async fn test_error_reply_becomes_worker_error() {
        let (session, mut worker) = session_pair();

        let pending = session.call("tools/call", None).await.unwrap();
        let request = worker.next_request().await;
        let id = id_string(request.id.as_ref().unwrap()).unwrap();
        worker.reply_err(&id, -32000, "Division by zero is not allowed").await;

        match pending.wait().await {
            Err(Error::Worker { code, message }) => {
                assert_eq!(code, -32000);
                assert!(message.contains("Division by zero"));
            }
            other => panic!("expected worker error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_line_does_not_kill_session() {
        let (session, mut worker) = session_pair();

        let pending = session.call("ping", None).await.unwrap();
        let request = worker.next_request().await;
        let id = id_string(request.id.as_ref().unwrap()).unwrap();

        worker.write_raw("this is not json\n").await;
        worker.reply_ok(&id, json!({"status": "ok"})).await;

        assert_eq!(pending.wait().await.unwrap(), json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_multiple_messages_in_one_write() {
        let (session, mut worker) = session_pair();

        let first = session.call("a", None).await.unwrap();
        let second = session.call("b", None).await.unwrap();
        let req1 = worker.next_request().await;
        let req2 = worker.next_request().await;
        let id1 = id_string(req1.id.as_ref().unwrap()).unwrap();
        let id2 = id_string(req2.id.as_ref().unwrap()).unwrap();

        // Two newline-terminated replies delivered in a single write
        let blob = format!(
            "{}\n{}\n",
            json!({"jsonrpc": "2.0", "id": id1, "result": 1}),
            json!({"jsonrpc": "2.0", "id": id2, "result": 2}),
        );
        worker.write_raw(&blob).await;

        assert_eq!(first.wait().await.unwrap(), json!(1));
        assert_eq!(second.wait().await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_message_split_across_writes() {
        let (session, mut worker) = session_pair();

        let pending = session.call("tools/call", None).await.unwrap();
        let request = worker.next_request().await;
        let id = id_string(request.id.as_ref().unwrap()).unwrap();

        let full = format!("{}\n", json!({"jsonrpc": "2.0", "id": id, "result": "whole"}));
        let (head, tail) = full.split_at(10);
        worker.write_raw(head).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        worker.write_raw(tail).await;

        assert_eq!(pending.wait().await.unwrap(), json!("whole"));
    }

    #[tokio::test]
    async fn test_unknown_reply_id_is_ignored() {
        let (session, mut worker) = session_pair();

        let pending = session.call("ping", None).await.unwrap();
        let request = worker.next_request().await;
        let id = id_string(request.id.as_ref().unwrap()).unwrap();

        worker.reply_ok("never-sent", json!(0)).await;
        worker.reply_ok(&id, json!(1)).await;

        assert_eq!(pending.wait().await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_session_close_fails_pending_calls() {
        let (session, mut worker) = session_pair();

        let pending = session.call("tools/call", None).await.unwrap();
        let _ = worker.next_request().await;

        drop(worker);
        match pending.wait().await {
            Err(Error::SessionClosed) => {}
            other => panic!("expected SessionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_forgets_pending_entry() {
        let (session, mut worker) = session_pair();

        let err = session
            .request("tools/call", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            Error::CallTimeout { method, .. } => assert_eq!(method, "tools/call"),
            other => panic!("expected CallTimeout, got {other:?}"),
        }
        assert_eq!(session.pending_count(), 0);

        // A late reply to the timed-out call is dropped, not misrouted
        let request = worker.next_request().await;
        let id = id_string(request.id.as_ref().unwrap()).unwrap();
        worker.reply_ok(&id, json!("late")).await;

        let pending = session.call("ping", None).await.unwrap();
        let request = worker.next_request().await;
        let id = id_string(request.id.as_ref().unwrap()).unwrap();
        worker.reply_ok(&id, json!("fresh")).await;
        assert_eq!(pending.wait().await.unwrap(), json!("fresh"));
    }

    #[tokio::test]
    async fn test_ids_are_unique_among_pending_calls() {
        let (session, _worker) = session_pair();

        let _first = session.call_with_id("task-1", "tools/call", None).await.unwrap();
        let err = session.call_with_id("task-1", "tools/call", None).await.unwrap_err();
        assert!(err.to_string().contains("duplicate"));
        assert_eq!(session.pending_count(), 1);
    }

    #[test]
    fn test_notification_has_no_id() {
        let message = ProtocolMessage::notification("initialized", None);
        let line = serde_json::to_string(&message).unwrap();
        assert!(!line.contains("\"id\""));
        assert!(line.contains("\"method\":\"initialized\""));
    }

    #[test]
    fn test_classify_numeric_id_reply() {
        let message: ProtocolMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#).unwrap();
        match message.classify() {
            Some(Incoming::Reply { id, outcome }) => {
                assert_eq!(id, "7");
                assert!(outcome.is_ok());
            }
            other => panic!("expected reply, got {other:?}"),
        }
    }
}
