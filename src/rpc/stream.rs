//! Line-delimited JSON over an async byte stream (child stdio, sockets).
//!
//! Client frames carry a transport sequence number; server frames answer it
//! in `replyTo`, or omit it for pushed events. One session is bound per
//! connection, so every stream transport is push-capable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rpc::envelope::{Request, Response, ResponseData};
use crate::rpc::server::{RpcServer, DEFAULT_SESSION_BUFFER};
use crate::rpc::transport::{PushStream, Transport, TransportError};

/// Client-to-server line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Transport sequence number.
    pub seq: u64,
    /// The request.
    pub request: Request,
}

/// Server-to-client line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    /// Sequence number answered, `None` for pushed events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
    /// Payload.
    pub response: Response,
}

type PendingReplies = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

async fn write_line<W, T>(writer: &mut W, frame: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let mut line = serde_json::to_vec(frame).map_err(|e| TransportError::Codec(e.to_string()))?;
    line.push(b'\n');
    writer
        .write_all(&line)
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| TransportError::Io(e.to_string()))
}

/// Client side of a line-delimited stream.
pub struct StreamTransport {
    endpoint: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: PendingReplies,
    next_seq: AtomicU64,
    closed: Arc<AtomicBool>,
    push: Mutex<Option<PushStream>>,
    reader: JoinHandle<()>,
}

impl StreamTransport {
    /// Start reading frames from `reader`; requests are written to `writer`.
    /// Must be called inside a tokio runtime.
    pub fn new<R, W>(endpoint: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let endpoint = endpoint.into();
        let pending: PendingReplies = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (push_tx, push_rx) = mpsc::channel(DEFAULT_SESSION_BUFFER);

        let reader = tokio::spawn(read_frames(
            endpoint.clone(),
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
            push_tx,
        ));

        Self {
            endpoint,
            writer: tokio::sync::Mutex::new(Box::new(writer)),
            pending,
            next_seq: AtomicU64::new(1),
            closed,
            push: Mutex::new(Some(push_rx)),
            reader,
        }
    }

    /// Whether the read side has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn read_frames<R>(
    endpoint: String,
    reader: R,
    pending: PendingReplies,
    closed: Arc<AtomicBool>,
    push: mpsc::Sender<ResponseData>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "stream read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: ResponseFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "skipping non-frame line");
                continue;
            }
        };
        match frame.reply_to {
            Some(seq) => {
                let waiter = pending.lock().remove(&seq);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(frame.response);
                    }
                    None => debug!(endpoint = %endpoint, seq, "reply for unknown sequence"),
                }
            }
            None => {
                for data in frame.response.data {
                    if push.try_send(data).is_err() {
                        warn!(
                            endpoint = %endpoint,
                            "push stream full or dropped, discarding event"
                        );
                    }
                }
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    pending.lock().clear();
    debug!(endpoint = %endpoint, "stream closed");
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn exchange(&self, request: Request) -> Result<Response, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(seq, tx);

        let written = {
            let mut writer = self.writer.lock().await;
            write_line(&mut *writer, &RequestFrame { seq, request }).await
        };
        if let Err(e) = written {
            self.pending.lock().remove(&seq);
            return Err(e);
        }

        rx.await.map_err(|_| TransportError::Closed)
    }

    fn supports_server_push(&self) -> bool {
        true
    }

    fn take_push_stream(&self) -> Option<PushStream> {
        self.push.lock().take()
    }
}

/// Serve `server` over a line-delimited stream until the read side ends.
///
/// Requests are handled concurrently (a long `run` does not block an
/// `abort`). Events pushed to the connection's session are written ahead
/// of any reply produced after them.
///
/// # Errors
///
/// `Io` if reading the stream fails.
pub async fn serve_stream<R, W>(
    server: Arc<RpcServer>,
    reader: R,
    writer: W,
) -> Result<(), TransportError>
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let session = Uuid::new_v4().to_string();
    let mut push_rx = server.attach_push(&session);
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ResponseFrame>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        loop {
            let frame = tokio::select! {
                biased;
                Some(data) = push_rx.recv() => ResponseFrame {
                    reply_to: None,
                    response: Response { data: vec![data] },
                },
                frame = reply_rx.recv() => match frame {
                    Some(frame) => {
                        while let Ok(data) = push_rx.try_recv() {
                            let pushed = ResponseFrame {
                                reply_to: None,
                                response: Response { data: vec![data] },
                            };
                            if let Err(e) = write_line(&mut writer, &pushed).await {
                                warn!(error = %e, "stream write failed");
                                return;
                            }
                        }
                        frame
                    }
                    None => break,
                },
            };
            if let Err(e) = write_line(&mut writer, &frame).await {
                warn!(error = %e, "stream write failed");
                return;
            }
        }
    });

    let mut lines = BufReader::new(reader).lines();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(TransportError::Io(e.to_string())),
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: RequestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "discarding malformed request frame");
                continue;
            }
        };

        let server = Arc::clone(&server);
        let reply_tx = reply_tx.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let RequestFrame { seq, mut request } = frame;
            request.headers.session_uuid = Some(session);
            let call_index = request.headers.call_index;
            let handled = tokio::spawn(async move { server.handle(request).await }).await;
            let response = handled.unwrap_or_else(|e| {
                warn!(seq, error = %e, "request handler panicked");
                Response {
                    data: vec![ResponseData::method_return(
                        call_index,
                        Err(format!("handler panicked: {e}")),
                    )],
                }
            });
            let _ = reply_tx.send(ResponseFrame {
                reply_to: Some(seq),
                response,
            });
        });
    };

    drop(reply_tx);
    if let Err(e) = writer_task.await {
        warn!(error = %e, "stream writer ended abnormally");
    }
    server.detach(&session);
    read_result
}
