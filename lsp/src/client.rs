//! JSON-RPC client over a TCP connection to a language server.
//!
//! One reader task feeds socket chunks to a [`MessageParser`] and settles
//! pending requests by id; one writer task owns the write half and reports
//! back when each frame has been flushed. Callers only ever talk to the
//! tasks through channels and the shared pending table.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::{self, MessageParser};
use crate::protocol::{self, Incoming, Notification, Request};
use crate::types::{
    ConnectionStatus, EventErrorKind, RequestIdGenerator, RpcError, RpcEvent, ServerAddress,
};

/// Delay between two connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

const EVENT_CHANNEL_CAPACITY: usize = 256;

const WRITER_CHANNEL_CAPACITY: usize = 64;

const READ_BUFFER_BYTES: usize = 8 * 1024;

/// `Ok(result)` or `Err(error)` as sent by the server.
type Outcome = Result<serde_json::Value, serde_json::Value>;

type SharedOutcome = Shared<BoxFuture<'static, bool>>;

enum PendingSlot {
    Waiting(oneshot::Sender<Outcome>),
    /// Answered (or abandoned). Kept so a late duplicate is recognised.
    Settled,
}

#[derive(Default)]
struct PendingTable {
    slots: HashMap<u64, PendingSlot>,
    /// Set once the reader has stopped; nothing can be answered after that.
    closed: bool,
}

impl PendingTable {
    fn settle(&mut self, id: u64) {
        self.slots.insert(id, PendingSlot::Settled);
    }

    /// Drop every waiting sender so the callers see the connection close.
    fn close(&mut self) {
        self.closed = true;
        for slot in self.slots.values_mut() {
            *slot = PendingSlot::Settled;
        }
    }
}

enum WriterCommand {
    Send {
        frame: Vec<u8>,
        written: oneshot::Sender<io::Result<()>>,
    },
    Shutdown {
        closed: oneshot::Sender<()>,
    },
}

struct Connection {
    writer_tx: mpsc::Sender<WriterCommand>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader_handle.abort();
        self.writer_handle.abort();
    }
}

struct Lifecycle {
    status: ConnectionStatus,
    connecting: Option<SharedOutcome>,
    ending: Option<SharedOutcome>,
    connection: Option<Connection>,
}

struct Inner {
    address: ServerAddress,
    ids: Arc<RequestIdGenerator>,
    lifecycle: StdMutex<Lifecycle>,
    pending: Arc<Mutex<PendingTable>>,
    events: broadcast::Sender<RpcEvent>,
}

/// Client for one language server connection.
///
/// Cloning is cheap and every clone drives the same connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    pub fn new(address: ServerAddress) -> Self {
        Self::with_id_generator(address, Arc::new(RequestIdGenerator::default()))
    }

    /// Build a client that draws request ids from `ids`.
    pub fn with_id_generator(address: ServerAddress, ids: Arc<RequestIdGenerator>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                address,
                ids,
                lifecycle: StdMutex::new(Lifecycle {
                    status: ConnectionStatus::Initiated,
                    connecting: None,
                    ending: None,
                    connection: None,
                }),
                pending: Arc::new(Mutex::new(PendingTable::default())),
                events,
            }),
        }
    }

    #[must_use]
    pub fn address(&self) -> &ServerAddress {
        &self.inner.address
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.lifecycle().status
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.inner.events.subscribe()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RpcEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    /// Connect to the server, retrying until `timeout` elapses.
    ///
    /// Concurrent callers share a single attempt and all observe its
    /// outcome. Returns `false` once the client has failed or is ending.
    pub async fn connect(&self, timeout: Duration) -> bool {
        let attempt = {
            let mut lifecycle = self.lifecycle();
            if let Some(attempt) = &lifecycle.connecting {
                attempt.clone()
            } else {
                let status = lifecycle.status;
                match status {
                    ConnectionStatus::Connected => return true,
                    ConnectionStatus::Ending | ConnectionStatus::Error => return false,
                    ConnectionStatus::Initiated | ConnectionStatus::Connecting => {
                        lifecycle.status = ConnectionStatus::Connecting;
                        let attempt = self.clone().establish(timeout).boxed().shared();
                        lifecycle.connecting = Some(attempt.clone());
                        attempt
                    }
                }
            }
        };

        attempt.await
    }

    async fn establish(self, timeout: Duration) -> bool {
        let address = &self.inner.address;
        tracing::info!(%address, "Connecting to language server...");

        if let Some(stream) = connect_with_retry(address, timeout).await {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Failed to set TCP_NODELAY on {address}: {e}");
            }
            let (reader, writer) = stream.into_split();
            self.attach(reader, writer);
            tracing::info!(%address, "Connected to language server");
            return true;
        }

        tracing::warn!(
            "Unable to connect to language server at {address} within {}ms",
            timeout.as_millis()
        );
        let mut lifecycle = self.lifecycle();
        lifecycle.status = ConnectionStatus::Error;
        lifecycle.connecting = None;
        false
    }

    /// Start the reader and writer tasks over an established transport.
    pub(crate) fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(write_loop(writer, writer_rx));
        let reader_handle = tokio::spawn(read_loop(
            reader,
            Arc::clone(&self.inner.pending),
            self.inner.events.clone(),
            writer_tx.clone(),
        ));

        let mut lifecycle = self.lifecycle();
        lifecycle.connection = Some(Connection {
            writer_tx,
            reader_handle,
            writer_handle,
        });
        lifecycle.status = ConnectionStatus::Connected;
        lifecycle.connecting = None;
    }

    /// Close the connection, waiting at most `grace` for the socket to shut
    /// down cleanly.
    ///
    /// Returns `true` if the close finished in time or there was nothing to
    /// close. A second call while ending observes the first call's outcome.
    pub async fn disconnect(&self, grace: Duration) -> bool {
        let closing = {
            let mut lifecycle = self.lifecycle();
            let status = lifecycle.status;
            match status {
                ConnectionStatus::Initiated | ConnectionStatus::Error => return true,
                ConnectionStatus::Connecting => {
                    tracing::warn!("disconnect() called while a connection attempt is in flight");
                    return false;
                }
                ConnectionStatus::Ending => match &lifecycle.ending {
                    Some(closing) => closing.clone(),
                    None => return true,
                },
                ConnectionStatus::Connected => {
                    lifecycle.status = ConnectionStatus::Ending;
                    let writer_tx = lifecycle
                        .connection
                        .as_ref()
                        .map(|connection| connection.writer_tx.clone());
                    let closing = close_gracefully(writer_tx, grace).boxed().shared();
                    lifecycle.ending = Some(closing.clone());
                    closing
                }
            }
        };

        let closed = closing.await;
        if !closed {
            tracing::debug!(
                "Connection to {} did not close within {}ms",
                self.inner.address,
                grace.as_millis()
            );
        }
        closed
    }

    fn connected_writer(&self) -> Result<mpsc::Sender<WriterCommand>, RpcError> {
        let lifecycle = self.lifecycle();
        match (&lifecycle.connection, lifecycle.status) {
            (Some(connection), ConnectionStatus::Connected) => Ok(connection.writer_tx.clone()),
            (_, status) => Err(RpcError::NotConnected { status }),
        }
    }

    /// Send a request and wait for the matching response.
    ///
    /// Resolves with the response's `result`, or fails with
    /// [`RpcError::Application`] when it carries an `error`. There is no
    /// per-request timeout; wrap the call if one is needed.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let writer_tx = self.connected_writer()?;

        let id = self.inner.ids.next_id();
        let request = Request::new(id, method, params);
        let envelope = serde_json::to_value(&request)?;
        let frame = codec::encode_frame(&request)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            if pending.closed {
                return Err(RpcError::ConnectionClosed { id });
            }
            pending.slots.insert(id, PendingSlot::Waiting(tx));
        }

        self.emit(RpcEvent::RequestWillBeSent(envelope.clone()));
        tracing::debug!(id, method, "Sending request");

        if let Err(source) = send_frame(&writer_tx, frame).await {
            tracing::warn!("Error while sending request {id} ({method}): {source}");
            self.inner.pending.lock().await.settle(id);
            self.emit(RpcEvent::Error {
                kind: EventErrorKind::TransportWrite,
                context: format!("Error while sending request {id}"),
                detail: serde_json::json!({
                    "request": envelope,
                    "error": source.to_string(),
                }),
            });
            return Err(RpcError::TransportWrite { id, source });
        }

        self.emit(RpcEvent::RequestSent(envelope));

        match rx.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(RpcError::Application { id, error }),
            Err(_) => Err(RpcError::ConnectionClosed { id }),
        }
    }

    /// Send a notification. Completes once the frame is written.
    pub async fn notify(&self, method: &str, params: serde_json::Value) -> Result<(), RpcError> {
        let writer_tx = self.connected_writer()?;
        let frame = codec::encode_frame(&Notification::new(method, params))?;

        tracing::debug!(method, "Sending notification");
        send_frame(&writer_tx, frame).await.map_err(|source| {
            tracing::warn!("Error while sending notification {method}: {source}");
            RpcError::NotificationWrite {
                method: method.to_string(),
                source,
            }
        })
    }
}

/// Wait for the next received message whose `method` is `method`.
///
/// Returns `None` if the event stream closes first. Subscribe before
/// triggering the notification, or it may be missed.
pub async fn next_notification(
    events: &mut broadcast::Receiver<RpcEvent>,
    method: &str,
) -> Option<serde_json::Value> {
    loop {
        match events.recv().await {
            Ok(event) if event.received_method() == Some(method) => {
                if let RpcEvent::DataReceived(message) = event {
                    return Some(message);
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Event subscriber lagged, {skipped} events dropped");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}

async fn connect_with_retry(address: &ServerAddress, timeout: Duration) -> Option<TcpStream> {
    let deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }

        let attempt = TcpStream::connect((address.host.as_str(), address.port));
        match tokio::time::timeout(remaining, attempt).await {
            Ok(Ok(stream)) => return Some(stream),
            Ok(Err(e)) => tracing::trace!("Connection attempt to {address} failed: {e}"),
            Err(_) => return None,
        }

        tokio::time::sleep(CONNECT_RETRY_DELAY.min(remaining)).await;
    }
}

async fn close_gracefully(writer_tx: Option<mpsc::Sender<WriterCommand>>, grace: Duration) -> bool {
    let Some(writer_tx) = writer_tx else {
        return true;
    };

    let (closed, done) = oneshot::channel();
    let shutdown = async move {
        writer_tx
            .send(WriterCommand::Shutdown { closed })
            .await
            .is_ok()
            && done.await.is_ok()
    };

    tokio::time::timeout(grace, shutdown).await.unwrap_or(false)
}

async fn send_frame(writer_tx: &mpsc::Sender<WriterCommand>, frame: Vec<u8>) -> io::Result<()> {
    let (written, done) = oneshot::channel();
    writer_tx
        .send(WriterCommand::Send { frame, written })
        .await
        .map_err(|_| writer_stopped())?;
    done.await.map_err(|_| writer_stopped())?
}

fn writer_stopped() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection writer stopped")
}

async fn write_all_flushed<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut commands: mpsc::Receiver<WriterCommand>) {
    while let Some(command) = commands.recv().await {
        match command {
            WriterCommand::Send { frame, written } => {
                let result = write_all_flushed(&mut writer, &frame).await;
                let failed = result.is_err();
                let _ = written.send(result);
                if failed {
                    break;
                }
            }
            WriterCommand::Shutdown { closed } => {
                match writer.shutdown().await {
                    Ok(()) => {
                        let _ = closed.send(());
                    }
                    Err(e) => tracing::debug!("Socket shutdown failed: {e}"),
                }
                break;
            }
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    pending: Arc<Mutex<PendingTable>>,
    events: broadcast::Sender<RpcEvent>,
    writer_tx: mpsc::Sender<WriterCommand>,
) {
    let mut parser = MessageParser::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::info!("Language server closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("Error reading from language server: {e}");
                break;
            }
        };

        for decoded in parser.parse_message(&buf[..n]) {
            match decoded {
                Ok(message) => dispatch_message(message, &pending, &events, &writer_tx).await,
                Err(e) => {
                    let fatal = e.is_fatal();
                    let kind = if fatal {
                        EventErrorKind::Framing
                    } else {
                        EventErrorKind::BodyDecode
                    };
                    tracing::warn!("Malformed message from language server: {e}");
                    let _ = events.send(RpcEvent::Error {
                        kind,
                        context: "Received a malformed message".to_string(),
                        detail: serde_json::Value::String(format!("{e:#}")),
                    });
                    if fatal {
                        break 'read;
                    }
                }
            }
        }
    }

    pending.lock().await.close();
}

async fn dispatch_message(
    message: serde_json::Value,
    pending: &Mutex<PendingTable>,
    events: &broadcast::Sender<RpcEvent>,
    writer_tx: &mpsc::Sender<WriterCommand>,
) {
    let incoming = protocol::classify(&message);
    let _ = events.send(RpcEvent::DataReceived(message.clone()));

    match incoming {
        Incoming::Response { id: Some(id), outcome } => {
            let previous = pending
                .lock()
                .await
                .slots
                .get_mut(&id)
                .map(|slot| std::mem::replace(slot, PendingSlot::Settled));

            match previous {
                Some(PendingSlot::Waiting(tx)) => {
                    // The caller may have stopped waiting.
                    let _ = tx.send(outcome);
                }
                Some(PendingSlot::Settled) => {
                    tracing::warn!("Received a response that has already been processed: {id}");
                    let _ = events.send(RpcEvent::Error {
                        kind: EventErrorKind::DuplicateResponse,
                        context: format!("Received a response that has already been processed: {id}"),
                        detail: message,
                    });
                }
                None => report_unknown_id(&id.to_string(), message, events),
            }
        }
        Incoming::Response { id: None, .. } => {
            let id = message.get("id").map(ToString::to_string).unwrap_or_default();
            report_unknown_id(&id, message, events);
        }
        Incoming::ServerRequest { id, method } => {
            tracing::debug!("Server sent request {method}, replying method not found");
            let response = protocol::method_not_found(&id, &method);
            match codec::encode_frame(&response) {
                Ok(frame) => {
                    let (written, _) = oneshot::channel();
                    let _ = writer_tx.send(WriterCommand::Send { frame, written }).await;
                }
                Err(e) => tracing::warn!("Failed to encode reply to {method}: {e}"),
            }
        }
        Incoming::Notification { method } => {
            tracing::trace!("Received notification: {method}");
        }
        Incoming::Other => {
            tracing::trace!("Received a message with neither id nor method");
        }
    }
}

fn report_unknown_id(id: &str, message: serde_json::Value, events: &broadcast::Sender<RpcEvent>) {
    tracing::warn!("Unknown request id: {id}");
    let _ = events.send(RpcEvent::Error {
        kind: EventErrorKind::UnknownRequestId,
        context: format!("Unknown request id: {id}"),
        detail: message,
    });
}
