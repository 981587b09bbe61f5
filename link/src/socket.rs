//! One physical realtime socket.
//!
//! A [`Socket`] is opened once, never reused, and reports everything it sees
//! as [`SocketEvent`]s on the channel returned by [`Socket::new`]. The
//! [`SocketEvent::Closed`] event is emitted exactly once; after it the
//! instance is inert.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::bus::DEFAULT_STREAM;
use crate::error::{MercuryError, Result};
use crate::models::close_info::{is_valid_close_code, REASON_FORCED};
use crate::models::{ClientMessage, CloseInfo, Envelope};
use crate::timeouts::MercuryTimeouts;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of a [`Socket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::Idle => "idle",
            SocketState::Connecting => "connecting",
            SocketState::Open => "open",
            SocketState::Closing => "closing",
            SocketState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Everything a socket reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    /// Parsed application or control frame (anything but `pong`).
    Message(Envelope),
    Pong(Envelope),
    /// An inbound sequence number skipped or repeated.
    SequenceMismatch { expected: u64, actual: u64 },
    /// A text frame that is not a valid envelope.
    Malformed { raw: String, error: String },
    /// A send attempted while the socket was not open.
    Error(String),
    Closed(CloseInfo),
}

struct SocketShared {
    url: String,
    connection_timeout: Duration,
    force_close_delay: Duration,
    state: Mutex<SocketState>,
    closed: AtomicBool,
    outbound_seq: AtomicU64,
    events: mpsc::UnboundedSender<SocketEvent>,
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    local_close: Mutex<Option<CloseInfo>>,
    io_tasks: Mutex<Vec<JoinHandle<()>>>,
    force_timer: Mutex<Option<JoinHandle<()>>>,
}

impl SocketShared {
    fn state(&self) -> SocketState {
        *self.state.lock()
    }

    fn emit(&self, event: SocketEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(event);
    }

    /// Transition to `closed` and report it, at most once.
    fn finish(&self, info: CloseInfo) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.lock() = SocketState::Closed;
        self.writer.lock().take();
        log::debug!("[mercury-socket] closed: {}", info);
        let _ = self.events.send(SocketEvent::Closed(info));
    }

    fn abort_io(&self) {
        for handle in self.io_tasks.lock().drain(..) {
            handle.abort();
        }
    }

    fn write(&self, message: Message) -> Result<()> {
        let writer = self.writer.lock();
        let Some(tx) = writer.as_ref() else {
            return Err(MercuryError::InvalidState("socket writer is gone".to_string()));
        };
        tx.send(message)
            .map_err(|_| MercuryError::TransportError("socket writer stopped".to_string()))
    }

    fn send(&self, message: &ClientMessage) -> Result<()> {
        let state = self.state();
        if state != SocketState::Open {
            let err = MercuryError::InvalidState(format!("cannot send while socket is {}", state));
            self.emit(SocketEvent::Error(err.to_string()));
            return Err(err);
        }
        let text = serde_json::to_string(message)?;
        self.write(Message::Text(text.into()))?;
        self.outbound_seq.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn handle_text(&self, text: &str, expected: &mut HashMap<String, u64>) {
        let envelope = match serde_json::from_str::<Envelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("[mercury-socket] error while receiving frame: {}", e);
                self.emit(SocketEvent::Malformed {
                    raw: text.to_string(),
                    error: e.to_string(),
                });
                return;
            },
        };

        if let Some(actual) = envelope.sequence_number {
            let stream = envelope.stream.as_deref().unwrap_or(DEFAULT_STREAM);
            if let Some(&wanted) = expected.get(stream) {
                if wanted != actual {
                    log::debug!(
                        "[mercury-socket] sequence mismatch on '{}': expected {}, got {}",
                        stream,
                        wanted,
                        actual
                    );
                    self.emit(SocketEvent::SequenceMismatch {
                        expected: wanted,
                        actual,
                    });
                }
            }
            expected.insert(stream.to_string(), actual.saturating_add(1));
        }

        if let Some(id) = envelope.id.as_deref() {
            if let Err(e) = self.send(&ClientMessage::ack(id)) {
                log::debug!("[mercury-socket] failed to ack {}: {}", id, e);
            }
        }

        if envelope.is_pong() {
            self.emit(SocketEvent::Pong(envelope));
        } else {
            self.emit(SocketEvent::Message(envelope));
        }
    }
}

/// A single realtime socket connection.
pub struct Socket {
    shared: Arc<SocketShared>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("url", &self.shared.url)
            .field("state", &self.shared.state())
            .field("outbound_sequence", &self.outbound_sequence())
            .finish()
    }
}

impl Socket {
    /// Create an idle socket for `url`. Events are delivered on the returned
    /// receiver.
    pub fn new(
        url: impl Into<String>,
        timeouts: &MercuryTimeouts,
    ) -> (Self, mpsc::UnboundedReceiver<SocketEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SocketShared {
            url: url.into(),
            connection_timeout: timeouts.connection_timeout,
            force_close_delay: timeouts.force_close_delay,
            state: Mutex::new(SocketState::Idle),
            closed: AtomicBool::new(false),
            outbound_seq: AtomicU64::new(0),
            events,
            writer: Mutex::new(None),
            local_close: Mutex::new(None),
            io_tasks: Mutex::new(Vec::new()),
            force_timer: Mutex::new(None),
        });
        (Self { shared }, rx)
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> SocketState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Number of frames sent so far.
    pub fn outbound_sequence(&self) -> u64 {
        self.shared.outbound_seq.load(Ordering::SeqCst)
    }

    /// Open the transport. Resolves once the socket is open.
    ///
    /// A failed open leaves the socket `closed` without emitting
    /// [`SocketEvent::Closed`]; the error is the only report.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            if *state != SocketState::Idle {
                return Err(MercuryError::InvalidState(format!(
                    "connect() called on a {} socket",
                    *state
                )));
            }
            *state = SocketState::Connecting;
        }

        log::debug!("[mercury-socket] connecting to {}", self.shared.url);
        let timeout = self.shared.connection_timeout;
        let attempt = connect_async(self.shared.url.as_str());
        let result = if timeout.is_zero() {
            Ok(attempt.await)
        } else {
            tokio::time::timeout(timeout, attempt).await
        };

        let ws_stream = match result {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                self.fail_connect();
                return Err(map_connect_error(e));
            },
            Err(_) => {
                self.fail_connect();
                return Err(MercuryError::TimeoutError(format!(
                    "socket open timed out after {:?}",
                    timeout
                )));
            },
        };

        let (sink, stream) = ws_stream.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.shared.state.lock();
            if *state != SocketState::Connecting {
                return Err(MercuryError::Cancelled(
                    "socket was closed while connecting".to_string(),
                ));
            }
            *self.shared.writer.lock() = Some(writer_tx);
            *state = SocketState::Open;
        }

        let writer = tokio::spawn(write_loop(sink, writer_rx));
        let reader = tokio::spawn(read_loop(self.shared.clone(), stream));
        self.shared.io_tasks.lock().extend([writer, reader]);
        log::info!("[mercury-socket] connected to {}", self.shared.url);
        Ok(())
    }

    fn fail_connect(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        *self.shared.state.lock() = SocketState::Closed;
    }

    /// Send a frame. Fails with `InvalidState` (also reported as
    /// [`SocketEvent::Error`]) unless the socket is open.
    pub fn send(&self, message: &ClientMessage) -> Result<()> {
        self.shared.send(message)
    }

    /// Start closing the socket. Repeated calls are no-ops.
    ///
    /// If the remote does not answer within the force-close delay the
    /// socket closes anyway with `1000 "Done (forced)"`.
    pub fn close(&self, code: u16, reason: &str) -> Result<()> {
        if !is_valid_close_code(code) {
            return Err(MercuryError::ConfigurationError(format!(
                "close code {} is not allowed; use 1000 or 3000-4999",
                code
            )));
        }

        let info = CloseInfo::new(code, reason);
        let mut state = self.shared.state.lock();
        let current = *state;
        match current {
            SocketState::Closing | SocketState::Closed => Ok(()),
            SocketState::Idle | SocketState::Connecting => {
                drop(state);
                self.shared.finish(info);
                Ok(())
            },
            SocketState::Open => {
                *state = SocketState::Closing;
                drop(state);
                log::debug!("[mercury-socket] closing: {}", info);

                *self.shared.local_close.lock() = Some(info);
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.to_string().into(),
                };
                if let Err(e) = self.shared.write(Message::Close(Some(frame))) {
                    log::debug!("[mercury-socket] close frame not sent: {}", e);
                }

                let shared = self.shared.clone();
                let delay = self.shared.force_close_delay;
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !shared.closed.load(Ordering::SeqCst) {
                        log::info!("[mercury-socket] no close frame from remote; forcing closure");
                        shared.finish(CloseInfo::new(1000, REASON_FORCED));
                        shared.abort_io();
                    }
                });
                *self.shared.force_timer.lock() = Some(timer);
                Ok(())
            },
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.writer.lock().take();
        self.shared.abort_io();
        if let Some(timer) = self.shared.force_timer.lock().take() {
            timer.abort();
        }
    }
}

fn map_connect_error(err: WsError) -> MercuryError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            let body = response
                .body()
                .as_ref()
                .filter(|b| !b.is_empty())
                .map(|b| String::from_utf8_lossy(b).into_owned())
                .unwrap_or_default();
            let message = if body.is_empty() {
                format!("socket upgrade rejected with HTTP {}", status)
            } else {
                format!("socket upgrade rejected with HTTP {}: {}", status, body)
            };
            match status {
                401 => MercuryError::AuthenticationError(message),
                400 | 403 => MercuryError::ProtocolError(message),
                _ => MercuryError::TransportError(message),
            }
        },
        other => MercuryError::TransportError(format!("socket open failed: {}", other)),
    }
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            log::debug!("[mercury-socket] write failed: {}", e);
            break;
        }
    }
}

async fn read_loop(shared: Arc<SocketShared>, mut stream: SplitStream<WsStream>) {
    let mut expected: HashMap<String, u64> = HashMap::new();
    loop {
        let frame = stream.next().await;
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        match frame {
            Some(Ok(Message::Text(text))) => shared.handle_text(text.as_str(), &mut expected),
            Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                Ok(text) => shared.handle_text(text, &mut expected),
                Err(e) => shared.emit(SocketEvent::Malformed {
                    raw: String::from_utf8_lossy(&data).into_owned(),
                    error: e.to_string(),
                }),
            },
            // tungstenite queues the pong reply for transport pings itself.
            Some(Ok(Message::Ping(_)))
            | Some(Ok(Message::Pong(_)))
            | Some(Ok(Message::Frame(_))) => {},
            Some(Ok(Message::Close(frame))) => {
                let remote = frame
                    .map(|f| CloseInfo::new(f.code.into(), f.reason.as_str()))
                    .unwrap_or_else(|| CloseInfo::new(1005, ""));
                let info = shared.local_close.lock().take().unwrap_or(remote);
                shared.finish(info.normalized());
                break;
            },
            Some(Err(e)) => {
                shared.finish(CloseInfo::abnormal(e.to_string()));
                break;
            },
            None => {
                shared.finish(CloseInfo::abnormal("stream ended"));
                break;
            },
        }
    }
}
