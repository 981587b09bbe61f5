//! Connectivity observability hooks for the realtime client.
//!
//! - [`on_state_change`](EventHandlers::on_state_change): `connecting` / `connected` / `disconnected`
//! - [`on_connect`](EventHandlers::on_connect): registration acknowledged
//! - [`on_disconnect`](EventHandlers::on_disconnect): a live connection was lost or closed
//! - [`on_error`](EventHandlers::on_error): a connect attempt failed
//! - [`on_sequence_mismatch`](EventHandlers::on_sequence_mismatch): inbound sequence gap
//! - [`on_ping_pong_latency`](EventHandlers::on_ping_pong_latency): round-trip of a liveness ping
//!
//! # Example
//!
//! ```rust
//! use mercury_link::{EventHandlers, ConnectionState};
//!
//! let handlers = EventHandlers::new()
//!     .on_state_change(|state| println!("mercury is {}", state))
//!     .on_error(|err| eprintln!("attempt {} failed: {}", err.attempt, err));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Logical connectivity state of the realtime client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// How a live connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectKind {
    /// Network-level loss; the client reconnects when allowed.
    Transient,
    /// The server refused to keep the session; no reconnect.
    Permanent,
    /// Another connection for the same registration took over.
    Replaced,
    /// `disconnect()` was called.
    Requested,
}

/// Reason for a disconnect event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectReason {
    pub message: String,
    /// Socket close code, if available.
    pub code: Option<u16>,
    pub kind: DisconnectKind,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>, kind: DisconnectKind) -> Self {
        Self {
            message: message.into(),
            code: None,
            kind,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16, kind: DisconnectKind) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
            kind,
        }
    }

    /// Whether the client will try to reconnect after this disconnect.
    pub fn will_reconnect(&self) -> bool {
        self.kind == DisconnectKind::Transient
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Error information passed to the `on_error` handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionError {
    pub message: String,
    /// Whether another attempt will be scheduled.
    pub recoverable: bool,
    /// Consecutive failure count when the error occurred.
    pub attempt: u32,
}

impl ConnectionError {
    pub fn new(message: impl Into<String>, recoverable: bool, attempt: u32) -> Self {
        Self {
            message: message.into(),
            recoverable,
            attempt,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

pub type OnStateChangeCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;
pub type OnErrorCallback = Arc<dyn Fn(ConnectionError) + Send + Sync>;
/// Receives `(expected, actual)` inbound sequence numbers.
pub type OnSequenceMismatchCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;
pub type OnLatencyCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Optional connectivity callbacks. Handlers run on the connection task and
/// should return quickly.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_state_change: Option<OnStateChangeCallback>,
    pub(crate) on_connect: Option<OnConnectCallback>,
    pub(crate) on_disconnect: Option<OnDisconnectCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
    pub(crate) on_sequence_mismatch: Option<OnSequenceMismatchCallback>,
    pub(crate) on_ping_pong_latency: Option<OnLatencyCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_sequence_mismatch", &self.on_sequence_mismatch.is_some())
            .field("on_ping_pong_latency", &self.on_ping_pong_latency.is_some())
            .finish()
    }
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked each time registration is acknowledged,
    /// including after automatic reconnects.
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(ConnectionError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_sequence_mismatch(mut self, f: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.on_sequence_mismatch = Some(Arc::new(f));
        self
    }

    pub fn on_ping_pong_latency(mut self, f: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.on_ping_pong_latency = Some(Arc::new(f));
        self
    }

    pub fn has_any(&self) -> bool {
        self.on_state_change.is_some()
            || self.on_connect.is_some()
            || self.on_disconnect.is_some()
            || self.on_error.is_some()
            || self.on_sequence_mismatch.is_some()
            || self.on_ping_pong_latency.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_state_change(&self, state: ConnectionState) {
        if let Some(cb) = &self.on_state_change {
            cb(state);
        }
    }

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        if let Some(cb) = &self.on_error {
            cb(error);
        }
    }

    pub(crate) fn emit_sequence_mismatch(&self, expected: u64, actual: u64) {
        if let Some(cb) = &self.on_sequence_mismatch {
            cb(expected, actual);
        }
    }

    pub(crate) fn emit_latency(&self, latency: Duration) {
        if let Some(cb) = &self.on_ping_pong_latency {
            cb(latency);
        }
    }
}
