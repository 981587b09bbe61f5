//! Reconnection controller.
//!
//! A single background task owns the active [`Socket`] and keeps the logical
//! realtime connection alive across socket churn. [`ReconnectionController`]
//! is the handle the client uses to talk to it.

use parking_lot::RwLock;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::auth::CredentialsProvider;
use crate::bus::{EventBus, Intake};
use crate::catalog::{ServiceCatalog, MERCURY_SERVICE};
use crate::error::{MercuryError, Result};
use crate::event_handlers::{
    ConnectionError, ConnectionState, DisconnectKind, DisconnectReason, EventHandlers,
};
use crate::models::close_info::{REASON_PONG_MISMATCH, REASON_PONG_MISSING, REASON_RESYNC};
use crate::models::{ClientMessage, CloseInfo, Envelope, MercuryOptions};
use crate::socket::{Socket, SocketEvent};
use crate::timeouts::MercuryTimeouts;

/// Far-future sentinel for disabled deadlines.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

const REASON_DISCONNECT: &str = "Done";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Where the realtime endpoint comes from.
#[derive(Clone)]
pub(crate) enum Endpoint {
    Url(String),
    Catalog(Arc<dyn ServiceCatalog>),
}

impl Endpoint {
    async fn resolve(&self) -> Result<String> {
        match self {
            Endpoint::Url(url) => Ok(url.clone()),
            Endpoint::Catalog(catalog) => catalog.service_url(MERCURY_SERVICE).await,
        }
    }
}

/// Add the registration query flags to `endpoint` and switch `http(s)` to
/// `ws(s)`.
pub(crate) fn prepare_url(endpoint: &str, options: &MercuryOptions) -> Result<String> {
    let mut url = reqwest::Url::parse(endpoint).map_err(|e| {
        MercuryError::ConfigurationError(format!("invalid realtime url '{}': {}", endpoint, e))
    })?;

    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => {
            return Err(MercuryError::ConfigurationError(format!(
                "unsupported realtime url scheme '{}'",
                other
            )))
        },
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme).map_err(|_| {
            MercuryError::ConfigurationError(format!("cannot use {} for '{}'", scheme, endpoint))
        })?;
    }

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("outboundWireFormat", "text");
        if options.shared_registration {
            query.append_pair("mercuryRegistrationStatus", "true");
            query.append_pair("isRegistrationRefreshEnabled", "true");
        } else if options.buffer_states {
            query.append_pair("bufferStates", "true");
        }
        query.append_pair("aliasHttpStatus", "true");
        if options.multiple_connections {
            query.append_pair("multipleConnections", "true");
        }
    }
    Ok(url.into())
}

/// Everything the controller task needs, shared with the client.
pub(crate) struct ControllerConfig {
    pub endpoint: Endpoint,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub options: MercuryOptions,
    pub timeouts: MercuryTimeouts,
    pub handlers: EventHandlers,
    pub bus: Arc<EventBus>,
    pub session_id: String,
}

/// Connectivity flags readable without a round-trip to the task.
#[derive(Default)]
pub(crate) struct ControllerStatus {
    connected: AtomicBool,
    connecting: AtomicBool,
    attempts: AtomicU32,
    has_ever_connected: AtomicBool,
    local_cluster_service_urls: RwLock<Option<Value>>,
}

impl ControllerStatus {
    fn record_registration(&self, envelope: &Envelope) {
        if !envelope.is_registration_status() {
            return;
        }
        if let Some(urls) = envelope.local_cluster_service_urls() {
            *self.local_cluster_service_urls.write() = Some(urls.clone());
        }
    }
}

enum ControlCmd {
    Connect {
        result_tx: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        result_tx: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to the controller task.
pub(crate) struct ReconnectionController {
    cmd_tx: mpsc::UnboundedSender<ControlCmd>,
    status: Arc<ControllerStatus>,
    task: JoinHandle<()>,
}

impl ReconnectionController {
    /// Spawn the controller task. It stays idle until [`connect`](Self::connect).
    pub fn spawn(config: ControllerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let status = Arc::new(ControllerStatus::default());
        let task = tokio::spawn(controller_task(Arc::new(config), status.clone(), cmd_rx));
        Self {
            cmd_tx,
            status,
            task,
        }
    }

    /// Resolves once registered, or with the error that stopped the attempts.
    pub async fn connect(&self) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(ControlCmd::Connect { result_tx })
            .map_err(|_| MercuryError::InvalidState("connection task is not running".into()))?;
        result_rx.await.map_err(|_| {
            MercuryError::Cancelled("connection task exited before registering".into())
        })?
    }

    /// Stop reconnecting and close the active socket. Idempotent.
    pub async fn disconnect(&self) {
        let (result_tx, result_rx) = oneshot::channel();
        if self.cmd_tx.send(ControlCmd::Disconnect { result_tx }).is_ok() {
            let _ = result_rx.await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.connected.load(Ordering::SeqCst)
    }

    pub fn is_connecting(&self) -> bool {
        self.status.connecting.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.status.attempts.load(Ordering::SeqCst)
    }

    pub fn local_cluster_service_urls(&self) -> Option<Value> {
        self.status.local_cluster_service_urls.read().clone()
    }
}

impl Drop for ReconnectionController {
    fn drop(&mut self) {
        if self.cmd_tx.send(ControlCmd::Shutdown).is_err() {
            self.task.abort();
        }
    }
}

// ── Background task ─────────────────────────────────────────────────────────

/// A command that ends whatever the task was waiting on.
enum Interrupt {
    Disconnect(oneshot::Sender<()>),
    Shutdown,
}

/// Socket that completed registration.
struct Registered {
    socket: Socket,
    events: mpsc::UnboundedReceiver<SocketEvent>,
}

enum Attempt {
    Registered(Registered),
    GaveUp(MercuryError),
    Interrupted(Interrupt),
}

enum RunOutcome {
    Reconnect,
    Stopped,
    Interrupted(Interrupt),
}

fn fail_waiters(waiters: &mut Vec<oneshot::Sender<Result<()>>>, err: &MercuryError) {
    for waiter in waiters.drain(..) {
        let _ = waiter.send(Err(err.clone()));
    }
}

/// Drive `fut` to completion while serving commands. `Connect` requests join
/// `waiters`; `Disconnect` and `Shutdown` abandon `fut`.
async fn serve_until<F: Future>(
    fut: F,
    cmd_rx: &mut mpsc::UnboundedReceiver<ControlCmd>,
    waiters: &mut Vec<oneshot::Sender<Result<()>>>,
) -> std::result::Result<F::Output, Interrupt> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => match cmd {
                Some(ControlCmd::Connect { result_tx }) => waiters.push(result_tx),
                Some(ControlCmd::Disconnect { result_tx }) => {
                    return Err(Interrupt::Disconnect(result_tx));
                },
                Some(ControlCmd::Shutdown) | None => return Err(Interrupt::Shutdown),
            },

            output = &mut fut => return Ok(output),
        }
    }
}

async fn controller_task(
    config: Arc<ControllerConfig>,
    status: Arc<ControllerStatus>,
    mut cmd_rx: mpsc::UnboundedReceiver<ControlCmd>,
) {
    let mut waiters: Vec<oneshot::Sender<Result<()>>> = Vec::new();

    'idle: loop {
        match cmd_rx.recv().await {
            Some(ControlCmd::Connect { result_tx }) => waiters.push(result_tx),
            Some(ControlCmd::Disconnect { result_tx }) => {
                let _ = result_tx.send(());
                continue;
            },
            Some(ControlCmd::Shutdown) | None => return,
        }

        status.attempts.store(0, Ordering::SeqCst);
        loop {
            let registered =
                match connect_with_backoff(&config, &status, &mut cmd_rx, &mut waiters).await {
                    Attempt::Registered(registered) => registered,
                    Attempt::GaveUp(err) => {
                        status.connecting.store(false, Ordering::SeqCst);
                        config.handlers.emit_state_change(ConnectionState::Disconnected);
                        fail_waiters(&mut waiters, &err);
                        continue 'idle;
                    },
                    Attempt::Interrupted(interrupt) => {
                        status.connecting.store(false, Ordering::SeqCst);
                        config.handlers.emit_state_change(ConnectionState::Disconnected);
                        fail_waiters(
                            &mut waiters,
                            &MercuryError::Cancelled("disconnect requested".into()),
                        );
                        match interrupt {
                            Interrupt::Disconnect(result_tx) => {
                                let _ = result_tx.send(());
                                continue 'idle;
                            },
                            Interrupt::Shutdown => return,
                        }
                    },
                };

            status.attempts.store(0, Ordering::SeqCst);
            status.connecting.store(false, Ordering::SeqCst);
            status.connected.store(true, Ordering::SeqCst);
            status.has_ever_connected.store(true, Ordering::SeqCst);
            log::info!("[mercury] registered on {}", registered.socket.url());
            config.handlers.emit_state_change(ConnectionState::Connected);
            config.handlers.emit_connect();
            for waiter in waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
            config.bus.set_ready(true);

            match run_connection(&config, &status, registered, &mut cmd_rx).await {
                RunOutcome::Reconnect => continue,
                RunOutcome::Stopped => continue 'idle,
                RunOutcome::Interrupted(Interrupt::Disconnect(result_tx)) => {
                    let _ = result_tx.send(());
                    continue 'idle;
                },
                RunOutcome::Interrupted(Interrupt::Shutdown) => return,
            }
        }
    }
}

/// Attempt to register until it works, the failure is fatal, retries run
/// out, or a command interrupts.
async fn connect_with_backoff(
    config: &ControllerConfig,
    status: &ControllerStatus,
    cmd_rx: &mut mpsc::UnboundedReceiver<ControlCmd>,
    waiters: &mut Vec<oneshot::Sender<Result<()>>>,
) -> Attempt {
    let backoff = config.options.backoff();
    let mut refreshed = false;

    loop {
        status.connecting.store(true, Ordering::SeqCst);
        config.handlers.emit_state_change(ConnectionState::Connecting);

        let err = match serve_until(establish(config, status), cmd_rx, waiters).await {
            Ok(Ok(registered)) => return Attempt::Registered(registered),
            Ok(Err(err)) => err,
            Err(interrupt) => return Attempt::Interrupted(interrupt),
        };

        let mut counted = true;
        if matches!(err, MercuryError::AuthenticationError(_)) && !refreshed {
            refreshed = true;
            log::info!("[mercury] authentication rejected, refreshing credentials");
            match serve_until(config.credentials.refresh(), cmd_rx, waiters).await {
                Ok(Ok(())) => counted = false,
                Ok(Err(e)) => log::warn!("[mercury] credential refresh failed: {}", e),
                Err(interrupt) => return Attempt::Interrupted(interrupt),
            }
        }

        let failures = if counted {
            status.attempts.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            status.attempts.load(Ordering::SeqCst)
        };

        if err.is_fatal() {
            log::error!("[mercury] connection failed permanently: {}", err);
            config
                .handlers
                .emit_error(ConnectionError::new(err.to_string(), false, failures));
            return Attempt::GaveUp(err);
        }
        let limit = config
            .options
            .retry_limit(status.has_ever_connected.load(Ordering::SeqCst));
        if let Some(max) = limit {
            if failures > max {
                log::warn!("[mercury] giving up after {} failed attempts: {}", failures, err);
                config
                    .handlers
                    .emit_error(ConnectionError::new(err.to_string(), false, failures));
                return Attempt::GaveUp(err);
            }
        }
        config
            .handlers
            .emit_error(ConnectionError::new(err.to_string(), true, failures));

        if !counted {
            log::debug!("[mercury] retrying with refreshed credentials");
            continue;
        }

        let delay = backoff.delay_for(failures.saturating_sub(1));
        log::info!(
            "[mercury] attempt {} failed ({}), retrying in {:?}",
            failures,
            err,
            delay
        );
        if let Err(interrupt) = serve_until(tokio::time::sleep(delay), cmd_rx, waiters).await {
            return Attempt::Interrupted(interrupt);
        }
    }
}

/// One registration attempt on a fresh socket.
async fn establish(config: &ControllerConfig, status: &ControllerStatus) -> Result<Registered> {
    let endpoint = config.endpoint.resolve().await?;
    let url = prepare_url(&endpoint, &config.options)?;
    let token = config.credentials.get_access_token().await?;

    let (socket, mut events) = Socket::new(url, &config.timeouts);
    socket.connect().await?;

    let tracking_id = format!("{}_{}", config.session_id, now_ms());
    socket.send(&ClientMessage::authorization(token, tracking_id))?;
    log::debug!("[mercury] authorization sent, awaiting registration");

    let registration = async {
        loop {
            match events.recv().await {
                Some(SocketEvent::Message(envelope)) if envelope.is_registration() => {
                    status.record_registration(&envelope);
                    return Ok(());
                },
                Some(SocketEvent::Message(envelope)) => {
                    if config.bus.receive(envelope) == Intake::Overflow {
                        log::warn!("[mercury] event buffer overflowed during registration");
                        let _ = socket.close(1000, REASON_RESYNC);
                        return Err(MercuryError::TransportError(
                            "event buffer overflowed during registration".into(),
                        ));
                    }
                },
                Some(SocketEvent::Pong(_)) => {},
                Some(SocketEvent::SequenceMismatch { expected, actual }) => {
                    config.handlers.emit_sequence_mismatch(expected, actual);
                },
                Some(SocketEvent::Malformed { error, .. }) => {
                    return Err(MercuryError::ProtocolError(format!(
                        "malformed frame during registration: {}",
                        error
                    )));
                },
                Some(SocketEvent::Error(message)) => {
                    log::warn!("[mercury] socket error during registration: {}", message);
                },
                Some(SocketEvent::Closed(info)) => return Err(info.handshake_error()),
                None => {
                    return Err(MercuryError::TransportError(
                        "socket event channel closed".into(),
                    ))
                },
            }
        }
    };

    let timeout = config.timeouts.registration_timeout;
    let result = if timeout.is_zero() {
        registration.await
    } else {
        match tokio::time::timeout(timeout, registration).await {
            Ok(result) => result,
            Err(_) => Err(MercuryError::TimeoutError(format!(
                "no registration within {:?}",
                timeout
            ))),
        }
    };

    match result {
        Ok(()) => Ok(Registered { socket, events }),
        Err(e) => {
            let _ = socket.close(1000, REASON_DISCONNECT);
            Err(e)
        },
    }
}

/// Serve a registered socket until it closes.
async fn run_connection(
    config: &ControllerConfig,
    status: &ControllerStatus,
    registered: Registered,
    cmd_rx: &mut mpsc::UnboundedReceiver<ControlCmd>,
) -> RunOutcome {
    let Registered { socket, mut events } = registered;
    let timeouts = &config.timeouts;

    let mut ping_deadline = timeouts.pings_enabled().then(Instant::now);
    let mut pong_deadline: Option<Instant> = None;
    let mut pending_ping: Option<(String, Instant)> = None;
    let mut disconnect_tx: Option<oneshot::Sender<()>> = None;

    let close = |code: u16, reason: &str| {
        log::info!("[mercury] closing socket: {} ({})", reason, code);
        if let Err(e) = socket.close(code, reason) {
            log::warn!("[mercury] close failed: {}", e);
        }
    };

    let info = loop {
        let far = Instant::now() + FAR_FUTURE;
        let ping_sleep = sleep_until(ping_deadline.unwrap_or(far));
        let pong_sleep = sleep_until(pong_deadline.unwrap_or(far));

        tokio::select! {
            biased;

            cmd = cmd_rx.recv(), if disconnect_tx.is_none() => match cmd {
                Some(ControlCmd::Connect { result_tx }) => {
                    let _ = result_tx.send(Ok(()));
                },
                Some(ControlCmd::Disconnect { result_tx }) => {
                    disconnect_tx = Some(result_tx);
                    ping_deadline = None;
                    pong_deadline = None;
                    close(1000, REASON_DISCONNECT);
                },
                Some(ControlCmd::Shutdown) | None => {
                    status.connected.store(false, Ordering::SeqCst);
                    config.bus.set_ready(false);
                    close(1000, REASON_DISCONNECT);
                    return RunOutcome::Interrupted(Interrupt::Shutdown);
                },
            },

            event = events.recv() => match event {
                Some(SocketEvent::Message(envelope)) => {
                    if envelope.is_registration() {
                        status.record_registration(&envelope);
                        log::debug!("[mercury] registration refreshed");
                        continue;
                    }
                    if config.bus.receive(envelope) == Intake::Overflow {
                        log::warn!("[mercury] event buffer overflowed, resynchronizing");
                        close(1000, REASON_RESYNC);
                    }
                },
                Some(SocketEvent::Pong(envelope)) => match pending_ping.take() {
                    Some((id, sent_at)) if envelope.id.as_deref() == Some(id.as_str()) => {
                        config.handlers.emit_latency(sent_at.elapsed());
                        pong_deadline = None;
                        ping_deadline = Some(Instant::now() + timeouts.ping_interval);
                    },
                    Some((id, _)) => {
                        log::warn!(
                            "[mercury] pong {:?} does not match ping {}",
                            envelope.id,
                            id
                        );
                        pong_deadline = None;
                        close(1000, REASON_PONG_MISMATCH);
                    },
                    None => log::debug!("[mercury] unsolicited pong"),
                },
                Some(SocketEvent::SequenceMismatch { expected, actual }) => {
                    log::debug!("[mercury] sequence mismatch: expected {}, got {}", expected, actual);
                    config.handlers.emit_sequence_mismatch(expected, actual);
                },
                Some(SocketEvent::Malformed { error, .. }) => {
                    log::warn!("[mercury] ignoring malformed frame: {}", error);
                },
                Some(SocketEvent::Error(message)) => {
                    log::warn!("[mercury] socket error: {}", message);
                },
                Some(SocketEvent::Closed(info)) => break info,
                None => break CloseInfo::abnormal("socket event channel closed"),
            },

            _ = ping_sleep, if ping_deadline.is_some() => {
                ping_deadline = None;
                let id = uuid::Uuid::new_v4().to_string();
                match socket.send(&ClientMessage::ping(id.clone())) {
                    Ok(()) => {
                        pending_ping = Some((id, Instant::now()));
                        pong_deadline = Some(Instant::now() + timeouts.pong_timeout);
                    },
                    Err(e) => log::warn!("[mercury] ping failed: {}", e),
                }
            }

            _ = pong_sleep, if pong_deadline.is_some() => {
                pong_deadline = None;
                pending_ping = None;
                log::warn!("[mercury] no pong within {:?}", timeouts.pong_timeout);
                close(1000, REASON_PONG_MISSING);
            }
        }
    };

    status.connected.store(false, Ordering::SeqCst);
    config.bus.set_ready(false);

    if let Some(result_tx) = disconnect_tx {
        log::info!("[mercury] disconnected on request");
        config.handlers.emit_disconnect(DisconnectReason::with_code(
            info.reason.clone(),
            info.code,
            DisconnectKind::Requested,
        ));
        config.handlers.emit_state_change(ConnectionState::Disconnected);
        return RunOutcome::Interrupted(Interrupt::Disconnect(result_tx));
    }

    let kind = info.disconnect_kind();
    log::info!("[mercury] socket closed: {} ({:?})", info, kind);
    config
        .handlers
        .emit_disconnect(DisconnectReason::with_code(info.reason.clone(), info.code, kind));
    config.handlers.emit_state_change(ConnectionState::Disconnected);

    if kind == DisconnectKind::Transient && config.options.auto_reconnect {
        RunOutcome::Reconnect
    } else {
        RunOutcome::Stopped
    }
}
