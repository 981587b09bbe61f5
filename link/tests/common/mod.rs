#![allow(dead_code)]
//! In-process fake Mercury server for realtime integration tests.
//!
//! Each accepted connection reads the client's authorization frame and then
//! plays one [`Step`] script. Connection `n` uses script `n`, or the last
//! script once they run out.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mercury_link::{CredentialsProvider, MercuryError, MercuryTimeouts, Result};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum Step {
    /// Acknowledge registration with a buffer-state frame.
    Register,
    /// Send this JSON frame.
    Send(Value),
    /// Close with a code and reason.
    Close(u16, &'static str),
    /// Drop the TCP connection without a close frame.
    Drop,
    /// Answer pings until the client goes away.
    Serve,
    /// Read frames without answering anything.
    Ignore,
}

/// Application event with a sequence number.
pub fn event(seq: u64, event_type: &str) -> Value {
    json!({
        "id": format!("msg-{}", seq),
        "sequenceNumber": seq,
        "data": {"eventType": event_type, "seq": seq},
    })
}

pub struct FakeMercury {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeMercury {
    pub async fn start(scripts: Vec<Vec<Step>>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake mercury listener");
        let addr = listener.local_addr().expect("listener address");
        let connections = Arc::new(AtomicUsize::new(0));
        let tokens = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let connections = connections.clone();
            let tokens = tokens.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let index = connections.fetch_add(1, Ordering::SeqCst);
                    let steps = scripts
                        .get(index)
                        .or_else(|| scripts.last())
                        .cloned()
                        .unwrap_or_default();
                    tokio::spawn(serve_connection(stream, steps, tokens.clone()));
                }
            })
        };

        Self {
            addr,
            connections,
            tokens,
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/apps/wx2/registrations", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Tokens presented in authorization frames, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().clone()
    }
}

impl Drop for FakeMercury {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: &Value) -> bool {
    ws.send(Message::Text(value.to_string().into())).await.is_ok()
}

async fn serve_connection(stream: TcpStream, steps: Vec<Step>, tokens: Arc<Mutex<Vec<String>>>) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    match ws.next().await {
        Some(Ok(Message::Text(text))) => {
            let auth: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
            assert_eq!(auth["type"], "authorization");
            tokens
                .lock()
                .push(auth["data"]["token"].as_str().unwrap_or_default().to_string());
        },
        _ => return,
    }

    for step in steps {
        match step {
            Step::Register => {
                let frame = json!({"data": {"eventType": "mercury.buffer_state"}});
                if !send_json(&mut ws, &frame).await {
                    return;
                }
            },
            Step::Send(frame) => {
                if !send_json(&mut ws, &frame).await {
                    return;
                }
            },
            Step::Close(code, reason) => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.to_string().into(),
                };
                let _ = ws.close(Some(frame)).await;
                while let Some(Ok(_)) = ws.next().await {}
                return;
            },
            Step::Drop => return,
            Step::Serve => {
                while let Some(Ok(message)) = ws.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
                    if frame["type"] == "ping" {
                        let pong = json!({"type": "pong", "id": frame["id"]});
                        if !send_json(&mut ws, &pong).await {
                            return;
                        }
                    }
                }
                return;
            },
            Step::Ignore => {
                while let Some(Ok(_)) = ws.next().await {}
                return;
            },
        }
    }
}

/// Credentials whose token changes on every refresh: `token-0`, `token-1`, ...
#[derive(Default)]
pub struct RotatingToken {
    version: AtomicUsize,
    refresh_fails: bool,
}

impl RotatingToken {
    pub fn failing_refresh() -> Self {
        Self {
            version: AtomicUsize::new(0),
            refresh_fails: true,
        }
    }

    pub fn refreshes(&self) -> usize {
        self.version.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialsProvider for RotatingToken {
    async fn get_access_token(&self) -> Result<String> {
        Ok(format!("token-{}", self.version.load(Ordering::SeqCst)))
    }

    async fn refresh(&self) -> Result<()> {
        if self.refresh_fails {
            return Err(MercuryError::AuthenticationError("refresh rejected".into()));
        }
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn test_timeouts() -> MercuryTimeouts {
    MercuryTimeouts::builder()
        .connection_timeout_secs(5)
        .registration_timeout_secs(5)
        .force_close_delay(Duration::from_millis(300))
        .build()
}

/// Poll `condition` every 10ms until it holds or [`TEST_TIMEOUT`] passes.
pub async fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
