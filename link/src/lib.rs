//! # mercury-link: realtime events and request batching
//!
//! Client-side core for the collaboration platform's Mercury event service.
//!
//! ## Features
//!
//! - **Realtime connection**: authenticated WebSocket registration with
//!   automatic reconnection and capped exponential backoff
//! - **Ordered delivery**: buffered, sequence-ordered and deduplicated events
//!   across reconnects
//! - **Liveness**: application-level ping/pong with latency reporting
//! - **Request batching**: many small lookups coalesced into bulk HTTP calls,
//!   with per-item results and fingerprint deduplication
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mercury_link::{EventHandlers, MercuryClient, MercuryOptions, StaticToken};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = MercuryClient::builder()
//!         .url("wss://mercury.example.com/v1/apps/wx2/registrations")
//!         .credentials(Arc::new(StaticToken::new("access-token")))
//!         .options(MercuryOptions::default().with_max_retries(Some(10)))
//!         .event_handlers(
//!             EventHandlers::new().on_disconnect(|reason| eprintln!("offline: {}", reason)),
//!         )
//!         .build()?;
//!
//!     client.on("event", |envelope| {
//!         println!("{:?}: {}", envelope.event_type(), envelope.data);
//!     });
//!     client.connect().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     client.disconnect().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod batcher;
pub mod bus;
pub mod catalog;
pub mod client;
mod connection;
pub mod emitter;
pub mod error;
pub mod event_handlers;
pub mod http;
pub mod models;
pub mod one_flight;
pub mod socket;
pub mod timeouts;

// Re-export main types for convenience
pub use auth::{CredentialsProvider, StaticToken};
pub use backoff::{Backoff, BackoffTimer};
pub use batcher::{BatchHandle, BatchHandler, Batcher, ItemOutcome};
pub use bus::{EventBus, Intake};
pub use catalog::{ServiceCatalog, StaticServiceCatalog};
pub use client::{MercuryClient, MercuryClientBuilder};
pub use emitter::{transfer_events, Emitter, EventSink, Listener, ListenerId};
pub use error::{MercuryError, Result};
pub use event_handlers::{
    ConnectionError, ConnectionState, DisconnectKind, DisconnectReason, EventHandlers,
};
pub use http::{
    HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, HttpTarget, ReqwestHttpClient,
};
pub use models::{
    BatcherOptions, ClientMessage, CloseInfo, Envelope, MercuryOptions, OverflowPolicy,
};
pub use one_flight::OneFlight;
pub use socket::{Socket, SocketEvent, SocketState};
pub use timeouts::{MercuryTimeouts, MercuryTimeoutsBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
