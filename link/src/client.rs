//! Realtime client facade.

use serde_json::Value;
use std::sync::Arc;

use crate::auth::CredentialsProvider;
use crate::bus::EventBus;
use crate::catalog::ServiceCatalog;
use crate::connection::{ControllerConfig, Endpoint, ReconnectionController};
use crate::emitter::{EventSink, ListenerId};
use crate::error::{MercuryError, Result};
use crate::event_handlers::EventHandlers;
use crate::models::{Envelope, MercuryOptions};
use crate::one_flight::OneFlight;
use crate::timeouts::MercuryTimeouts;

/// Realtime connection to the Mercury event service.
///
/// Use [`MercuryClientBuilder`] to construct instances.
///
/// # Examples
///
/// ```rust,no_run
/// use mercury_link::{MercuryClient, StaticToken};
/// use std::sync::Arc;
///
/// # async fn example() -> mercury_link::Result<()> {
/// let client = MercuryClient::builder()
///     .url("wss://mercury.example.com/v1/apps/wx2/registrations")
///     .credentials(Arc::new(StaticToken::new("token")))
///     .build()?;
///
/// client.on("event:conversation.activity", |envelope| {
///     println!("activity: {}", envelope.data);
/// });
/// client.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct MercuryClient {
    session_id: String,
    bus: Arc<EventBus>,
    controller: Arc<ReconnectionController>,
    connect_flight: OneFlight<Result<()>>,
    disconnect_flight: OneFlight<()>,
}

impl std::fmt::Debug for MercuryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MercuryClient")
            .field("session_id", &self.session_id)
            .field("connected", &self.is_connected())
            .field("connecting", &self.is_connecting())
            .finish()
    }
}

impl MercuryClient {
    pub fn builder() -> MercuryClientBuilder {
        MercuryClientBuilder::new()
    }

    /// Connect and wait for registration.
    ///
    /// Resolves immediately when already connected. Concurrent calls share
    /// one attempt.
    pub async fn connect(&self) -> Result<()> {
        if self.controller.is_connected() {
            return Ok(());
        }
        let controller = self.controller.clone();
        self.connect_flight
            .run(move || async move { controller.connect().await })
            .await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Idempotent. Sequence history is cleared, so the next `connect()`
    /// starts a new logical session.
    pub async fn disconnect(&self) {
        let controller = self.controller.clone();
        let bus = self.bus.clone();
        self.disconnect_flight
            .run(move || async move {
                controller.disconnect().await;
                bus.reset();
            })
            .await
    }

    /// Subscribe to `name`: `event`, `event:<namespace>` or
    /// `event:<eventType>`.
    pub fn on(&self, name: &str, listener: impl Fn(&Envelope) + Send + Sync + 'static) -> ListenerId {
        self.bus.on(name, Arc::new(listener))
    }

    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.bus.off(name, id)
    }

    /// The event sink listeners are registered on, for
    /// [`transfer_events`](crate::transfer_events).
    pub fn events(&self) -> Arc<dyn EventSink<Envelope>> {
        self.bus.sink()
    }

    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    pub fn is_connecting(&self) -> bool {
        self.controller.is_connecting()
    }

    /// Consecutive failed attempts since the last registration.
    pub fn reconnect_attempts(&self) -> u32 {
        self.controller.reconnect_attempts()
    }

    /// Hold (`false`) or release (`true`) delivery to listeners.
    pub fn set_ready(&self, ready: bool) {
        self.bus.set_ready(ready);
    }

    /// `localClusterServiceUrls` from the latest registration status.
    pub fn local_cluster_service_urls(&self) -> Option<Value> {
        self.controller.local_cluster_service_urls()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// Builder for [`MercuryClient`].
pub struct MercuryClientBuilder {
    endpoint: Option<Endpoint>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
    options: MercuryOptions,
    timeouts: MercuryTimeouts,
    event_handlers: EventHandlers,
}

impl MercuryClientBuilder {
    fn new() -> Self {
        Self {
            endpoint: None,
            credentials: None,
            options: MercuryOptions::default(),
            timeouts: MercuryTimeouts::default(),
            event_handlers: EventHandlers::default(),
        }
    }

    /// Connect to this URL instead of resolving the `mercury` service.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(Endpoint::Url(url.into()));
        self
    }

    /// Resolve the realtime endpoint through `catalog` on every attempt.
    pub fn service_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.endpoint = Some(Endpoint::Catalog(catalog));
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn options(mut self, options: MercuryOptions) -> Self {
        self.options = options;
        self
    }

    pub fn timeouts(mut self, timeouts: MercuryTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn event_handlers(mut self, handlers: EventHandlers) -> Self {
        self.event_handlers = handlers;
        self
    }

    /// Build the client. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<MercuryClient> {
        let endpoint = self.endpoint.ok_or_else(|| {
            MercuryError::ConfigurationError("either url or service_catalog is required".into())
        })?;
        let credentials = self
            .credentials
            .ok_or_else(|| MercuryError::ConfigurationError("credentials are required".into()))?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let bus = Arc::new(EventBus::new(
            self.options.buffer_capacity,
            self.options.overflow_policy,
        ));
        let controller = ReconnectionController::spawn(ControllerConfig {
            endpoint,
            credentials,
            options: self.options,
            timeouts: self.timeouts,
            handlers: self.event_handlers,
            bus: bus.clone(),
            session_id: session_id.clone(),
        });

        Ok(MercuryClient {
            session_id,
            bus,
            controller: Arc::new(controller),
            connect_flight: OneFlight::new(),
            disconnect_flight: OneFlight::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticToken;

    #[test]
    fn test_build_requires_endpoint_and_credentials() {
        let err = MercuryClient::builder()
            .credentials(Arc::new(StaticToken::new("t")))
            .build()
            .unwrap_err();
        assert!(matches!(err, MercuryError::ConfigurationError(_)));

        let err = MercuryClient::builder()
            .url("wss://mercury.example.com")
            .build()
            .unwrap_err();
        assert!(matches!(err, MercuryError::ConfigurationError(_)));
    }

    #[tokio::test]
    async fn test_fresh_client_is_idle() {
        let client = MercuryClient::builder()
            .url("wss://mercury.example.com")
            .credentials(Arc::new(StaticToken::new("t")))
            .build()
            .unwrap();
        assert!(!client.is_connected());
        assert!(!client.is_connecting());
        assert_eq!(client.reconnect_attempts(), 0);
        assert!(client.local_cluster_service_urls().is_none());
        assert_eq!(client.session_id().len(), 36);

        client.disconnect().await;
        client.disconnect().await;
        assert!(!client.is_connected());
    }
}
