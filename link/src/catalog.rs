//! Endpoint discovery collaborator.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::{MercuryError, Result};

/// Service name the realtime client resolves when no explicit URL is given.
pub const MERCURY_SERVICE: &str = "mercury";

/// Resolves a logical service name to a live base URL.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    async fn service_url(&self, name: &str) -> Result<String>;
}

/// A catalog backed by a fixed map.
#[derive(Debug, Clone, Default)]
pub struct StaticServiceCatalog {
    services: HashMap<String, String>,
}

impl StaticServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.services.insert(name.into(), url.into());
        self
    }
}

#[async_trait]
impl ServiceCatalog for StaticServiceCatalog {
    async fn service_url(&self, name: &str) -> Result<String> {
        self.services.get(name).cloned().ok_or_else(|| {
            MercuryError::ConfigurationError(format!("no URL registered for service '{}'", name))
        })
    }
}
