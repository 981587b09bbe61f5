//! HTTP collaborator used by the batcher.
//!
//! [`HttpClient`] is the seam: tests and embedders plug in their own
//! transport, while [`ReqwestHttpClient`] is the default implementation.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::auth::CredentialsProvider;
use crate::catalog::ServiceCatalog;

/// HTTP method of an [`HttpRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// Where an [`HttpRequest`] goes: a full URI, or a service resolved through
/// the [`ServiceCatalog`] plus a resource path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpTarget {
    Uri(String),
    Service { service: String, resource: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub target: HttpTarget,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, target: HttpTarget) -> Self {
        Self {
            method,
            target,
            headers: HashMap::new(),
            body: None,
        }
    }

    /// `POST` to `resource` on the catalogued `service`.
    pub fn post_service(service: impl Into<String>, resource: impl Into<String>) -> Self {
        Self::new(
            HttpMethod::Post,
            HttpTarget::Service {
                service: service.into(),
                resource: resource.into(),
            },
        )
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status_code: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status_code: u16, body: Value) -> Self {
        Self {
            status_code,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// `retry-after` in seconds, if present and numeric.
    pub fn retry_after(&self) -> Option<Duration> {
        retry_after(&self.headers)
    }
}

fn retry_after(headers: &HashMap<String, String>) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Failure of an HTTP call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HttpError {
    /// No response was obtained at all.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with a non-success status.
    #[error("HTTP {status_code}: {body}")]
    Status {
        status_code: u16,
        headers: HashMap<String, String>,
        body: Value,
    },
}

impl HttpError {
    pub fn status(status_code: u16, body: Value) -> Self {
        Self::Status {
            status_code,
            headers: HashMap::new(),
            body,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Network(_) => None,
            Self::Status { status_code, .. } => Some(*status_code),
        }
    }

    /// `retry-after` of a status error, in seconds.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Network(_) => None,
            Self::Status { headers, .. } => retry_after(headers),
        }
    }
}

/// Issues one HTTP request and returns the response or a typed error.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// [`HttpClient`] on top of `reqwest`.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    http: reqwest::Client,
    catalog: Option<Arc<dyn ServiceCatalog>>,
    credentials: Option<Arc<dyn CredentialsProvider>>,
}

impl std::fmt::Debug for ReqwestHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestHttpClient")
            .field("catalog", &self.catalog.is_some())
            .field("credentials", &self.credentials.is_some())
            .finish()
    }
}

impl ReqwestHttpClient {
    /// Build a client with the given per-request timeout.
    pub fn new(timeout: Duration) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::MercuryError::ConfigurationError(e.to_string()))?;
        Ok(Self::with_client(http))
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            catalog: None,
            credentials: None,
        }
    }

    pub fn service_catalog(mut self, catalog: Arc<dyn ServiceCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Attach `Authorization` to every request using this provider.
    pub fn credentials(mut self, credentials: Arc<dyn CredentialsProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    async fn resolve_url(&self, target: &HttpTarget) -> Result<String, HttpError> {
        match target {
            HttpTarget::Uri(uri) => Ok(uri.clone()),
            HttpTarget::Service { service, resource } => {
                let catalog = self.catalog.as_ref().ok_or_else(|| {
                    HttpError::Network(format!(
                        "no service catalog configured to resolve '{}'",
                        service
                    ))
                })?;
                let base = catalog
                    .service_url(service)
                    .await
                    .map_err(|e| HttpError::Network(e.to_string()))?;
                Ok(format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    resource.trim_start_matches('/')
                ))
            },
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let url = self.resolve_url(&request.target).await?;
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
            HttpMethod::Put => self.http.put(&url),
            HttpMethod::Delete => self.http.delete(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credentials) = &self.credentials {
            let token = credentials
                .get_access_token()
                .await
                .map_err(|e| HttpError::Network(e.to_string()))?;
            builder = builder.header("Authorization", authorization_value(&token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        log::debug!("[batcher] {:?} {}", request.method, url);
        let response = builder
            .send()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;

        let status_code = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| HttpError::Network(e.to_string()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if (200..300).contains(&status_code) {
            Ok(HttpResponse {
                status_code,
                headers,
                body,
            })
        } else {
            Err(HttpError::Status {
                status_code,
                headers,
                body,
            })
        }
    }
}

/// Tokens that already carry a scheme are sent as-is.
fn authorization_value(token: &str) -> String {
    if token.contains(' ') {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}
