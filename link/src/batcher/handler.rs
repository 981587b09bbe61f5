//! Per-resource hooks for a [`Batcher`](super::Batcher).

use crate::error::Result;
use crate::http::{HttpRequest, HttpResponse};

/// Outcome for one fingerprint extracted from a bulk response.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome<T> {
    pub fingerprint: String,
    /// `Err` carries the server's reason for rejecting this item.
    pub result: std::result::Result<T, String>,
}

impl<T> ItemOutcome<T> {
    pub fn success(fingerprint: impl Into<String>, value: T) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            result: Ok(value),
        }
    }

    pub fn failure(fingerprint: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            result: Err(reason.into()),
        }
    }
}

/// Describes one bulk endpoint: how items are identified, how a batch is
/// encoded, and how the response maps back to items.
///
/// # Example
///
/// ```rust
/// use mercury_link::batcher::{BatchHandler, ItemOutcome};
/// use mercury_link::{HttpRequest, HttpResponse, MercuryError, Result};
/// use serde_json::json;
///
/// #[derive(Clone)]
/// struct AvatarLookup { uuid: String, size: u32 }
///
/// struct AvatarHandler;
///
/// impl BatchHandler for AvatarHandler {
///     type Item = AvatarLookup;
///     type Output = String;
///
///     fn fingerprint_request(&self, item: &AvatarLookup) -> Result<String> {
///         if item.uuid.is_empty() {
///             return Err(MercuryError::ConfigurationError("uuid is required".into()));
///         }
///         Ok(format!("{}-{}", item.uuid, item.size))
///     }
///
///     fn prepare_request(&self, items: &[AvatarLookup]) -> Result<HttpRequest> {
///         let body: Vec<_> = items.iter().map(|i| json!({"uuid": i.uuid, "sizes": [i.size]})).collect();
///         Ok(HttpRequest::post_service("avatar", "profiles/urls").with_body(json!(body)))
///     }
///
///     fn accept_response(&self, response: HttpResponse) -> Result<Vec<ItemOutcome<String>>> {
///         let mut outcomes = Vec::new();
///         if let Some(map) = response.body.as_object() {
///             for (uuid, sizes) in map {
///                 if let Some(sizes) = sizes.as_object() {
///                     for (size, entry) in sizes {
///                         let url = entry["url"].as_str().unwrap_or_default().to_string();
///                         outcomes.push(ItemOutcome::success(format!("{}-{}", uuid, size), url));
///                     }
///                 }
///             }
///         }
///         Ok(outcomes)
///     }
/// }
/// ```
pub trait BatchHandler: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Identity of an item for deduplication. An error rejects the item
    /// before it is queued.
    fn fingerprint_request(&self, item: &Self::Item) -> Result<String>;

    /// Build the bulk request for `items`, in queue order.
    fn prepare_request(&self, items: &[Self::Item]) -> Result<HttpRequest>;

    /// Split a successful bulk response into per-item outcomes.
    fn accept_response(&self, response: HttpResponse) -> Result<Vec<ItemOutcome<Self::Output>>>;

    /// When `true`, a successful response only confirms receipt; outcomes
    /// arrive later through [`Batcher::accept_out_of_band`](super::Batcher::accept_out_of_band).
    fn out_of_band(&self) -> bool {
        false
    }
}
