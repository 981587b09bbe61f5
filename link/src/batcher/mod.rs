//! Request batching.
//!
//! Individual calls are queued and flushed as one bulk HTTP request when the
//! queue goes quiet, grows too large, or has been waiting too long. Each
//! caller gets back only its own item's outcome.

mod fingerprint;
mod handler;
mod scheduler;

pub use fingerprint::{FingerprintCache, Lookup};
pub use handler::{BatchHandler, ItemOutcome};
pub use scheduler::{BatchHandle, Batcher};
