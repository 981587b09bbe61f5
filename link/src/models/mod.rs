//! Wire frames and configuration types for mercury-link.

pub mod batcher_options;
pub mod client_message;
pub mod close_info;
pub mod connection_options;
pub mod envelope;

pub use batcher_options::BatcherOptions;
pub use client_message::{AuthorizationData, ClientMessage};
pub use close_info::CloseInfo;
pub use connection_options::{MercuryOptions, OverflowPolicy};
pub use envelope::{Envelope, BUFFER_STATE_EVENT, REGISTRATION_STATUS_EVENT};
