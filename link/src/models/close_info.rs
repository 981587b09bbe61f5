use std::fmt;

use crate::error::MercuryError;
use crate::event_handlers::DisconnectKind;

/// Close reasons (lowercased) that mean "reconnect" when paired with 1000.
const NORMAL_RECONNECT_REASONS: &[&str] = &[
    "idle",
    "done (forced)",
    "pong not received",
    "pong mismatch",
    "resync",
];

pub(crate) const REASON_FORCED: &str = "Done (forced)";
pub(crate) const REASON_PONG_MISSING: &str = "Pong not received";
pub(crate) const REASON_PONG_MISMATCH: &str = "Pong mismatch";
pub(crate) const REASON_RESYNC: &str = "resync";

/// Close code and reason reported when a socket closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Abnormal closure: the connection dropped without a close frame.
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(1006, reason)
    }

    /// Servers that cannot send 4xxx codes close with 1005 and a well-known
    /// reason instead. Map those back to the codes the rest of the client
    /// understands.
    pub fn normalized(mut self) -> Self {
        if self.code == 1005 && !self.reason.is_empty() {
            let reason = self.reason.to_lowercase();
            if reason == "replaced" {
                self.code = 4000;
            } else if reason == "authentication failed"
                || reason.starts_with("authentication did not happen within the timeout window")
            {
                self.code = 1008;
            }
        }
        self
    }

    /// Classification of a close that ended a live connection.
    pub fn disconnect_kind(&self) -> DisconnectKind {
        match self.code {
            1001 | 1005 | 1006 | 1011 => DisconnectKind::Transient,
            1000 if NORMAL_RECONNECT_REASONS.contains(&self.reason.to_lowercase().as_str()) => {
                DisconnectKind::Transient
            }
            4000 => DisconnectKind::Replaced,
            _ => DisconnectKind::Permanent,
        }
    }

    /// Error for a close that happened before registration completed.
    pub fn handshake_error(&self) -> MercuryError {
        let detail = format!("socket closed during handshake: {}", self);
        match self.code {
            4401 | 1008 => MercuryError::AuthenticationError(detail),
            4400 | 4403 => MercuryError::ProtocolError(detail),
            _ => MercuryError::TransportError(detail),
        }
    }
}

impl fmt::Display for CloseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "code {}", self.code)
        } else {
            write!(f, "code {} ({})", self.code, self.reason)
        }
    }
}

/// Whether `code` may be sent in a locally initiated close frame.
pub(crate) fn is_valid_close_code(code: u16) -> bool {
    code == 1000 || (3000..=4999).contains(&code)
}
