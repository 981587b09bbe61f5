use serde::{Deserialize, Serialize};

/// Token carried by an [`ClientMessage::Authorization`] frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationData {
    pub token: String,
}

/// Client-to-server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame on every new socket. The server answers with a
    /// registration acknowledgement or closes the socket.
    Authorization {
        id: String,
        data: AuthorizationData,
        #[serde(rename = "trackingId")]
        tracking_id: String,
    },

    /// Liveness check; the server echoes the id in a `pong` frame.
    Ping { id: String },

    /// Acknowledges receipt of an inbound frame.
    Ack {
        #[serde(rename = "messageId")]
        message_id: String,
    },
}

impl ClientMessage {
    pub fn authorization(token: impl Into<String>, tracking_id: impl Into<String>) -> Self {
        ClientMessage::Authorization {
            id: uuid::Uuid::new_v4().to_string(),
            data: AuthorizationData {
                token: token.into(),
            },
            tracking_id: tracking_id.into(),
        }
    }

    pub fn ping(id: impl Into<String>) -> Self {
        ClientMessage::Ping { id: id.into() }
    }

    pub fn ack(message_id: impl Into<String>) -> Self {
        ClientMessage::Ack {
            message_id: message_id.into(),
        }
    }
}
