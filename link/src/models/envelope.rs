use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Event type of the first message the server sends after a successful
/// authorization when buffer states are requested.
pub const BUFFER_STATE_EVENT: &str = "mercury.buffer_state";

/// Event type of the registration acknowledgement used with shared
/// registrations.
pub const REGISTRATION_STATUS_EVENT: &str = "mercury.registration_status";

/// Inbound server frame.
///
/// Application events carry no `type`; control frames (`pong`, ...) do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Monotonic per-stream counter. Servers send it as a number or as a
    /// numeric string.
    #[serde(
        default,
        deserialize_with = "deserialize_sequence",
        skip_serializing_if = "Option::is_none"
    )]
    pub sequence_number: Option<u64>,

    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    /// Logical stream the sequence number belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,

    /// Event payload. `data.headers` may carry dotted-path overrides
    /// (`activity.target.id`) that are applied to `data` before delivery.
    #[serde(default)]
    pub data: Value,
}

fn deserialize_sequence<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid sequence number {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid sequence number '{}'", s))),
        Some(other) => Err(serde::de::Error::custom(format!(
            "invalid sequence number {}",
            other
        ))),
    }
}

impl Envelope {
    /// Build an application event with the given event type and payload
    /// merged into `data`.
    pub fn event(event_type: &str, mut data: Value) -> Self {
        if let Value::Object(map) = &mut data {
            map.insert("eventType".to_string(), Value::String(event_type.to_string()));
        } else {
            data = serde_json::json!({ "eventType": event_type });
        }
        Self {
            id: None,
            sequence_number: None,
            message_type: None,
            stream: None,
            data,
        }
    }

    pub fn with_sequence(mut self, seq: u64) -> Self {
        self.sequence_number = Some(seq);
        self
    }

    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// `data.eventType`, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.data.get("eventType").and_then(Value::as_str)
    }

    /// Namespace of the event type (the part before the first `.`).
    pub fn namespace(&self) -> Option<&str> {
        self.event_type().map(|t| t.split('.').next().unwrap_or(t))
    }

    pub fn is_pong(&self) -> bool {
        self.message_type.as_deref() == Some("pong")
    }

    /// Registration acknowledgement: an untyped frame whose event type is the
    /// buffer-state or registration-status event.
    pub fn is_registration(&self) -> bool {
        self.message_type.is_none()
            && matches!(
                self.event_type(),
                Some(BUFFER_STATE_EVENT) | Some(REGISTRATION_STATUS_EVENT)
            )
    }

    pub fn is_registration_status(&self) -> bool {
        self.message_type.is_none() && self.event_type() == Some(REGISTRATION_STATUS_EVENT)
    }

    /// `data.localClusterServiceUrls` of a registration-status frame.
    pub fn local_cluster_service_urls(&self) -> Option<&Value> {
        self.data.get("localClusterServiceUrls")
    }

    /// Apply each entry of `data.headers` as a dotted-path assignment into
    /// `data`.
    pub fn apply_header_overrides(&mut self) {
        let Some(Value::Object(headers)) = self.data.get("headers").cloned() else {
            return;
        };
        for (path, value) in headers {
            set_path(&mut self.data, &path, value);
        }
    }
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut cursor = target;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Value::Object(map) = cursor else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        cursor = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
