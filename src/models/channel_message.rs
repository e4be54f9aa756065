use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Lifecycle phase of a watched resource, as reported on a channel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventPhase {
    /// A resource was created.
    Added,
    /// An existing resource changed.
    Modified,
    /// A resource was removed.
    Deleted,
    /// The server reported a watch error for this channel.
    Error,
}

/// One event published on a subscribed channel.
///
/// The payload shape depends on the channel (pod status, workspace event,
/// log line, ...); the gateway passes it through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    /// What happened to the watched resource.
    #[serde(rename = "eventPhase")]
    pub event_phase: EventPhase,

    /// Channel-specific payload fields, passed through verbatim.
    #[serde(flatten)]
    pub payload: Map<String, JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_with_payload() {
        let msg: ChannelMessage = serde_json::from_value(json!({
            "eventPhase": "MODIFIED",
            "workspace": "ws-1",
            "status": "RUNNING",
        }))
        .unwrap();
        assert_eq!(msg.event_phase, EventPhase::Modified);
        assert_eq!(msg.payload["workspace"], "ws-1");
        assert_eq!(msg.payload["status"], "RUNNING");
    }

    #[test]
    fn test_missing_phase_is_rejected() {
        let result: Result<ChannelMessage, _> =
            serde_json::from_value(json!({ "workspace": "ws-1" }));
        assert!(result.is_err());
    }
}
