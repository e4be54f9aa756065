//! Wire codec for the duplex connection.
//!
//! Every message exchanged with the remote service is one JSON text frame.
//! Outbound frames are JSON-RPC style requests plus the SUBSCRIBE /
//! UNSUBSCRIBE channel messages. Inbound frames are decoded into a closed
//! set of variants by discriminating on the presence of `method`, `id` and
//! `channel` fields, so the router never probes raw JSON.

use serde_json::{json, Value as JsonValue};

use crate::error::{ExecLinkError, Result};
use crate::models::ChannelMessage;

/// JSON-RPC version tag stamped on every outbound request.
const JSONRPC_VERSION: &str = "2.0";

/// Inbound method name announcing server-side readiness.
pub const METHOD_CONNECTED: &str = "connected";

/// Inbound method name for a normally exited session.
pub const METHOD_EXEC_EXIT: &str = "onExecExit";

/// Inbound method name for a session that ended in error.
pub const METHOD_EXEC_ERROR: &str = "onExecError";

/// Frames sent from the gateway to the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    /// JSON-RPC request carrying a correlation id.
    Request {
        /// Method name (e.g. `create`, `stdin`, `resize`).
        method: String,
        /// Method parameters, passed through verbatim.
        params: JsonValue,
        /// Correlation id echoed on the matching response.
        id: i64,
    },

    /// Declare interest in a channel, resuming after `resource_version`.
    Subscribe {
        /// Channel identifier.
        channel: String,
        /// Namespace scope for the subscription.
        namespace: String,
        /// Replay cursor: the most recent resource version already seen.
        resource_version: String,
    },

    /// Withdraw interest in a channel.
    Unsubscribe {
        /// Channel identifier.
        channel: String,
    },
}

impl OutboundFrame {
    /// Serialize this frame to its JSON text representation.
    pub fn encode(&self) -> Result<String> {
        let value = match self {
            OutboundFrame::Request { method, params, id } => json!({
                "jsonrpc": JSONRPC_VERSION,
                "method": method,
                "params": params,
                "id": id,
            }),
            OutboundFrame::Subscribe {
                channel,
                namespace,
                resource_version,
            } => json!({
                "method": "SUBSCRIBE",
                "channel": channel,
                "params": {
                    "namespace": namespace,
                    "resourceVersion": resource_version,
                },
            }),
            OutboundFrame::Unsubscribe { channel } => json!({
                "method": "UNSUBSCRIBE",
                "channel": channel,
                "params": {},
            }),
        };

        serde_json::to_string(&value)
            .map_err(|e| ExecLinkError::SerializationError(format!("Failed to encode frame: {}", e)))
    }
}

/// Frames received from the remote service, after classification.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Administrative readiness signal (`{ "method": "connected" }`).
    Connected,

    /// A session's process exited normally.
    ExecExit {
        /// Server-assigned session id.
        id: i64,
    },

    /// A session's process ended in error.
    ExecError {
        /// Server-assigned session id.
        id: i64,
    },

    /// A frame keyed by a numeric id: either the response to an
    /// outstanding request or output for an open session.
    Correlated {
        /// Correlation or session id.
        id: i64,
        /// Result payload (delivered verbatim to session output listeners).
        result: JsonValue,
        /// Error payload when the server rejected the request.
        error: Option<JsonValue>,
    },

    /// Event published on a subscribed channel.
    ChannelEvent {
        /// Channel identifier.
        channel: String,
        /// Decoded event message.
        message: ChannelMessage,
    },

    /// Parsable JSON that matches none of the known shapes. Logged and
    /// dropped by the router.
    Unknown {
        /// The raw frame, kept for diagnostics.
        raw: JsonValue,
    },
}

/// Decode one inbound text frame.
///
/// Classification order mirrors routing precedence: `method` first, then a
/// numeric `id`, then `channel`. Anything else is [`InboundFrame::Unknown`].
///
/// # Errors
///
/// Returns [`ExecLinkError::SerializationError`] for frames that are not
/// valid JSON or carry a malformed known shape. Decode failures are
/// isolated per frame and never tear down the connection.
pub fn decode(text: &str) -> Result<InboundFrame> {
    let value: JsonValue = serde_json::from_str(text)
        .map_err(|e| ExecLinkError::SerializationError(format!("Invalid JSON frame: {}", e)))?;

    if let Some(method) = value.get("method").and_then(JsonValue::as_str) {
        return decode_method_frame(method, &value);
    }

    if let Some(id) = value.get("id").and_then(JsonValue::as_i64) {
        return Ok(InboundFrame::Correlated {
            id,
            result: value.get("result").cloned().unwrap_or(JsonValue::Null),
            error: value.get("error").cloned(),
        });
    }

    if let Some(channel) = value.get("channel").and_then(JsonValue::as_str) {
        let raw = value.get("message").cloned().unwrap_or(JsonValue::Null);
        let message: ChannelMessage = serde_json::from_value(raw).map_err(|e| {
            ExecLinkError::SerializationError(format!(
                "Malformed message on channel '{}': {}",
                channel, e
            ))
        })?;
        return Ok(InboundFrame::ChannelEvent {
            channel: channel.to_string(),
            message,
        });
    }

    Ok(InboundFrame::Unknown { raw: value })
}

fn decode_method_frame(method: &str, value: &JsonValue) -> Result<InboundFrame> {
    match method {
        METHOD_CONNECTED => Ok(InboundFrame::Connected),
        METHOD_EXEC_EXIT | METHOD_EXEC_ERROR => {
            let id = value
                .get("params")
                .and_then(|p| p.get("id"))
                .and_then(JsonValue::as_i64)
                .ok_or_else(|| {
                    ExecLinkError::SerializationError(format!(
                        "'{}' frame is missing a numeric params.id",
                        method
                    ))
                })?;
            if method == METHOD_EXEC_EXIT {
                Ok(InboundFrame::ExecExit { id })
            } else {
                Ok(InboundFrame::ExecError { id })
            }
        }
        _ => Ok(InboundFrame::Unknown { raw: value.clone() }),
    }
}
