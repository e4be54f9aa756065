//! Inbound-frame dispatcher.
//!
//! Every decoded frame is routed to exactly one consumer. Classification
//! order: administrative method, session lifecycle event, outstanding
//! request, open-session output, channel event. Unclassifiable frames are
//! logged and dropped; a bad frame must never take down the dispatcher.

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::connection::task::GatewayCommand;
use crate::error::ExecLinkError;
use crate::frame::InboundFrame;
use crate::pending::{PendingAction, PendingRequests};
use crate::session::{ExecSession, SessionShared, SessionTable, EXEC_ERROR_EXIT_CODE};
use crate::subscription::ChannelListeners;

/// The consumers one frame can be dispatched to.
pub(crate) struct RouteTargets<'a> {
    pub pending: &'a mut PendingRequests,
    pub sessions: &'a mut SessionTable,
    pub channels: &'a ChannelListeners,
    /// Handed to newly created sessions so their input/resize calls reach
    /// the connection task.
    pub cmd_tx: &'a mpsc::Sender<GatewayCommand>,
}

/// Dispatch one decoded frame.
pub(crate) fn route_frame(frame: InboundFrame, targets: &mut RouteTargets<'_>) {
    match frame {
        InboundFrame::Connected => {
            log::debug!("Server signalled readiness");
        }
        InboundFrame::ExecExit { id } => {
            if !targets.sessions.finish(id, 0) {
                log::debug!("Exit frame for unknown session {}", id);
            }
        }
        InboundFrame::ExecError { id } => {
            if !targets.sessions.finish(id, EXEC_ERROR_EXIT_CODE) {
                log::debug!("Error frame for unknown session {}", id);
            }
        }
        InboundFrame::Correlated { id, result, error } => {
            // An outstanding request owns the id; otherwise it may be
            // output for an open session.
            if let Some(action) = targets.pending.take(id) {
                complete(action, result, error, targets);
            } else if error.is_none() && targets.sessions.route_output(id, &result) {
                // Delivered verbatim to the owning session's listeners.
            } else {
                log::debug!("Dropping frame with unroutable id {}", id);
            }
        }
        InboundFrame::ChannelEvent { channel, message } => {
            let delivered = targets.channels.dispatch(&channel, &message);
            if delivered == 0 {
                log::debug!("No listeners for channel '{}'", channel);
            }
        }
        InboundFrame::Unknown { raw } => {
            log::warn!("Dropping unclassifiable frame: {}", raw);
        }
    }
}

fn complete(
    action: PendingAction,
    result: JsonValue,
    error: Option<JsonValue>,
    targets: &mut RouteTargets<'_>,
) {
    match action {
        PendingAction::Respond(tx) => {
            let outcome = match error {
                Some(err) => Err(ExecLinkError::WebSocketError(format!(
                    "Server rejected request: {}",
                    err
                ))),
                None => Ok(result),
            };
            let _ = tx.send(outcome);
        }
        PendingAction::CreateSession { spec, tx } => {
            if let Some(err) = error {
                let _ = tx.send(Err(ExecLinkError::WebSocketError(format!(
                    "Session creation failed: {}",
                    err
                ))));
                return;
            }
            // The server returns the session id either bare or wrapped.
            let server_id = result
                .as_i64()
                .or_else(|| result.get("id").and_then(JsonValue::as_i64));
            match server_id {
                Some(id) => {
                    let shared = SessionShared::new(spec.cols, spec.rows);
                    targets.sessions.insert(id, shared.clone());
                    log::debug!("Session {} created for target '{}'", id, spec.target);
                    let _ = tx.send(Ok(ExecSession::new(id, shared, targets.cmd_tx.clone())));
                }
                None => {
                    let _ = tx.send(Err(ExecLinkError::SerializationError(format!(
                        "Create response carries no numeric session id: {}",
                        result
                    ))));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionSpec;
    use serde_json::json;
    use tokio::sync::oneshot;

    struct Fixture {
        pending: PendingRequests,
        sessions: SessionTable,
        channels: ChannelListeners,
        cmd_tx: mpsc::Sender<GatewayCommand>,
        _cmd_rx: mpsc::Receiver<GatewayCommand>,
    }

    impl Fixture {
        fn new() -> Self {
            let (cmd_tx, _cmd_rx) = mpsc::channel(8);
            Self {
                pending: PendingRequests::new(),
                sessions: SessionTable::new(),
                channels: ChannelListeners::new(),
                cmd_tx,
                _cmd_rx,
            }
        }

        fn route(&mut self, frame: InboundFrame) {
            route_frame(
                frame,
                &mut RouteTargets {
                    pending: &mut self.pending,
                    sessions: &mut self.sessions,
                    channels: &self.channels,
                    cmd_tx: &self.cmd_tx,
                },
            );
        }
    }

    #[tokio::test]
    async fn test_pending_request_takes_precedence_over_session_output() {
        let mut fx = Fixture::new();
        let (tx, rx) = oneshot::channel();
        let id = fx
            .pending
            .register("create", PendingAction::Respond(tx), None);

        // An open session under the same id must not receive this frame.
        fx.sessions.insert(id, SessionShared::new(80, 24));

        fx.route(InboundFrame::Correlated {
            id,
            result: json!("payload"),
            error: None,
        });

        assert_eq!(rx.await.unwrap().unwrap(), json!("payload"));
    }

    #[tokio::test]
    async fn test_create_response_registers_session() {
        let mut fx = Fixture::new();
        let (tx, rx) = oneshot::channel();
        let id = fx.pending.register(
            "create",
            PendingAction::CreateSession {
                spec: SessionSpec::new("tools", "/bin/bash").with_size(100, 30),
                tx,
            },
            None,
        );

        fx.route(InboundFrame::Correlated {
            id,
            result: json!(17),
            error: None,
        });

        let session = rx.await.unwrap().unwrap();
        assert_eq!(session.id(), 17);
        assert_eq!(session.size(), (100, 30));
        assert!(fx.sessions.contains(17));
    }

    #[tokio::test]
    async fn test_create_error_result_rejects_caller() {
        let mut fx = Fixture::new();
        let (tx, rx) = oneshot::channel();
        let id = fx.pending.register(
            "create",
            PendingAction::CreateSession {
                spec: SessionSpec::new("tools", "/bin/bash"),
                tx,
            },
            None,
        );

        fx.route(InboundFrame::Correlated {
            id,
            result: JsonValue::Null,
            error: Some(json!({"message": "no such container"})),
        });

        assert!(rx.await.unwrap().is_err());
        assert_eq!(fx.sessions.len(), 0);
    }

    #[tokio::test]
    async fn test_exec_error_frame_yields_nonzero_exit_code() {
        use std::sync::atomic::{AtomicI32, Ordering};
        use std::sync::Arc;

        let mut fx = Fixture::new();
        let shared = SessionShared::new(80, 24);
        fx.sessions.insert(3, shared.clone());
        let session = ExecSession::new(3, shared, fx.cmd_tx.clone());

        let code = Arc::new(AtomicI32::new(-1));
        let seen = code.clone();
        session.on_exit(move |c| seen.store(c, Ordering::SeqCst));

        fx.route(InboundFrame::ExecError { id: 3 });

        assert_eq!(code.load(Ordering::SeqCst), EXEC_ERROR_EXIT_CODE);
        assert!(!fx.sessions.contains(3));
    }

    #[tokio::test]
    async fn test_unroutable_frames_do_not_panic() {
        let mut fx = Fixture::new();
        fx.route(InboundFrame::Correlated {
            id: 42,
            result: json!("orphan"),
            error: None,
        });
        fx.route(InboundFrame::ExecExit { id: 42 });
        fx.route(InboundFrame::Unknown { raw: json!({"x": 1}) });
    }
}
