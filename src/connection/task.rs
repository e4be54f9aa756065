//! Background task owning the shared connection.
//!
//! The task is the sole owner of the transport, the pending-request table,
//! the subscription registry and the session table. The public handle talks
//! to it exclusively through [`GatewayCommand`] messages, so none of that
//! state needs cross-task locking. The task cycles between a connected
//! phase (serving commands and routing inbound frames) and a disconnected
//! phase (serving what it can locally while the reconnect policy runs).

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as JsonValue};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::connection::transport::{Transport, TransportEvent, TransportFactory};
use crate::connection::GRACEFUL_CLOSE_CODE;
use crate::error::{ExecLinkError, Result};
use crate::event_handlers::{ConnectionError, ConnectionListeners, DisconnectReason};
use crate::frame::{self, OutboundFrame};
use crate::models::{ConnectionOptions, SessionSpec, SubscriptionInfo};
use crate::pending::{PendingAction, PendingRequests, LIST_SESSIONS_ID};
use crate::router::{route_frame, RouteTargets};
use crate::session::{ExecSession, SessionTable, CONNECTION_LOST_EXIT_CODE};
use crate::subscription::{ChannelListeners, CursorAccessor, SubscriptionRegistry};
use crate::timeouts::ExecLinkTimeouts;

const METHOD_CREATE: &str = "create";
const METHOD_STDIN: &str = "stdin";
const METHOD_RESIZE: &str = "resize";
const METHOD_LIST_SESSIONS: &str = "listSessions";

/// Commands sent from the public handle (and session handles) to the task.
pub(crate) enum GatewayCommand {
    Subscribe {
        channel: String,
        namespace: String,
        cursor: CursorAccessor,
        result_tx: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        channel: String,
        result_tx: oneshot::Sender<Result<()>>,
    },
    GetSubscriptions {
        result_tx: oneshot::Sender<Vec<SubscriptionInfo>>,
    },
    CreateSession {
        spec: SessionSpec,
        result_tx: oneshot::Sender<Result<ExecSession>>,
    },
    SessionInput {
        id: i64,
        data: String,
    },
    SessionResize {
        id: i64,
        cols: u16,
        rows: u16,
    },
    SessionClose {
        id: i64,
    },
    ListSessions {
        result_tx: oneshot::Sender<Result<JsonValue>>,
    },
    Shutdown,
}

/// Everything the task needs from the gateway that built it.
pub(crate) struct TaskContext {
    pub factory: Arc<dyn TransportFactory>,
    pub timeouts: ExecLinkTimeouts,
    pub options: ConnectionOptions,
    pub listeners: ConnectionListeners,
    pub channels: ChannelListeners,
    pub connected: Arc<std::sync::atomic::AtomicBool>,
}

/// How the connected phase ended.
enum End {
    /// The transport failed or the peer closed unexpectedly.
    Lost(String),
    /// The task is done (shutdown or graceful server close).
    Terminate,
}

/// What to do after handling one command while connected.
enum CommandFlow {
    Continue,
    Shutdown,
}

/// Entry point: establish the first connection, signal readiness, then run
/// until shutdown.
pub(crate) async fn gateway_task(
    cmd_rx: mpsc::Receiver<GatewayCommand>,
    cmd_tx: mpsc::Sender<GatewayCommand>,
    ctx: TaskContext,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let mut task = GatewayTask {
        ctx,
        cmd_rx,
        cmd_tx,
        pending: PendingRequests::new(),
        registry: SubscriptionRegistry::new(),
        sessions: SessionTable::new(),
    };

    // A failed first dial is reported to connect() callers but does not
    // end the task: the connection enters the same reconnect policy as any
    // later loss, and dies only on explicit shutdown.
    let mut transport = match task.ctx.factory.connect().await {
        Ok(mut t) => {
            let _ = ready_tx.send(Ok(()));
            match task.resume(t.as_mut()).await {
                Ok(()) => Some(t),
                Err(e) => {
                    task.handle_disconnect(e.to_string());
                    None
                }
            }
        }
        Err(e) => {
            log::warn!("Initial connection failed: {}", e);
            task.ctx.listeners.emit_error(ConnectionError::new(
                e.to_string(),
                task.ctx.options.auto_reconnect,
            ));
            let _ = ready_tx.send(Err(e));
            None
        }
    };

    loop {
        match transport.take() {
            Some(t) => match task.run_connected(t).await {
                End::Terminate => return,
                End::Lost(message) => task.handle_disconnect(message),
            },
            None => match task.run_disconnected().await {
                Some(t) => transport = Some(t),
                None => return,
            },
        }
    }
}

struct GatewayTask {
    ctx: TaskContext,
    cmd_rx: mpsc::Receiver<GatewayCommand>,
    /// Cloned into new session handles so their input reaches this task.
    cmd_tx: mpsc::Sender<GatewayCommand>,
    pending: PendingRequests,
    registry: SubscriptionRegistry,
    sessions: SessionTable,
}

/// Stand-in deadline for disabled timers; `select!` still needs a valid
/// instant even when the guard condition is false.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

impl GatewayTask {
    /// Serve commands and inbound frames until the connection ends.
    async fn run_connected(&mut self, mut transport: Box<dyn Transport>) -> End {
        let keepalive = self.ctx.timeouts.keepalive_interval;
        let keepalive_enabled = !ExecLinkTimeouts::is_no_timeout(keepalive);
        let mut next_ping = if keepalive_enabled {
            Instant::now() + keepalive
        } else {
            far_future()
        };

        loop {
            let expiry = self.pending.next_deadline();

            tokio::select! {
                biased;

                cmd = self.cmd_rx.recv() => {
                    // A dropped handle means nobody can reach us again.
                    let cmd = cmd.unwrap_or(GatewayCommand::Shutdown);
                    match self.handle_command_connected(cmd, transport.as_mut()).await {
                        Ok(CommandFlow::Continue) => {}
                        Ok(CommandFlow::Shutdown) => {
                            self.shutdown(transport.as_mut()).await;
                            return End::Terminate;
                        }
                        Err(e) => return End::Lost(e.to_string()),
                    }
                }

                _ = sleep_until(expiry.unwrap_or_else(far_future)), if expiry.is_some() => {
                    self.pending.expire(Instant::now());
                }

                _ = sleep_until(next_ping), if keepalive_enabled => {
                    if let Err(e) = transport.send_ping().await {
                        return End::Lost(format!("Keepalive failed: {}", e));
                    }
                    next_ping = Instant::now() + keepalive;
                }

                event = transport.next_event() => {
                    match event {
                        Some(Ok(TransportEvent::Text(raw))) => {
                            // Any traffic proves liveness.
                            if keepalive_enabled {
                                next_ping = Instant::now() + keepalive;
                            }
                            self.handle_inbound(&raw);
                        }
                        Some(Ok(TransportEvent::Pong)) => {
                            if keepalive_enabled {
                                next_ping = Instant::now() + keepalive;
                            }
                        }
                        Some(Ok(TransportEvent::Closed { code, reason }))
                            if code == Some(GRACEFUL_CLOSE_CODE) =>
                        {
                            log::info!("Server closed the connection gracefully");
                            self.graceful_end(&reason);
                            return End::Terminate;
                        }
                        Some(Ok(TransportEvent::Closed { code, reason })) => {
                            return End::Lost(format!(
                                "Connection closed by peer: '{}' (code {:?})",
                                reason, code
                            ));
                        }
                        Some(Err(e)) => return End::Lost(e.to_string()),
                        None => return End::Lost("Connection stream ended".to_string()),
                    }
                }
            }
        }
    }

    async fn handle_command_connected(
        &mut self,
        cmd: GatewayCommand,
        transport: &mut dyn Transport,
    ) -> Result<CommandFlow> {
        match cmd {
            GatewayCommand::Subscribe {
                channel,
                namespace,
                cursor,
                result_tx,
            } => {
                // The registry entry outlives a failed send; it is replayed
                // once the connection comes back.
                self.registry.insert(&channel, &namespace, cursor);
                if let Some(frame) = self.registry.subscribe_frame(&channel) {
                    if let Err(e) = self.send_frame(transport, &frame).await {
                        let _ = result_tx.send(Err(e.clone()));
                        return Err(e);
                    }
                }
                let _ = result_tx.send(Ok(()));
            }
            GatewayCommand::Unsubscribe { channel, result_tx } => {
                if self.registry.remove(&channel) {
                    let frame = OutboundFrame::Unsubscribe { channel };
                    if let Err(e) = self.send_frame(transport, &frame).await {
                        let _ = result_tx.send(Err(e.clone()));
                        return Err(e);
                    }
                }
                let _ = result_tx.send(Ok(()));
            }
            GatewayCommand::GetSubscriptions { result_tx } => {
                let _ = result_tx.send(self.registry.snapshot());
            }
            GatewayCommand::CreateSession { spec, result_tx } => {
                let params = match serde_json::to_value(&spec) {
                    Ok(p) => p,
                    Err(e) => {
                        let _ = result_tx.send(Err(ExecLinkError::SerializationError(format!(
                            "Failed to encode session spec: {}",
                            e
                        ))));
                        return Ok(CommandFlow::Continue);
                    }
                };
                let id = self.pending.register(
                    METHOD_CREATE,
                    PendingAction::CreateSession {
                        spec,
                        tx: result_tx,
                    },
                    Some(self.ctx.timeouts.call_timeout),
                );
                let frame = OutboundFrame::Request {
                    method: METHOD_CREATE.to_string(),
                    params,
                    id,
                };
                if let Err(e) = self.send_frame(transport, &frame).await {
                    if let Some(action) = self.pending.take(id) {
                        action.fail(e.clone());
                    }
                    return Err(e);
                }
            }
            GatewayCommand::SessionInput { id, data } => {
                if !self.sessions.contains(id) {
                    log::warn!("Dropping input for unknown session {}", id);
                    return Ok(CommandFlow::Continue);
                }
                let frame = OutboundFrame::Request {
                    method: METHOD_STDIN.to_string(),
                    params: json!({ "id": id, "data": data }),
                    id: self.pending.next_request_id(),
                };
                self.send_frame(transport, &frame).await?;
            }
            GatewayCommand::SessionResize { id, cols, rows } => {
                if !self.sessions.contains(id) {
                    log::warn!("Dropping resize for unknown session {}", id);
                    return Ok(CommandFlow::Continue);
                }
                let frame = OutboundFrame::Request {
                    method: METHOD_RESIZE.to_string(),
                    params: json!({ "id": id, "cols": cols, "rows": rows }),
                    id: self.pending.next_request_id(),
                };
                self.send_frame(transport, &frame).await?;
            }
            GatewayCommand::SessionClose { id } => {
                if !self.sessions.remove(id) {
                    log::debug!("Close for unknown session {}", id);
                }
            }
            GatewayCommand::ListSessions { result_tx } => {
                self.pending.register_reserved(
                    LIST_SESSIONS_ID,
                    METHOD_LIST_SESSIONS,
                    PendingAction::Respond(result_tx),
                    Some(self.ctx.timeouts.call_timeout),
                );
                let frame = OutboundFrame::Request {
                    method: METHOD_LIST_SESSIONS.to_string(),
                    params: json!([]),
                    id: LIST_SESSIONS_ID,
                };
                if let Err(e) = self.send_frame(transport, &frame).await {
                    if let Some(action) = self.pending.take(LIST_SESSIONS_ID) {
                        action.fail(e.clone());
                    }
                    return Err(e);
                }
            }
            GatewayCommand::Shutdown => return Ok(CommandFlow::Shutdown),
        }
        Ok(CommandFlow::Continue)
    }

    /// Serve commands while no connection exists. Returns the new transport
    /// once reconnected, or `None` when the task should terminate.
    async fn run_disconnected(&mut self) -> Option<Box<dyn Transport>> {
        if !self.ctx.options.auto_reconnect {
            log::info!("Automatic reconnection is disabled; connection stays down");
            self.serve_offline_forever().await;
            return None;
        }

        let delay = Duration::from_millis(self.ctx.options.reconnect_delay_ms);
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            if let Some(max) = self.ctx.options.max_reconnect_attempts {
                if attempts > max {
                    log::error!("Giving up after {} reconnection attempts", max);
                    self.ctx.listeners.emit_error(ConnectionError::new(
                        format!("Reconnection abandoned after {} attempts", max),
                        false,
                    ));
                    self.serve_offline_forever().await;
                    return None;
                }
            }

            if self.serve_offline_for(delay).await {
                return None;
            }

            log::info!("Reconnection attempt {}", attempts);
            match self.ctx.factory.connect().await {
                Ok(mut transport) => match self.resume(transport.as_mut()).await {
                    Ok(()) => return Some(transport),
                    Err(e) => {
                        log::warn!("Resubscription after reconnect failed: {}", e);
                        self.ctx
                            .listeners
                            .emit_error(ConnectionError::new(e.to_string(), true));
                    }
                },
                Err(e) => {
                    log::warn!("Reconnection attempt {} failed: {}", attempts, e);
                    self.ctx
                        .listeners
                        .emit_error(ConnectionError::new(e.to_string(), true));
                }
            }
        }
    }

    /// Mark the connection open, then replay every recorded subscription
    /// with a freshly read cursor. Open listeners fire first; the replay
    /// still completes before any queued command is processed, so a stale
    /// cursor can never overtake a fresher one.
    async fn resume(&mut self, transport: &mut dyn Transport) -> Result<()> {
        self.ctx.connected.store(true, Ordering::SeqCst);
        self.ctx.listeners.emit_open();
        let frames = self.registry.replay_frames();
        let count = frames.len();
        for frame in frames {
            self.send_frame(transport, &frame).await?;
        }
        if count > 0 {
            log::info!("Resubscribed {} channel(s)", count);
        }
        Ok(())
    }

    /// Serve commands until `delay` elapses. Returns true on shutdown.
    async fn serve_offline_for(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if self.handle_command_offline(cmd) {
                                return true;
                            }
                        }
                        None => return true,
                    }
                }
            }
        }
    }

    /// Serve commands until shutdown. Used when reconnection is off or
    /// abandoned.
    async fn serve_offline_forever(&mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_command_offline(cmd) {
                return;
            }
        }
    }

    /// Handle one command with no connection available. Subscription
    /// changes are recorded locally; calls that need the server fail fast.
    /// Returns true on shutdown.
    fn handle_command_offline(&mut self, cmd: GatewayCommand) -> bool {
        match cmd {
            GatewayCommand::Subscribe {
                channel,
                namespace,
                cursor,
                result_tx,
            } => {
                self.registry.insert(&channel, &namespace, cursor);
                let _ = result_tx.send(Ok(()));
            }
            GatewayCommand::Unsubscribe { channel, result_tx } => {
                self.registry.remove(&channel);
                let _ = result_tx.send(Ok(()));
            }
            GatewayCommand::GetSubscriptions { result_tx } => {
                let _ = result_tx.send(self.registry.snapshot());
            }
            GatewayCommand::CreateSession { result_tx, .. } => {
                let _ = result_tx.send(Err(ExecLinkError::ConnectionClosed(
                    "Not connected".to_string(),
                )));
            }
            GatewayCommand::ListSessions { result_tx } => {
                let _ = result_tx.send(Err(ExecLinkError::ConnectionClosed(
                    "Not connected".to_string(),
                )));
            }
            GatewayCommand::SessionInput { id, .. } => {
                log::warn!("Dropping input for session {}: not connected", id);
            }
            GatewayCommand::SessionResize { id, .. } => {
                log::warn!("Dropping resize for session {}: not connected", id);
            }
            GatewayCommand::SessionClose { id } => {
                self.sessions.remove(id);
            }
            GatewayCommand::Shutdown => return true,
        }
        false
    }

    fn handle_inbound(&mut self, raw: &str) {
        self.ctx.listeners.emit_receive(raw);
        match frame::decode(raw) {
            Ok(frame) => route_frame(
                frame,
                &mut RouteTargets {
                    pending: &mut self.pending,
                    sessions: &mut self.sessions,
                    channels: &self.ctx.channels,
                    cmd_tx: &self.cmd_tx,
                },
            ),
            Err(e) => log::warn!("Ignoring undecodable frame: {}", e),
        }
    }

    async fn send_frame(&self, transport: &mut dyn Transport, frame: &OutboundFrame) -> Result<()> {
        let raw = frame.encode()?;
        self.ctx.listeners.emit_send(&raw);
        transport.send_text(&raw).await
    }

    /// Unexpected connection loss: fail every outstanding request, end
    /// every open session, keep subscriptions for replay.
    fn handle_disconnect(&mut self, message: String) {
        log::warn!("Connection lost: {}", message);
        self.ctx.connected.store(false, Ordering::SeqCst);
        self.ctx.listeners.emit_error(ConnectionError::new(
            message.clone(),
            self.ctx.options.auto_reconnect,
        ));
        self.ctx
            .listeners
            .emit_close(DisconnectReason::new(message.clone()));
        self.pending
            .fail_all(&ExecLinkError::WebSocketError(format!(
                "Connection lost: {}",
                message
            )));
        self.sessions.finish_all(CONNECTION_LOST_EXIT_CODE);
    }

    /// The server closed with the normal close code: no reconnection.
    fn graceful_end(&mut self, reason: &str) {
        self.ctx.connected.store(false, Ordering::SeqCst);
        self.pending.fail_all(&ExecLinkError::ConnectionClosed(
            "Connection closed by server".to_string(),
        ));
        self.sessions.finish_all(CONNECTION_LOST_EXIT_CODE);
        let message = if reason.is_empty() {
            "Closed by server".to_string()
        } else {
            reason.to_string()
        };
        self.ctx
            .listeners
            .emit_close(DisconnectReason::with_code(message, GRACEFUL_CLOSE_CODE));
    }

    /// Client-initiated shutdown.
    async fn shutdown(&mut self, transport: &mut dyn Transport) {
        log::debug!("Shutting down gateway task");
        if let Err(e) = transport.close(Some(GRACEFUL_CLOSE_CODE)).await {
            log::debug!("Error during close handshake: {}", e);
        }
        self.ctx.connected.store(false, Ordering::SeqCst);
        self.pending.fail_all(&ExecLinkError::ConnectionClosed(
            "Gateway closed".to_string(),
        ));
        self.sessions.finish_all(CONNECTION_LOST_EXIT_CODE);
        self.ctx.listeners.emit_close(DisconnectReason::with_code(
            "Closed by client",
            GRACEFUL_CLOSE_CODE,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct NeverFactory;

    #[async_trait::async_trait]
    impl TransportFactory for NeverFactory {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            Err(ExecLinkError::WebSocketError("unreachable".to_string()))
        }
    }

    fn offline_task() -> (GatewayTask, mpsc::Sender<GatewayCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = GatewayTask {
            ctx: TaskContext {
                factory: Arc::new(NeverFactory),
                timeouts: ExecLinkTimeouts::default(),
                options: ConnectionOptions::default(),
                listeners: ConnectionListeners::new(),
                channels: ChannelListeners::new(),
                connected: Arc::new(AtomicBool::new(false)),
            },
            cmd_rx,
            cmd_tx: cmd_tx.clone(),
            pending: PendingRequests::new(),
            registry: SubscriptionRegistry::new(),
            sessions: SessionTable::new(),
        };
        (task, cmd_tx)
    }

    #[tokio::test]
    async fn test_offline_subscribe_is_recorded_and_acknowledged() {
        let (mut task, _tx) = offline_task();
        let (result_tx, result_rx) = oneshot::channel();
        let shutdown = task.handle_command_offline(GatewayCommand::Subscribe {
            channel: "pods".to_string(),
            namespace: "ns".to_string(),
            cursor: Arc::new(|| "0".to_string()),
            result_tx,
        });

        assert!(!shutdown);
        assert!(result_rx.await.unwrap().is_ok());
        assert_eq!(task.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_create_session_fails_fast() {
        let (mut task, _tx) = offline_task();
        let (result_tx, result_rx) = oneshot::channel();
        task.handle_command_offline(GatewayCommand::CreateSession {
            spec: SessionSpec::new("tools", "/bin/bash"),
            result_tx,
        });

        assert!(matches!(
            result_rx.await.unwrap().unwrap_err(),
            ExecLinkError::ConnectionClosed(_)
        ));
    }

    #[tokio::test]
    async fn test_offline_shutdown_terminates() {
        let (mut task, _tx) = offline_task();
        assert!(task.handle_command_offline(GatewayCommand::Shutdown));
    }
}
