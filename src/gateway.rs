//! Public gateway handle.
//!
//! An [`ExecGateway`] owns one background connection task and hands out the
//! command channel everything else rides on. Construct one per endpoint via
//! [`ExecGatewayBuilder`]; cheap to share behind an `Arc` if several parts
//! of a program use the same endpoint.
//!
//! # Example
//!
//! ```rust,no_run
//! use exec_link::{ExecGateway, SessionSpec};
//!
//! # async fn example() -> exec_link::Result<()> {
//! let gateway = ExecGateway::builder()
//!     .url("wss://devspace.example.com/connect")
//!     .build()?;
//! gateway.connect().await?;
//!
//! let session = gateway
//!     .create_session(SessionSpec::new("tools", "/bin/bash"))
//!     .await?;
//! session.on_output(|chunk| println!("{}", chunk));
//! session.send_input("ls\n").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};

use crate::connection::task::{gateway_task, GatewayCommand, TaskContext};
use crate::connection::{TransportFactory, WsTransportFactory, COMMAND_CHANNEL_CAPACITY};
use crate::error::{ExecLinkError, Result};
use crate::event_handlers::{ConnectionError, ConnectionListeners, DisconnectReason};
use crate::models::{ChannelMessage, ConnectionOptions, SessionSpec, SubscriptionInfo};
use crate::session::ExecSession;
use crate::subscription::ChannelListeners;
use crate::timeouts::ExecLinkTimeouts;

/// Outcome of the first connection attempt, shared between every
/// concurrent `connect()` caller.
type SharedReady = Shared<BoxFuture<'static, Result<()>>>;

/// Builder for [`ExecGateway`].
#[derive(Default)]
pub struct ExecGatewayBuilder {
    url: Option<String>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    timeouts: ExecLinkTimeouts,
    options: ConnectionOptions,
}

impl ExecGatewayBuilder {
    /// Create a builder with default timeouts and options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the endpoint URL (`ws://` or `wss://`).
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Use a custom transport factory instead of the default WebSocket one.
    /// Takes precedence over [`url`](Self::url).
    pub fn transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    /// Override the timeout configuration.
    pub fn timeouts(mut self, timeouts: ExecLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Override the connection options.
    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the gateway. No connection is made until
    /// [`connect`](ExecGateway::connect) is called.
    ///
    /// # Errors
    ///
    /// Returns [`ExecLinkError::ConfigurationError`] when neither a URL nor
    /// a transport factory was provided, or the URL has a bad scheme.
    pub fn build(self) -> Result<ExecGateway> {
        let factory: Arc<dyn TransportFactory> = match self.transport_factory {
            Some(factory) => factory,
            None => {
                let url = self.url.ok_or_else(|| {
                    ExecLinkError::ConfigurationError(
                        "An endpoint URL or a transport factory is required".to_string(),
                    )
                })?;
                Arc::new(WsTransportFactory::new(
                    url,
                    self.timeouts.connection_timeout,
                )?)
            }
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        Ok(ExecGateway {
            cmd_tx,
            state: Mutex::new(GatewayState {
                ready: None,
                cmd_rx: Some(cmd_rx),
            }),
            factory,
            timeouts: self.timeouts,
            options: self.options,
            listeners: ConnectionListeners::new(),
            channels: ChannelListeners::new(),
            connected: Arc::new(AtomicBool::new(false)),
            closed: AtomicBool::new(false),
        })
    }
}

struct GatewayState {
    /// Set once the background task has been spawned.
    ready: Option<SharedReady>,
    /// Held until the task is spawned, then moved into it.
    cmd_rx: Option<mpsc::Receiver<GatewayCommand>>,
}

/// One resilient multiplexed connection to a remote exec/event service.
///
/// All terminal sessions and channel subscriptions created through this
/// gateway share a single underlying connection. The gateway reconnects
/// automatically (per its [`ConnectionOptions`]) and replays subscriptions
/// after every reconnect.
pub struct ExecGateway {
    cmd_tx: mpsc::Sender<GatewayCommand>,
    state: Mutex<GatewayState>,
    factory: Arc<dyn TransportFactory>,
    timeouts: ExecLinkTimeouts,
    options: ConnectionOptions,
    listeners: ConnectionListeners,
    channels: ChannelListeners,
    connected: Arc<AtomicBool>,
    closed: AtomicBool,
}

impl ExecGateway {
    /// Create a builder.
    pub fn builder() -> ExecGatewayBuilder {
        ExecGatewayBuilder::new()
    }

    /// Shorthand for a gateway with default configuration.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::builder().url(url).build()
    }

    /// Establish the connection.
    ///
    /// Idempotent: concurrent and repeated calls share one underlying
    /// attempt and all observe its outcome. A failed first attempt is
    /// reported to every waiting caller, but the gateway is not dead: the
    /// reconnect policy keeps dialing in the background (per
    /// [`ConnectionOptions`]) until [`close`](Self::close), and once a
    /// connection is up `connect` returns `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the first attempt's connection error, or
    /// [`ExecLinkError::ConnectionClosed`] after [`close`](Self::close).
    pub async fn connect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecLinkError::ConnectionClosed(
                "Gateway has been closed".to_string(),
            ));
        }
        if self.is_connected() {
            return Ok(());
        }

        let ready = {
            let mut state = self.state.lock().expect("gateway state lock poisoned");
            if let Some(ready) = &state.ready {
                ready.clone()
            } else {
                let cmd_rx = state.cmd_rx.take().ok_or_else(|| {
                    ExecLinkError::InternalError(
                        "Connection task already consumed the command channel".to_string(),
                    )
                })?;
                let (ready_tx, ready_rx) = oneshot::channel();
                let ctx = TaskContext {
                    factory: self.factory.clone(),
                    timeouts: self.timeouts.clone(),
                    options: self.options.clone(),
                    listeners: self.listeners.clone(),
                    channels: self.channels.clone(),
                    connected: self.connected.clone(),
                };
                tokio::spawn(gateway_task(cmd_rx, self.cmd_tx.clone(), ctx, ready_tx));

                let fut: BoxFuture<'static, Result<()>> = Box::pin(async move {
                    match ready_rx.await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(ExecLinkError::InternalError(
                            "Connection task exited before signalling readiness".to_string(),
                        )),
                    }
                });
                let shared = fut.shared();
                state.ready = Some(shared.clone());
                shared
            }
        };

        ready.await
    }

    /// Whether the connection is currently established.
    ///
    /// A snapshot only; prefer [`add_close_listener`](Self::add_close_listener)
    /// and [`add_open_listener`](Self::add_open_listener) for reacting to
    /// state changes.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close the connection and terminate the background task.
    ///
    /// Outstanding requests fail, open sessions receive
    /// [`CONNECTION_LOST_EXIT_CODE`](crate::session::CONNECTION_LOST_EXIT_CODE),
    /// and the gateway cannot be reconnected afterwards. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.task_started() {
            // The task may already be gone; that is still a clean close.
            let _ = self.cmd_tx.send(GatewayCommand::Shutdown).await;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------

    /// Subscribe to a channel.
    ///
    /// `cursor` is read every time a SUBSCRIBE frame goes out (initially
    /// and after every reconnect) and should return the most recent
    /// resource version the caller has fully consumed; the server replays
    /// only events newer than that. Return an empty string to receive
    /// everything.
    ///
    /// May be called before [`connect`](Self::connect): the subscription is
    /// recorded and applied once the connection is up. At most one
    /// subscription exists per channel; re-subscribing replaces it.
    pub async fn subscribe_to_channel(
        &self,
        channel: impl Into<String>,
        namespace: impl Into<String>,
        cursor: impl Fn() -> String + Send + Sync + 'static,
    ) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecLinkError::ConnectionClosed(
                "Gateway has been closed".to_string(),
            ));
        }
        let started = self.task_started();
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(GatewayCommand::Subscribe {
            channel: channel.into(),
            namespace: namespace.into(),
            cursor: Arc::new(cursor),
            result_tx,
        })
        .await?;

        if started {
            result_rx.await.map_err(Self::task_gone)?
        } else {
            // Queued; the task applies it right after the first connect.
            Ok(())
        }
    }

    /// Unsubscribe from a channel. A no-op if no subscription exists.
    pub async fn unsubscribe_from_channel(&self, channel: impl Into<String>) -> Result<()> {
        let started = self.task_started();
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(GatewayCommand::Unsubscribe {
            channel: channel.into(),
            result_tx,
        })
        .await?;

        if started {
            result_rx.await.map_err(Self::task_gone)?
        } else {
            Ok(())
        }
    }

    /// Snapshot of the active subscriptions. Empty before the first
    /// [`connect`](Self::connect).
    pub async fn subscriptions(&self) -> Result<Vec<SubscriptionInfo>> {
        if !self.task_started() {
            return Ok(Vec::new());
        }
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(GatewayCommand::GetSubscriptions { result_tx })
            .await?;
        result_rx.await.map_err(Self::task_gone)
    }

    /// Register a listener for events arriving on a channel.
    ///
    /// Listeners are independent of subscription state and survive
    /// reconnects; they may be registered before subscribing.
    pub fn add_channel_listener(
        &self,
        channel: impl AsRef<str>,
        f: impl Fn(&ChannelMessage) + Send + Sync + 'static,
    ) {
        self.channels.add(channel.as_ref(), f);
    }

    // ---------------------------------------------------------------
    // Sessions
    // ---------------------------------------------------------------

    /// Create a remote exec session.
    ///
    /// Resolves once the server has acknowledged creation with the
    /// session's id. Requires [`connect`](Self::connect) first.
    pub async fn create_session(&self, spec: SessionSpec) -> Result<ExecSession> {
        self.require_started()?;
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(GatewayCommand::CreateSession { spec, result_tx })
            .await?;
        result_rx.await.map_err(Self::task_gone)?
    }

    /// Ask the server for its view of the open sessions.
    ///
    /// The raw result payload is returned verbatim. Only one `list_sessions`
    /// call can be outstanding at a time; a newer call supersedes an older
    /// unanswered one.
    pub async fn list_sessions(&self) -> Result<JsonValue> {
        self.require_started()?;
        let (result_tx, result_rx) = oneshot::channel();
        self.send_command(GatewayCommand::ListSessions { result_tx })
            .await?;
        result_rx.await.map_err(Self::task_gone)?
    }

    // ---------------------------------------------------------------
    // Lifecycle listeners
    // ---------------------------------------------------------------

    /// Register a listener fired every time the connection opens.
    ///
    /// With `replay` set, the listener also fires immediately if the
    /// connection has already opened at least once.
    pub fn add_open_listener(&self, replay: bool, f: impl Fn() + Send + Sync + 'static) {
        self.listeners.add_open_listener(replay, f);
    }

    /// Register a listener fired every time the connection closes.
    ///
    /// With `replay` set, the listener also fires immediately with the most
    /// recent close event, if one has occurred.
    pub fn add_close_listener(
        &self,
        replay: bool,
        f: impl Fn(&DisconnectReason) + Send + Sync + 'static,
    ) {
        self.listeners.add_close_listener(replay, f);
    }

    /// Register a listener fired on connection errors.
    ///
    /// With `replay` set, the listener also fires immediately with the most
    /// recent error, if one has occurred.
    pub fn add_error_listener(
        &self,
        replay: bool,
        f: impl Fn(&ConnectionError) + Send + Sync + 'static,
    ) {
        self.listeners.add_error_listener(replay, f);
    }

    /// Debug hook invoked with the raw text of every outbound frame.
    pub fn on_send(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.listeners.on_send(f);
    }

    /// Debug hook invoked with the raw text of every inbound frame.
    pub fn on_receive(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.listeners.on_receive(f);
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn task_started(&self) -> bool {
        self.state
            .lock()
            .expect("gateway state lock poisoned")
            .ready
            .is_some()
    }

    fn require_started(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ExecLinkError::ConnectionClosed(
                "Gateway has been closed".to_string(),
            ));
        }
        if !self.task_started() {
            return Err(ExecLinkError::ConnectionClosed(
                "Not connected; call connect() first".to_string(),
            ));
        }
        Ok(())
    }

    async fn send_command(&self, cmd: GatewayCommand) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Self::task_gone(()))
    }

    fn task_gone<T>(_: T) -> ExecLinkError {
        ExecLinkError::ConnectionClosed("Connection task is not running".to_string())
    }
}

impl Drop for ExecGateway {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) && self.task_started() {
            let _ = self.cmd_tx.try_send(GatewayCommand::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_url_or_factory() {
        let result = ExecGateway::builder().build();
        assert!(matches!(
            result,
            Err(ExecLinkError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_build_rejects_bad_scheme() {
        let result = ExecGateway::builder().url("https://host/connect").build();
        assert!(matches!(
            result,
            Err(ExecLinkError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_operations_before_connect_fail_fast() {
        let gateway = ExecGateway::new("ws://localhost:1/connect").unwrap();
        let result = gateway
            .create_session(SessionSpec::new("tools", "/bin/bash"))
            .await;
        assert!(matches!(result, Err(ExecLinkError::ConnectionClosed(_))));
        assert!(!gateway.is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_is_recorded() {
        let gateway = ExecGateway::new("ws://localhost:1/connect").unwrap();
        gateway
            .subscribe_to_channel("pods", "ns", || String::new())
            .await
            .unwrap();
        // Nothing started yet, so the snapshot is still empty.
        assert!(gateway.subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let gateway = ExecGateway::new("ws://localhost:1/connect").unwrap();
        gateway.close().await.unwrap();
        gateway.close().await.unwrap();
        assert!(matches!(
            gateway.connect().await,
            Err(ExecLinkError::ConnectionClosed(_))
        ));
    }
}
