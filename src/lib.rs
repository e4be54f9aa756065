//! Resilient multiplexed gateway to a remote exec/event service.
//!
//! `exec-link` maintains one persistent WebSocket connection per
//! [`ExecGateway`] and multiplexes two kinds of traffic over it:
//!
//! - **Exec sessions**: interactive remote terminals created with
//!   [`ExecGateway::create_session`]. Output, exit codes and resize all
//!   ride the shared connection, keyed by server-assigned session ids.
//! - **Channel subscriptions**: server-pushed resource events subscribed
//!   with [`ExecGateway::subscribe_to_channel`]. Each subscription carries
//!   a replay cursor so reconnects resume without redelivering
//!   already-seen events.
//!
//! The connection reconnects automatically on unexpected loss (see
//! [`ConnectionOptions`]): outstanding requests fail, open sessions exit
//! with [`CONNECTION_LOST_EXIT_CODE`], and every subscription is replayed
//! with a freshly read cursor once the connection is back.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use exec_link::{ExecGateway, SessionSpec};
//!
//! # async fn example() -> exec_link::Result<()> {
//! let gateway = ExecGateway::new("wss://devspace.example.com/connect")?;
//! gateway.connect().await?;
//!
//! gateway.add_channel_listener("pods", |event| {
//!     println!("{:?}: {:?}", event.event_phase, event.payload);
//! });
//! gateway
//!     .subscribe_to_channel("pods", "my-namespace", || "0".to_string())
//!     .await?;
//!
//! let session = gateway
//!     .create_session(SessionSpec::new("tools", "/bin/bash"))
//!     .await?;
//! session.send_input("echo hello\n").await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod error;
pub mod event_handlers;
pub mod frame;
pub mod gateway;
pub mod models;
pub mod session;
pub mod subscription;
pub mod timeouts;

mod pending;
mod router;

pub use connection::{
    Transport, TransportEvent, TransportFactory, WsTransportFactory, GRACEFUL_CLOSE_CODE,
};
pub use error::{ExecLinkError, Result};
pub use event_handlers::{ConnectionError, ConnectionListeners, DisconnectReason};
pub use gateway::{ExecGateway, ExecGatewayBuilder};
pub use models::{
    ChannelMessage, ConnectionOptions, EventPhase, SessionSpec, SubscriptionInfo,
};
pub use pending::LIST_SESSIONS_ID;
pub use session::{ExecSession, CONNECTION_LOST_EXIT_CODE};
pub use subscription::CursorAccessor;
pub use timeouts::{ExecLinkTimeouts, ExecLinkTimeoutsBuilder};
