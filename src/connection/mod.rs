//! Connection management for the gateway.
//!
//! This module contains:
//! - [`transport`]: the duplex-transport abstraction and its default
//!   WebSocket implementation
//! - [`task`]: the background task that owns the transport and all
//!   session/subscription state
//!
//! One gateway instance owns exactly one physical connection; every
//! terminal session and channel subscription is multiplexed over it.

pub mod transport;

pub(crate) mod task;

pub use transport::{
    Transport, TransportEvent, TransportFactory, WsTransport, WsTransportFactory,
    GRACEFUL_CLOSE_CODE,
};

/// Capacity of the command channel between the public handle and the
/// background connection task.
pub(crate) const COMMAND_CHANNEL_CAPACITY: usize = 256;
