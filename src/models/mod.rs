//! Data models for the exec-link gateway.
//!
//! Defines connection options and the structures carried on the wire for
//! channel events and session creation.

pub mod channel_message;
pub mod connection_options;
pub mod session_spec;
pub mod subscription_info;

pub use channel_message::{ChannelMessage, EventPhase};
pub use connection_options::ConnectionOptions;
pub use session_spec::SessionSpec;
pub use subscription_info::SubscriptionInfo;
