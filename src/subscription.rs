//! Channel subscription bookkeeping.
//!
//! The registry records the set of currently-desired subscriptions (one per
//! channel) so they can be replayed after every (re-)connect. The replay
//! cursor is read through a caller-supplied accessor *at send time*, never
//! at subscribe time: cursors advance as events are consumed, and the
//! server replays only events newer than the cursor it is given, which is
//! how the gateway resynchronizes without redelivering already-seen events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::frame::OutboundFrame;
use crate::models::{ChannelMessage, SubscriptionInfo};

/// Accessor returning the most recent known resource version for a channel.
pub type CursorAccessor = Arc<dyn Fn() -> String + Send + Sync>;

/// Callback receiving events published on a subscribed channel.
pub type ChannelCallback = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

struct SubEntry {
    namespace: String,
    cursor: CursorAccessor,
}

/// Records desired subscriptions, one per channel.
pub(crate) struct SubscriptionRegistry {
    subs: HashMap<String, SubEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            subs: HashMap::new(),
        }
    }

    /// Record interest in a channel. At most one subscription exists per
    /// channel; re-subscribing replaces the previous entry.
    pub(crate) fn insert(&mut self, channel: &str, namespace: &str, cursor: CursorAccessor) {
        if self.subs.contains_key(channel) {
            log::debug!("Replacing existing subscription for channel '{}'", channel);
        }
        self.subs.insert(
            channel.to_string(),
            SubEntry {
                namespace: namespace.to_string(),
                cursor,
            },
        );
    }

    /// Remove the recorded subscription. Returns false if none existed.
    pub(crate) fn remove(&mut self, channel: &str) -> bool {
        self.subs.remove(channel).is_some()
    }

    /// Build the SUBSCRIBE frame for one channel, reading its cursor now.
    pub(crate) fn subscribe_frame(&self, channel: &str) -> Option<OutboundFrame> {
        self.subs.get(channel).map(|entry| OutboundFrame::Subscribe {
            channel: channel.to_string(),
            namespace: entry.namespace.clone(),
            resource_version: (entry.cursor)(),
        })
    }

    /// Build SUBSCRIBE frames for every recorded channel with freshly read
    /// cursors. Used to resynchronize after a (re-)connect.
    pub(crate) fn replay_frames(&self) -> Vec<OutboundFrame> {
        self.subs
            .iter()
            .map(|(channel, entry)| OutboundFrame::Subscribe {
                channel: channel.clone(),
                namespace: entry.namespace.clone(),
                resource_version: (entry.cursor)(),
            })
            .collect()
    }

    /// Snapshot of the recorded subscriptions.
    pub(crate) fn snapshot(&self) -> Vec<SubscriptionInfo> {
        self.subs
            .iter()
            .map(|(channel, entry)| SubscriptionInfo {
                channel: channel.clone(),
                namespace: entry.namespace.clone(),
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.subs.len()
    }
}

/// Listener lists per channel, independent of subscription state.
///
/// A channel may have listeners without a subscription (they start
/// receiving events once one is created) and a subscription without
/// listeners (events are dropped). Cloning shares the same listener set.
#[derive(Clone, Default)]
pub(crate) struct ChannelListeners {
    inner: Arc<Mutex<HashMap<String, Vec<ChannelCallback>>>>,
}

impl ChannelListeners {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a listener for a channel's inbound events.
    pub(crate) fn add(&self, channel: &str, f: impl Fn(&ChannelMessage) + Send + Sync + 'static) {
        self.inner
            .lock()
            .expect("channel listener lock poisoned")
            .entry(channel.to_string())
            .or_default()
            .push(Arc::new(f));
    }

    /// Deliver a message to every listener on the channel. Returns the
    /// number of listeners invoked.
    pub(crate) fn dispatch(&self, channel: &str, message: &ChannelMessage) -> usize {
        let listeners = {
            let inner = self.inner.lock().expect("channel listener lock poisoned");
            inner.get(channel).cloned().unwrap_or_default()
        };
        for cb in &listeners {
            cb(message);
        }
        listeners.len()
    }
}
