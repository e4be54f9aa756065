use serde::{Deserialize, Serialize};

/// Snapshot of one recorded channel subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    /// Channel identifier.
    pub channel: String,
    /// Namespace scope the subscription was registered with.
    pub namespace: String,
}
