//! Correlation table for outstanding requests.
//!
//! Every request sent over the connection carries a numeric correlation id;
//! the matching response frame echoes it. This table maps outstanding ids
//! to the completion that resolves the suspended caller. Ids come from a
//! simple incrementing counter that starts above the reserved negative
//! sentinel ids used by fixed administrative calls, and an id is never
//! reused while its entry is outstanding.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{ExecLinkError, Result};
use crate::models::SessionSpec;
use crate::session::ExecSession;

/// Reserved correlation id for the administrative "list open sessions" call.
pub const LIST_SESSIONS_ID: i64 = -5;

/// First id handed out by the incrementing counter. Strictly above every
/// reserved sentinel so the two id spaces never collide.
const FIRST_CALL_ID: i64 = 1;

/// What to do when a pending entry completes.
pub(crate) enum PendingAction {
    /// Hand the raw result payload to the waiting caller.
    Respond(oneshot::Sender<Result<JsonValue>>),

    /// A session-create call: on success the result's numeric id becomes
    /// the session's server id and the caller receives the session handle.
    CreateSession {
        spec: SessionSpec,
        tx: oneshot::Sender<Result<ExecSession>>,
    },
}

impl PendingAction {
    /// Complete the waiting caller with an error.
    pub(crate) fn fail(self, err: ExecLinkError) {
        match self {
            PendingAction::Respond(tx) => {
                let _ = tx.send(Err(err));
            }
            PendingAction::CreateSession { tx, .. } => {
                let _ = tx.send(Err(err));
            }
        }
    }
}

struct PendingEntry {
    method: String,
    action: PendingAction,
    /// When set, the entry is failed and removed once this instant passes.
    deadline: Option<Instant>,
}

/// Table of outstanding requests keyed by correlation id.
pub(crate) struct PendingRequests {
    next_id: i64,
    entries: HashMap<i64, PendingEntry>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            next_id: FIRST_CALL_ID,
            entries: HashMap::new(),
        }
    }

    /// Hand out the next correlation id without creating an entry.
    ///
    /// Used for fire-and-forget frames (`stdin`, `resize`) where no server
    /// confirmation is expected.
    pub(crate) fn next_request_id(&mut self) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Register a new outstanding request and return its correlation id.
    pub(crate) fn register(
        &mut self,
        method: &str,
        action: PendingAction,
        timeout: Option<Duration>,
    ) -> i64 {
        let id = self.next_request_id();
        self.insert(id, method, action, timeout);
        id
    }

    /// Register an outstanding request under a reserved sentinel id.
    ///
    /// If a call with the same sentinel is already outstanding, the older
    /// entry is failed first: the id must never identify two callers.
    pub(crate) fn register_reserved(
        &mut self,
        id: i64,
        method: &str,
        action: PendingAction,
        timeout: Option<Duration>,
    ) {
        debug_assert!(id < FIRST_CALL_ID, "reserved ids sit below the counter space");
        if let Some(previous) = self.entries.remove(&id) {
            previous.action.fail(ExecLinkError::InternalError(format!(
                "'{}' call superseded by a newer call with the same reserved id",
                previous.method
            )));
        }
        self.insert(id, method, action, timeout);
    }

    fn insert(&mut self, id: i64, method: &str, action: PendingAction, timeout: Option<Duration>) {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| Instant::now() + t);
        self.entries.insert(
            id,
            PendingEntry {
                method: method.to_string(),
                action,
                deadline,
            },
        );
    }

    /// Whether a request with this id is outstanding.
    pub(crate) fn contains(&self, id: i64) -> bool {
        self.entries.contains_key(&id)
    }

    /// Remove and return the completion for this id, if outstanding.
    pub(crate) fn take(&mut self, id: i64) -> Option<PendingAction> {
        self.entries.remove(&id).map(|e| e.action)
    }

    /// Fail and remove every outstanding entry.
    pub(crate) fn fail_all(&mut self, err: &ExecLinkError) {
        for (_, entry) in self.entries.drain() {
            entry.action.fail(err.clone());
        }
    }

    /// Fail and remove every entry whose deadline has passed.
    pub(crate) fn expire(&mut self, now: Instant) {
        let expired: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(entry) = self.entries.remove(&id) {
                log::warn!(
                    "Request '{}' (id={}) timed out waiting for a response",
                    entry.method,
                    id
                );
                entry.action.fail(ExecLinkError::TimeoutError(format!(
                    "No response for '{}' (id={})",
                    entry.method, id
                )));
            }
        }
    }

    /// The earliest deadline among outstanding entries, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.deadline).min()
    }

    /// Number of outstanding requests.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn respond() -> (PendingAction, oneshot::Receiver<Result<JsonValue>>) {
        let (tx, rx) = oneshot::channel();
        (PendingAction::Respond(tx), rx)
    }

    #[test]
    fn test_ids_are_monotonic_and_start_above_sentinels() {
        let mut table = PendingRequests::new();
        let (a1, _r1) = respond();
        let (a2, _r2) = respond();
        let first = table.register("create", a1, None);
        let second = table.register("create", a2, None);
        assert!(first > LIST_SESSIONS_ID);
        assert_eq!(second, first + 1);
    }

    #[tokio::test]
    async fn test_out_of_order_completion_resolves_correct_callers() {
        let mut table = PendingRequests::new();
        let (a1, r1) = respond();
        let (a2, r2) = respond();
        let first = table.register("create", a1, None);
        let second = table.register("create", a2, None);

        // Deliver responses out of order.
        match table.take(second).unwrap() {
            PendingAction::Respond(tx) => tx.send(Ok(serde_json::json!(2))).unwrap(),
            _ => unreachable!(),
        }
        match table.take(first).unwrap() {
            PendingAction::Respond(tx) => tx.send(Ok(serde_json::json!(1))).unwrap(),
            _ => unreachable!(),
        }

        assert_eq!(r1.await.unwrap().unwrap(), serde_json::json!(1));
        assert_eq!(r2.await.unwrap().unwrap(), serde_json::json!(2));
    }

    #[test]
    fn test_take_unknown_id_is_none() {
        let mut table = PendingRequests::new();
        assert!(table.take(99).is_none());
    }

    #[tokio::test]
    async fn test_reserved_id_supersedes_older_call() {
        let mut table = PendingRequests::new();
        let (a1, r1) = respond();
        let (a2, _r2) = respond();
        table.register_reserved(LIST_SESSIONS_ID, "listSessions", a1, None);
        table.register_reserved(LIST_SESSIONS_ID, "listSessions", a2, None);

        assert_eq!(table.len(), 1);
        let err = r1.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecLinkError::InternalError(_)));
    }

    #[tokio::test]
    async fn test_fail_all_drains_table() {
        let mut table = PendingRequests::new();
        let (a1, r1) = respond();
        table.register("create", a1, None);
        table.fail_all(&ExecLinkError::WebSocketError("connection lost".into()));
        assert_eq!(table.len(), 0);
        assert!(matches!(
            r1.await.unwrap().unwrap_err(),
            ExecLinkError::WebSocketError(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_fails_only_overdue_entries() {
        let mut table = PendingRequests::new();
        let (a1, r1) = respond();
        let (a2, _r2) = respond();
        table.register("create", a1, Some(Duration::from_secs(1)));
        table.register("create", a2, Some(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(2)).await;
        table.expire(Instant::now());

        assert_eq!(table.len(), 1);
        assert!(matches!(
            r1.await.unwrap().unwrap_err(),
            ExecLinkError::TimeoutError(_)
        ));
    }

    #[test]
    fn test_zero_timeout_means_no_deadline() {
        let mut table = PendingRequests::new();
        let (a1, _r1) = respond();
        table.register("create", a1, Some(Duration::ZERO));
        assert!(table.next_deadline().is_none());
    }
}
