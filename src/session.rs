//! Exec session handles and the id-keyed session table.
//!
//! One [`ExecSession`] is one multiplexed logical stream (typically one
//! remote terminal) riding on the shared connection. The server assigns
//! the numeric session id in its create response; the handle only exists
//! once that acknowledgement has arrived, so input and resize calls can
//! never race session creation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use crate::connection::task::GatewayCommand;
use crate::error::{ExecLinkError, Result};

/// Exit code reported to exit listeners when the connection is lost while
/// the session is still open. Distinguishes transport loss from the remote
/// process exiting on its own.
pub const CONNECTION_LOST_EXIT_CODE: i32 = 255;

/// Exit code reported when the server signals a session error
/// (`onExecError`). The protocol carries no numeric code on that event,
/// only the distinct method name.
pub(crate) const EXEC_ERROR_EXIT_CODE: i32 = 1;

/// Callback receiving a session's output payload verbatim.
pub type OutputCallback = Arc<dyn Fn(&JsonValue) + Send + Sync>;

/// Callback receiving a session's exit code (0 = normal).
pub type ExitCallback = Arc<dyn Fn(i32) + Send + Sync>;

/// State shared between an [`ExecSession`] handle and the session table.
pub(crate) struct SessionShared {
    output: Mutex<Vec<OutputCallback>>,
    exit: Mutex<Vec<ExitCallback>>,
    /// Last-known geometry (columns, rows).
    geometry: Mutex<(u16, u16)>,
    exited: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new(cols: u16, rows: u16) -> Arc<Self> {
        Arc::new(Self {
            output: Mutex::new(Vec::new()),
            exit: Mutex::new(Vec::new()),
            geometry: Mutex::new((cols, rows)),
            exited: AtomicBool::new(false),
        })
    }

    fn deliver_output(&self, payload: &JsonValue) {
        let listeners = self.output.lock().expect("session lock poisoned").clone();
        for cb in listeners {
            cb(payload);
        }
    }

    fn deliver_exit(&self, code: i32) {
        self.exited.store(true, Ordering::SeqCst);
        let listeners = self.exit.lock().expect("session lock poisoned").clone();
        for cb in listeners {
            cb(code);
        }
    }
}

/// Handle to one open exec session.
///
/// Obtained from [`ExecGateway::create_session`](crate::gateway::ExecGateway::create_session)
/// once the server has acknowledged creation. Cloning yields another handle
/// to the same session.
#[derive(Clone)]
pub struct ExecSession {
    id: i64,
    shared: Arc<SessionShared>,
    cmd_tx: mpsc::Sender<GatewayCommand>,
}

impl fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecSession")
            .field("id", &self.id)
            .field("exited", &self.is_exited())
            .finish()
    }
}

impl ExecSession {
    pub(crate) fn new(
        id: i64,
        shared: Arc<SessionShared>,
        cmd_tx: mpsc::Sender<GatewayCommand>,
    ) -> Self {
        Self { id, shared, cmd_tx }
    }

    /// Server-assigned session id.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Last-known terminal geometry as (columns, rows).
    pub fn size(&self) -> (u16, u16) {
        *self.shared.geometry.lock().expect("session lock poisoned")
    }

    /// Whether an exit has been observed for this session.
    pub fn is_exited(&self) -> bool {
        self.shared.exited.load(Ordering::SeqCst)
    }

    /// Register a listener for this session's output frames.
    pub fn on_output(&self, f: impl Fn(&JsonValue) + Send + Sync + 'static) {
        self.shared
            .output
            .lock()
            .expect("session lock poisoned")
            .push(Arc::new(f));
    }

    /// Register a listener for this session's exit code.
    pub fn on_exit(&self, f: impl Fn(i32) + Send + Sync + 'static) {
        self.shared
            .exit
            .lock()
            .expect("session lock poisoned")
            .push(Arc::new(f));
    }

    /// Send input to the remote process. Fire-and-forget: no server
    /// confirmation is expected.
    pub async fn send_input(&self, data: impl Into<String>) -> Result<()> {
        if self.is_exited() {
            return Err(ExecLinkError::ConnectionClosed(format!(
                "Session {} has exited",
                self.id
            )));
        }
        self.cmd_tx
            .send(GatewayCommand::SessionInput {
                id: self.id,
                data: data.into(),
            })
            .await
            .map_err(|_| {
                ExecLinkError::WebSocketError("Connection task is not running".to_string())
            })
    }

    /// Resize the remote terminal. Fire-and-forget.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.is_exited() {
            return Err(ExecLinkError::ConnectionClosed(format!(
                "Session {} has exited",
                self.id
            )));
        }
        *self.shared.geometry.lock().expect("session lock poisoned") = (cols, rows);
        self.cmd_tx
            .send(GatewayCommand::SessionResize {
                id: self.id,
                cols,
                rows,
            })
            .await
            .map_err(|_| {
                ExecLinkError::WebSocketError("Connection task is not running".to_string())
            })
    }

    /// End this session locally: remove it from the routing table without
    /// waiting for an exit frame. Exit listeners are not invoked.
    pub async fn close(&self) -> Result<()> {
        self.shared.exited.store(true, Ordering::SeqCst);
        self.cmd_tx
            .send(GatewayCommand::SessionClose { id: self.id })
            .await
            .map_err(|_| {
                ExecLinkError::WebSocketError("Connection task is not running".to_string())
            })
    }
}

/// Id-keyed table of open sessions; routes inbound output and exit frames
/// to the owning session.
pub(crate) struct SessionTable {
    sessions: HashMap<i64, Arc<SessionShared>>,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, id: i64, shared: Arc<SessionShared>) {
        self.sessions.insert(id, shared);
    }

    pub(crate) fn contains(&self, id: i64) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Deliver an output payload to the owning session's listeners.
    /// Returns false if no session matches the id.
    pub(crate) fn route_output(&self, id: i64, payload: &JsonValue) -> bool {
        match self.sessions.get(&id) {
            Some(shared) => {
                shared.deliver_output(payload);
                true
            }
            None => false,
        }
    }

    /// Remove the session and notify its exit listeners with `code`.
    /// Returns false if no session matches the id.
    pub(crate) fn finish(&mut self, id: i64, code: i32) -> bool {
        match self.sessions.remove(&id) {
            Some(shared) => {
                shared.deliver_exit(code);
                true
            }
            None => false,
        }
    }

    /// Remove every session, notifying exit listeners with `code`.
    pub(crate) fn finish_all(&mut self, code: i32) {
        for (_, shared) in self.sessions.drain() {
            shared.deliver_exit(code);
        }
    }

    /// Remove a session without notifying exit listeners (caller-initiated
    /// close).
    pub(crate) fn remove(&mut self, id: i64) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn test_output_routed_only_to_owning_session() {
        let mut table = SessionTable::new();
        let first = SessionShared::new(80, 24);
        let second = SessionShared::new(80, 24);

        let first_hits = Arc::new(AtomicBool::new(false));
        let second_hits = Arc::new(AtomicBool::new(false));
        {
            let hit = first_hits.clone();
            first
                .output
                .lock()
                .unwrap()
                .push(Arc::new(move |_| hit.store(true, Ordering::SeqCst)));
            let hit = second_hits.clone();
            second
                .output
                .lock()
                .unwrap()
                .push(Arc::new(move |_| hit.store(true, Ordering::SeqCst)));
        }
        table.insert(1, first);
        table.insert(2, second);

        assert!(table.route_output(2, &json!("data")));
        assert!(!first_hits.load(Ordering::SeqCst));
        assert!(second_hits.load(Ordering::SeqCst));
    }

    #[test]
    fn test_route_output_unknown_session() {
        let table = SessionTable::new();
        assert!(!table.route_output(9, &json!("data")));
    }

    #[test]
    fn test_finish_removes_and_reports_code() {
        let mut table = SessionTable::new();
        let shared = SessionShared::new(80, 24);
        let code_seen = Arc::new(AtomicI32::new(-1));
        {
            let seen = code_seen.clone();
            shared
                .exit
                .lock()
                .unwrap()
                .push(Arc::new(move |code| seen.store(code, Ordering::SeqCst)));
        }
        table.insert(5, shared);

        assert!(table.finish(5, 0));
        assert_eq!(code_seen.load(Ordering::SeqCst), 0);
        assert!(!table.contains(5));
        assert!(!table.finish(5, 0));
    }

    #[test]
    fn test_finish_all_uses_connection_lost_code() {
        let mut table = SessionTable::new();
        let shared = SessionShared::new(80, 24);
        let code_seen = Arc::new(AtomicI32::new(-1));
        {
            let seen = code_seen.clone();
            shared
                .exit
                .lock()
                .unwrap()
                .push(Arc::new(move |code| seen.store(code, Ordering::SeqCst)));
        }
        table.insert(7, shared);

        table.finish_all(CONNECTION_LOST_EXIT_CODE);
        assert_eq!(code_seen.load(Ordering::SeqCst), CONNECTION_LOST_EXIT_CODE);
        assert_eq!(table.len(), 0);
    }
}
