//! In-memory transport for integration tests.
//!
//! `MockServer` plays the remote service: it records every frame the
//! gateway sends, scripts inbound events, and can refuse or drop
//! connections to exercise the reconnect path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use exec_link::{ExecLinkError, Result, Transport, TransportEvent, TransportFactory};
use tokio::sync::mpsc;

/// Route gateway logs through the test harness; enable with `RUST_LOG`.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Default)]
struct State {
    /// Total connection attempts, including refused ones.
    attempts: usize,
    /// Number of upcoming connection attempts to refuse.
    refuse: usize,
    /// Frames sent by the gateway, per successful connection.
    frames: Vec<Vec<String>>,
    /// Inbound event injectors, per successful connection.
    event_tx: Vec<mpsc::UnboundedSender<Result<TransportEvent>>>,
    pings: usize,
    /// Close codes the gateway sent while closing.
    close_codes: Vec<Option<u16>>,
}

/// Test-side handle scripting the remote end of the connection.
#[derive(Clone)]
pub struct MockServer {
    inner: Arc<Mutex<State>>,
}

pub struct MockFactory {
    inner: Arc<Mutex<State>>,
}

struct MockTransport {
    inner: Arc<Mutex<State>>,
    conn: usize,
    events: mpsc::UnboundedReceiver<Result<TransportEvent>>,
}

impl MockServer {
    pub fn new() -> (Self, Arc<MockFactory>) {
        let inner = Arc::new(Mutex::new(State::default()));
        (
            Self {
                inner: inner.clone(),
            },
            Arc::new(MockFactory { inner }),
        )
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.lock().unwrap().attempts
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: usize) {
        self.inner.lock().unwrap().refuse = n;
    }

    pub fn ping_count(&self) -> usize {
        self.inner.lock().unwrap().pings
    }

    pub fn close_codes(&self) -> Vec<Option<u16>> {
        self.inner.lock().unwrap().close_codes.clone()
    }

    /// Frames sent so far on connection `conn` (0 = first successful).
    pub fn frames(&self, conn: usize) -> Vec<String> {
        let state = self.inner.lock().unwrap();
        state.frames.get(conn).cloned().unwrap_or_default()
    }

    /// Inject one inbound text frame on the latest connection.
    pub fn push_text(&self, text: &str) {
        let state = self.inner.lock().unwrap();
        let tx = state.event_tx.last().expect("no connection to push on");
        tx.send(Ok(TransportEvent::Text(text.to_string())))
            .expect("connection task dropped its receiver");
    }

    /// Close the latest connection from the server side.
    pub fn push_closed(&self, code: Option<u16>, reason: &str) {
        let state = self.inner.lock().unwrap();
        let tx = state.event_tx.last().expect("no connection to close");
        let _ = tx.send(Ok(TransportEvent::Closed {
            code,
            reason: reason.to_string(),
        }));
    }

    /// Kill the latest connection abruptly (stream ends with no close).
    pub fn drop_connection(&self) {
        self.inner.lock().unwrap().event_tx.pop();
    }

    /// Wait until connection `conn` has sent at least `count` frames.
    pub async fn wait_for_frames(&self, conn: usize, count: usize) -> Vec<String> {
        for _ in 0..2000 {
            {
                let state = self.inner.lock().unwrap();
                if state.frames.get(conn).map_or(0, Vec::len) >= count {
                    return state.frames[conn].clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} frame(s) on connection {}", count, conn);
    }

    /// Wait until `n` connection attempts have been made.
    pub async fn wait_for_attempts(&self, n: usize) {
        for _ in 0..2000 {
            if self.connect_attempts() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {} connection attempt(s)", n);
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = {
            let mut state = self.inner.lock().unwrap();
            state.attempts += 1;
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(ExecLinkError::WebSocketError(
                    "mock server refused the connection".to_string(),
                ));
            }
            state.frames.push(Vec::new());
            state.event_tx.push(tx);
            state.frames.len() - 1
        };
        Ok(Box::new(MockTransport {
            inner: self.inner.clone(),
            conn,
            events: rx,
        }))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.inner.lock().unwrap().frames[self.conn].push(text.to_string());
        Ok(())
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.inner.lock().unwrap().pings += 1;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<Result<TransportEvent>> {
        self.events.recv().await
    }

    async fn close(&mut self, code: Option<u16>) -> Result<()> {
        self.inner.lock().unwrap().close_codes.push(code);
        Ok(())
    }
}
