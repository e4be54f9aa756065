//! Connection lifecycle listeners for the gateway.
//!
//! Callback-based hooks for monitoring the shared connection:
//!
//! - open listeners: fired when the connection is (re-)established
//! - close listeners: fired when the connection closes, with a [`DisconnectReason`]
//! - error listeners: fired on transport or protocol errors
//! - `on_send` / `on_receive`: optional debug hooks for raw frames
//!
//! Listeners can be registered at any time. Registration accepts a
//! `replay` flag: when set, a listener added *after* an event of its
//! category has already fired is invoked once immediately with the most
//! recent such event. This closes the race between registering a listener
//! and the event it cares about.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Why the gateway's connection ended, as handed to close listeners.
#[derive(Debug, Clone)]
pub struct DisconnectReason {
    /// What ended the connection, in human-readable form.
    pub message: String,
    /// Transport close code, when one was exchanged. 1000 marks a graceful
    /// shutdown; any other code means the loss was unexpected and the
    /// reconnect policy applies.
    pub code: Option<u16>,
}

impl DisconnectReason {
    /// A reason carrying only a description (abrupt losses have no code).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// A reason carrying the close code the transport reported.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// A transport or dial failure reported to error listeners.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    /// What failed.
    pub message: String,
    /// Whether the gateway will keep trying after this error. `false` once
    /// reconnection is disabled or its attempt budget is exhausted.
    pub recoverable: bool,
}

impl ConnectionError {
    /// Describe a failure and whether recovery is still being attempted.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Callback invoked when the connection opens.
pub type OnOpenCallback = Arc<dyn Fn() + Send + Sync>;

/// Callback invoked when the connection closes.
pub type OnCloseCallback = Arc<dyn Fn(&DisconnectReason) + Send + Sync>;

/// Callback invoked on connection errors.
pub type OnErrorCallback = Arc<dyn Fn(&ConnectionError) + Send + Sync>;

/// Callback invoked with the raw text of a sent or received frame.
pub type OnRawFrameCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct Inner {
    open: Vec<OnOpenCallback>,
    close: Vec<OnCloseCallback>,
    error: Vec<OnErrorCallback>,
    send: Vec<OnRawFrameCallback>,
    receive: Vec<OnRawFrameCallback>,
    /// Whether an open event has fired at least once.
    opened: bool,
    /// Most recent close event, kept for replay registration.
    last_close: Option<DisconnectReason>,
    /// Most recent error event, kept for replay registration.
    last_error: Option<ConnectionError>,
}

/// Shared, thread-safe set of connection lifecycle listeners.
///
/// Cloning is cheap; all clones observe the same listener set. The lock is
/// never held while a callback runs, so listeners may register further
/// listeners without deadlocking.
#[derive(Clone, Default)]
pub struct ConnectionListeners {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for ConnectionListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().expect("listener lock poisoned");
        f.debug_struct("ConnectionListeners")
            .field("open", &inner.open.len())
            .field("close", &inner.close.len())
            .field("error", &inner.error.len())
            .finish()
    }
}

impl ConnectionListeners {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an open listener.
    ///
    /// With `replay` set, the listener fires once immediately if the
    /// connection has already opened at least once.
    pub fn add_open_listener(&self, replay: bool, f: impl Fn() + Send + Sync + 'static) {
        let cb: OnOpenCallback = Arc::new(f);
        let past = {
            let mut inner = self.inner.lock().expect("listener lock poisoned");
            inner.open.push(cb.clone());
            replay && inner.opened
        };
        if past {
            cb();
        }
    }

    /// Register a close listener.
    ///
    /// With `replay` set, the listener fires once immediately with the most
    /// recent close event if one has already occurred.
    pub fn add_close_listener(
        &self,
        replay: bool,
        f: impl Fn(&DisconnectReason) + Send + Sync + 'static,
    ) {
        let cb: OnCloseCallback = Arc::new(f);
        let past = {
            let mut inner = self.inner.lock().expect("listener lock poisoned");
            inner.close.push(cb.clone());
            if replay { inner.last_close.clone() } else { None }
        };
        if let Some(reason) = past {
            cb(&reason);
        }
    }

    /// Register an error listener.
    ///
    /// With `replay` set, the listener fires once immediately with the most
    /// recent error if one has already occurred.
    pub fn add_error_listener(
        &self,
        replay: bool,
        f: impl Fn(&ConnectionError) + Send + Sync + 'static,
    ) {
        let cb: OnErrorCallback = Arc::new(f);
        let past = {
            let mut inner = self.inner.lock().expect("listener lock poisoned");
            inner.error.push(cb.clone());
            if replay { inner.last_error.clone() } else { None }
        };
        if let Some(error) = past {
            cb(&error);
        }
    }

    /// Register a debug hook for every raw outbound frame.
    pub fn on_send(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        let mut inner = self.inner.lock().expect("listener lock poisoned");
        inner.send.push(Arc::new(f));
    }

    /// Register a debug hook for every raw inbound frame.
    pub fn on_receive(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        let mut inner = self.inner.lock().expect("listener lock poisoned");
        inner.receive.push(Arc::new(f));
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_open(&self) {
        let listeners = {
            let mut inner = self.inner.lock().expect("listener lock poisoned");
            inner.opened = true;
            inner.open.clone()
        };
        for cb in listeners {
            cb();
        }
    }

    pub(crate) fn emit_close(&self, reason: DisconnectReason) {
        let listeners = {
            let mut inner = self.inner.lock().expect("listener lock poisoned");
            inner.last_close = Some(reason.clone());
            inner.close.clone()
        };
        for cb in listeners {
            cb(&reason);
        }
    }

    pub(crate) fn emit_error(&self, error: ConnectionError) {
        let listeners = {
            let mut inner = self.inner.lock().expect("listener lock poisoned");
            inner.last_error = Some(error.clone());
            inner.error.clone()
        };
        for cb in listeners {
            cb(&error);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        let listeners = {
            let inner = self.inner.lock().expect("listener lock poisoned");
            inner.send.clone()
        };
        for cb in listeners {
            cb(raw);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        let listeners = {
            let inner = self.inner.lock().expect("listener lock poisoned");
            inner.receive.clone()
        };
        for cb in listeners {
            cb(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_open_reaches_all_listeners() {
        let listeners = ConnectionListeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            listeners.add_open_listener(false, move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        listeners.emit_open();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_error_replay_fires_once_for_past_event() {
        let listeners = ConnectionListeners::new();
        listeners.emit_error(ConnectionError::new("boom", true));

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        listeners.add_error_listener(true, move |err| {
            assert_eq!(err.message, "boom");
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_replay_without_flag() {
        let listeners = ConnectionListeners::new();
        listeners.emit_error(ConnectionError::new("boom", true));

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        listeners.add_error_listener(false, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Still fires for future events.
        listeners.emit_error(ConnectionError::new("again", false));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_replay_without_past_event_is_silent() {
        let listeners = ConnectionListeners::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        listeners.add_close_listener(true, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_register_listener() {
        let listeners = ConnectionListeners::new();
        let inner = listeners.clone();
        listeners.add_open_listener(false, move || {
            inner.add_error_listener(false, |_| {});
        });
        listeners.emit_open();
    }
}
