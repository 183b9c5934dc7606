//! Reachability tracking for the primary store.
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bank::BackendResult;

/// Connection state of the primary store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Establishes the connection to a remote backend.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Attempts to connect. On success the connector may keep `notifier` to report
    /// later disconnects or runtime errors.
    async fn connect(&self, notifier: DisconnectNotifier) -> BackendResult<()>;
}

/// Handle a connector uses to report that an established connection went away.
#[derive(Clone)]
pub struct DisconnectNotifier {
    inner: Weak<Inner>,
}

impl DisconnectNotifier {
    pub fn notify(&self, reason: &str) {
        if let Some(inner) = self.inner.upgrade() {
            inner.disconnected(reason);
        }
    }
}

type PendingConnect = Shared<BoxFuture<'static, bool>>;

struct MonitorState {
    state: ConnectionState,
    pending: Option<PendingConnect>,
    last_error: Option<String>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    state: Mutex<MonitorState>,
}

impl Inner {
    async fn attempt(self: Arc<Self>) -> bool {
        let notifier = DisconnectNotifier {
            inner: Arc::downgrade(&self),
        };
        let outcome = self.connector.connect(notifier).await;

        let mut state = self.state.lock();
        state.pending = None;
        match outcome {
            Ok(()) => {
                info!("Connected to primary store");
                state.state = ConnectionState::Connected;
                state.last_error = None;
                true
            }
            Err(err) => {
                warn!("Primary store connection failed: {err}");
                state.state = ConnectionState::Disconnected;
                state.last_error = Some(err.to_string());
                false
            }
        }
    }

    fn disconnected(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.state == ConnectionState::Connected {
            warn!("Primary store disconnected: {reason}");
            state.state = ConnectionState::Disconnected;
        }
        state.last_error = Some(reason.to_string());
    }
}

/// Tracks whether the primary store is reachable and coalesces connection attempts.
#[derive(Clone)]
pub struct ConnectionMonitor {
    inner: Arc<Inner>,
}

impl ConnectionMonitor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        ConnectionMonitor {
            inner: Arc::new(Inner {
                connector,
                state: Mutex::new(MonitorState {
                    state: ConnectionState::Disconnected,
                    pending: None,
                    last_error: None,
                }),
            }),
        }
    }

    /// Connects if needed. Concurrent callers share the single in-flight attempt.
    /// Failure is reported as `false`, never as an error.
    pub async fn connect(&self) -> bool {
        let pending = {
            let mut state = self.inner.state.lock();
            if state.state == ConnectionState::Connected {
                return true;
            }
            match &state.pending {
                Some(pending) => pending.clone(),
                None => {
                    let attempt = Arc::clone(&self.inner).attempt().boxed().shared();
                    state.state = ConnectionState::Connecting;
                    state.pending = Some(attempt.clone());
                    attempt
                }
            }
        };
        pending.await
    }

    /// Last known state; does not touch the network.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    /// Connects when not connected and reports the resulting state.
    pub async fn ensure_connected(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        self.connect().await
    }

    /// Records a runtime failure of an established connection.
    pub fn mark_disconnected(&self, reason: &str) {
        self.inner.disconnected(reason);
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }
}
