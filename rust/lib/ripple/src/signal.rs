use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::envelope::CalledBy;
use crate::value::{PartialState, SubscriberId, SubscriptionId};

/// Signals sent on the plugin bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Signal {
    #[serde(rename = "STATE_CHANGED")]
    StateChanged,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::StateChanged => "STATE_CHANGED",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `Signal::StateChanged`, sent at most once per commit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChanged {
    pub called_by: CalledBy,
    /// `ccApi/<calledBy>` or `dispatch/<type>`.
    pub action_type: String,
    pub committed_state: PartialState,
    /// What was persisted, or `None` when the commit carried no shared keys.
    pub shared_state: Option<PartialState>,
    pub module: String,
    pub subscriber_id: SubscriberId,
    pub render_key: Option<String>,
}

/// Callback type for bus signals.
pub type SignalHandler = Arc<dyn Fn(Signal, &StateChanged) + Send + Sync>;

/// Fire-and-forget notification bus for plugins.
///
/// Handlers run synchronously on the committing task, in registration
/// order. The handler list is snapshotted before dispatch, so a handler
/// may register or remove handlers.
pub struct SignalBus {
    handlers: RwLock<Vec<(SubscriptionId, SignalHandler)>>,
    next_id: AtomicU64,
}

impl SignalBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler. Returns an id for `off`.
    pub fn on<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Signal, &StateChanged) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().unwrap().push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap();
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != id);
        handlers.len() != before
    }

    pub fn send(&self, signal: Signal, payload: &StateChanged) {
        let handlers: Vec<SignalHandler> = self
            .handlers
            .read()
            .unwrap()
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            handler(signal, payload);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}
