use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::value::{PartialState, SubscriberId};

/// Which API produced a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum CalledBy {
    ForceUpdate,
    #[default]
    SetState,
    SetModuleState,
    Invoke,
    Sync,
    /// A named action dispatched through a reducer-like layer.
    Dispatch,
    /// Internal: re-render of a non-source subscriber during broadcast.
    /// Never reaches middleware or signals.
    BroadcastState,
}

impl CalledBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalledBy::ForceUpdate => "forceUpdate",
            CalledBy::SetState => "setState",
            CalledBy::SetModuleState => "setModuleState",
            CalledBy::Invoke => "invoke",
            CalledBy::Sync => "sync",
            CalledBy::Dispatch => "dispatch",
            CalledBy::BroadcastState => "broadcastState",
        }
    }

    /// Whether this is a direct API call rather than a dispatched action.
    pub fn is_api(&self) -> bool {
        matches!(
            self,
            CalledBy::ForceUpdate
                | CalledBy::SetState
                | CalledBy::SetModuleState
                | CalledBy::Invoke
                | CalledBy::Sync
        )
    }
}

impl fmt::Display for CalledBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action type string reported to signal handlers: `ccApi/<calledBy>` for
/// direct API calls, `dispatch/<type>` otherwise.
pub fn action_type(called_by: CalledBy, type_name: Option<&str>) -> String {
    if called_by.is_api() {
        format!("ccApi/{called_by}")
    } else {
        format!("dispatch/{}", type_name.unwrap_or_default())
    }
}

/// Context of one commit, handed to computed and watch declarations.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CallInfo {
    pub payload: Option<Value>,
    pub render_key: Option<String>,
    /// Subscriber that triggered the commit.
    pub subscriber_id: Option<SubscriberId>,
    /// Module the commit targets.
    pub module: String,
    pub fn_name: String,
}

/// The mutable object passed through the middleware chain.
///
/// `committed_state` is what the source subscriber applies once the chain
/// completes; `shared_state` is what gets persisted to the store. Writing
/// a module key into only one of them makes the two disagree, which is why
/// `mod_state` exists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEnvelope {
    pub called_by: CalledBy,
    pub action_type: Option<String>,
    pub payload: Option<Value>,
    pub render_key: Option<String>,
    #[serde(skip)]
    pub delay: Option<Duration>,
    pub subscriber_id: SubscriberId,
    /// Module the commit targets.
    pub module: String,
    /// Owning module of the source subscriber.
    pub ref_module: String,
    pub fn_name: String,
    pub committed_state: PartialState,
    pub shared_state: PartialState,
}

impl ChangeEnvelope {
    /// Write one key into both the committed and the shared state.
    ///
    /// This does not re-run computed or watch declarations.
    pub fn mod_state(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.committed_state.insert(key.clone(), value.clone());
        self.shared_state.insert(key, value);
    }
}
