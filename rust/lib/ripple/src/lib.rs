//! Ripple: module-partitioned state propagation engine.
//!
//! Shared state lives in named modules. UI instances ("subscribers") own
//! one module and may read others through connect, computed and watch
//! declarations. A commit from one subscriber flows through a fixed
//! pipeline and ripples out to everyone else who reads what changed.
//!
//! # Commit Pipeline
//!
//! 1. Stage the module's shared keys without touching the store
//! 2. Decide how the source subscriber renders (computed, watch, stored keys)
//! 3. Run the middleware chain over the `ChangeEnvelope`
//! 4. Apply the source update, then persist the shared state
//! 5. Send one `STATE_CHANGED` signal
//! 6. Broadcast to belonging and connected subscribers, now or after a delay
//!
//! Steps 4 to 6 run inside the last middleware's `next`. The source
//! subscriber always renders before anyone else hears about the same
//! commit. Commits from different callers interleave; only a commit issued
//! from inside a running middleware is queued behind its chain.
//!
//! # Example
//!
//! ```ignore
//! use openerp_ripple::{Ripple, SubscriberSpec, NoopSink};
//!
//! let app = Ripple::builder()
//!     .module("counter", json!({"count": 0}))
//!     .middleware(from_fn(|env, next| Box::pin(async move {
//!         info!(module = %env.module, "commit");
//!         next.run(env).await
//!     })))
//!     .build()?;
//!
//! let counter = app.mount(SubscriberSpec::new("Counter", "counter"), Arc::new(NoopSink))?;
//! app.set_state(&counter, json!({"count": 1})).await?;
//! ```

pub mod app;
pub mod compare;
pub mod computed;
pub mod config;
pub mod context;
pub mod deps;
pub mod envelope;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod module;
pub mod propagate;
pub mod scheduler;
pub mod signal;
pub mod storage;
pub mod store;
pub mod subscriber;
pub mod value;
pub mod watch;

// Re-export primary types at crate root.
pub use app::{Ripple, RippleBuilder};
pub use compare::Compare;
pub use computed::{ComputeInput, ComputedDef};
pub use config::RippleConfig;
pub use context::Context;
pub use deps::{DependencyIndex, UpdateRefs};
pub use envelope::{CallInfo, CalledBy, ChangeEnvelope};
pub use error::RippleError;
pub use extract::{Extracted, extract_by_keys};
pub use middleware::{BoxFuture, ChainOutcome, Completion, Middleware, MiddlewareChain, Next, from_fn};
pub use module::init_module_state;
pub use propagate::{CommitOptions, CommitOutcome, CommitReport, RenderType, StateFor};
pub use scheduler::Scheduler;
pub use signal::{Signal, SignalBus, StateChanged};
pub use storage::{JsonFileStorage, LocalStorage, MemoryStorage};
pub use store::Store;
pub use subscriber::{AppliedRecord, ConnectKeys, NoopSink, RenderSink, Subscriber, SubscriberSpec};
pub use value::{MODULE_GLOBAL, MODULE_VOID, PartialState, SubscriberId, SubscriptionId};
pub use watch::{WatchDef, WatchEvent};
