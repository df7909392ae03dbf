use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::computed::seed_computed;
use crate::config::RippleConfig;
use crate::context::Context;
use crate::envelope::{CallInfo, CalledBy};
use crate::error::RippleError;
use crate::extract::extract_by_keys;
use crate::middleware::{Middleware, MiddlewareChain};
use crate::module::{guess_duplicate, init_module_state};
use crate::propagate::{self, CommitOptions, CommitOutcome};
use crate::signal::SignalBus;
use crate::storage::{LocalStorage, MemoryStorage, storage_key};
use crate::subscriber::{RenderSink, Subscriber, SubscriberSpec};
use crate::value::{MODULE_GLOBAL, MODULE_VOID, PartialState, SubscriberId, merge_into};
use crate::watch::fire_immediate;

/// Ripple: the state propagation engine.
///
/// Owns one `Context`: module store, dependency index, middleware chain,
/// signal bus, durable storage and broadcast scheduler. Instances are
/// independent of each other.
///
/// # Examples
///
/// ```ignore
/// let ripple = Ripple::builder()
///     .module("counter", json!({"count": 0}))
///     .build()?;
///
/// let counter = ripple.mount(SubscriberSpec::new("Counter", "counter"), sink)?;
/// ripple.set_state(&counter, json!({"count": 1})).await?;
///
/// assert_eq!(ripple.state("counter").unwrap()["count"], json!(1));
/// ```
pub struct Ripple {
    ctx: Arc<Context>,
}

impl Ripple {
    pub fn builder() -> RippleBuilder {
        RippleBuilder::new()
    }

    // ====================================================================
    // Subscribers
    // ====================================================================

    /// Mount a subscriber.
    ///
    /// Its local state starts as private state, overlaid with its module's
    /// state and then with its stored keys (in-memory cache first, durable
    /// storage when persisted). Connected views are injected, computed
    /// values seeded and immediate watchers fired before this returns.
    pub fn mount(&self, spec: SubscriberSpec, sink: Arc<dyn RenderSink>) -> Result<Arc<Subscriber>, RippleError> {
        let ctx = &self.ctx;
        let mut spec = spec;
        spec.resolve_defaults(&ctx.config);

        let referenced = referenced_modules(&spec);
        if let Some(missing) = referenced.iter().find(|m| !ctx.store.has_module(m)) {
            return Err(RippleError::ModuleNotFound(missing.clone()));
        }

        let id = spec.resolve_id();
        if let Some(existing) = ctx.index.get(&id) {
            guess_duplicate(
                RippleError::DuplicateSubscriber(id.to_string()),
                id.as_str(),
                "subscriber",
                ctx.config.hot,
            )?;
            existing.mark_unmounted();
            ctx.index.remove(&id);
        }

        let module = spec.module().to_string();
        let mut state = spec.private_state.clone();
        merge_into(&mut state, &ctx.store.get_state(&module).unwrap_or_default());
        merge_into(&mut state, &self.restore_stored_keys(&id, &spec));

        let connected: HashMap<String, PartialState> = spec
            .connect
            .iter()
            .map(|(m, keys)| {
                let view = keys.select(&ctx.store.get_state(m).unwrap_or_default());
                (m.clone(), view)
            })
            .collect();

        let sub = Arc::new(Subscriber::new(id.clone(), spec, sink, state, connected));

        let module_state = |m: &str| {
            if m == module {
                sub.state()
            } else {
                ctx.store.get_state(m).unwrap_or_default()
            }
        };
        let computed_modules: BTreeSet<&str> = sub.computed_defs().iter().map(|d| d.module()).collect();
        for m in computed_modules {
            let info = mount_info(&id, m);
            seed_computed(&sub, m, &module_state(m), &info);
        }

        ctx.index.insert(Arc::clone(&sub));
        fire_immediate(&sub, module_state, &mount_info(&id, &module));

        debug!(subscriber = %id, module = %module, "subscriber mounted");
        Ok(sub)
    }

    fn restore_stored_keys(&self, id: &SubscriberId, spec: &SubscriberSpec) -> PartialState {
        let mut restored = PartialState::new();
        if spec.stored_keys.is_empty() {
            return restored;
        }
        if let Some(cached) = self.ctx.store.get_ref_state(id) {
            merge_into(&mut restored, &cached);
        }
        if spec.persist_stored_keys {
            let key = storage_key(&self.ctx.config.storage_prefix, id);
            match self.ctx.storage.load(&key) {
                Ok(Some(saved)) => {
                    merge_into(&mut restored, &extract_by_keys(&saved, &spec.stored_keys, true).partial_state)
                }
                Ok(None) => {}
                Err(e) => warn!(subscriber = %id, "failed to restore stored keys: {e}"),
            }
        }
        restored
    }

    /// Unmount a subscriber. Updates already decided for it become no-ops.
    pub fn unmount(&self, id: &SubscriberId) -> Result<Arc<Subscriber>, RippleError> {
        let sub = self
            .ctx
            .index
            .remove(id)
            .ok_or_else(|| RippleError::SubscriberNotFound(id.to_string()))?;
        sub.mark_unmounted();
        debug!(subscriber = %id, "subscriber unmounted");
        Ok(sub)
    }

    pub fn subscriber(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        self.ctx.index.get(id)
    }

    // ====================================================================
    // Commits
    // ====================================================================

    /// Commit an untyped value on behalf of `sub`. See `propagate::commit`.
    pub async fn commit(
        &self,
        sub: &Arc<Subscriber>,
        state: Value,
        opts: CommitOptions,
    ) -> Result<CommitOutcome, RippleError> {
        propagate::commit(&self.ctx, sub, state, opts).await
    }

    /// Commit a partial state on behalf of `sub`.
    pub async fn commit_state(
        &self,
        sub: &Arc<Subscriber>,
        state: PartialState,
        opts: CommitOptions,
    ) -> Result<CommitOutcome, RippleError> {
        propagate::commit_state(&self.ctx, sub, state, opts).await
    }

    /// `setState` on the subscriber's own module.
    pub async fn set_state(&self, sub: &Arc<Subscriber>, state: Value) -> Result<CommitOutcome, RippleError> {
        self.commit(sub, state, CommitOptions::new()).await
    }

    /// Write another module's state on behalf of `sub`.
    pub async fn set_module_state(
        &self,
        sub: &Arc<Subscriber>,
        module: &str,
        state: Value,
    ) -> Result<CommitOutcome, RippleError> {
        let opts = CommitOptions::new()
            .module(module)
            .called_by(CalledBy::SetModuleState);
        self.commit(sub, state, opts).await
    }

    /// Re-render `sub` with no state change.
    pub async fn force_update(&self, sub: &Arc<Subscriber>) -> Result<CommitOutcome, RippleError> {
        let opts = CommitOptions::new().called_by(CalledBy::ForceUpdate);
        self.commit_state(sub, PartialState::new(), opts).await
    }

    // ====================================================================
    // State reads
    // ====================================================================

    pub fn state(&self, module: &str) -> Option<PartialState> {
        self.ctx.store.get_state(module)
    }

    pub fn root_state(&self) -> BTreeMap<String, PartialState> {
        self.ctx.store.get_root_state()
    }

    pub fn prev_state(&self, module: &str) -> PartialState {
        self.ctx.store.get_prev_state(module)
    }

    pub fn state_ver(&self, module: &str) -> BTreeMap<String, u8> {
        self.ctx.store.get_state_ver(module)
    }

    /// Cached stored keys of a subscriber.
    pub fn ref_state(&self, id: &SubscriberId) -> Option<PartialState> {
        self.ctx.store.get_ref_state(id)
    }

    // ====================================================================
    // Advanced
    // ====================================================================

    pub fn signals(&self) -> &SignalBus {
        &self.ctx.signals
    }

    pub fn config(&self) -> &RippleConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Number of delayed broadcasts still pending.
    pub fn pending_broadcasts(&self) -> usize {
        self.ctx.scheduler.pending()
    }

    /// Cancel pending delayed broadcasts. Later delayed broadcasts are
    /// dropped.
    pub fn shutdown(&self) {
        info!("ripple shutting down");
        self.ctx.scheduler.shutdown();
    }
}

fn referenced_modules(spec: &SubscriberSpec) -> BTreeSet<String> {
    let mut modules = BTreeSet::new();
    modules.insert(spec.module().to_string());
    modules.extend(spec.connect.keys().cloned());
    modules.extend(spec.computed.iter().map(|d| d.module().to_string()));
    modules.extend(spec.watch.iter().map(|d| d.module().to_string()));
    modules
}

fn mount_info(id: &SubscriberId, module: &str) -> CallInfo {
    CallInfo {
        subscriber_id: Some(id.clone()),
        module: module.to_string(),
        ..Default::default()
    }
}

// ============================================================================
// RippleBuilder
// ============================================================================

/// Startup: configuration, modules and middlewares.
///
/// `$$global` and `$$void` are always registered before user modules.
pub struct RippleBuilder {
    config: RippleConfig,
    modules: Vec<(String, Value)>,
    global: PartialState,
    named: HashMap<String, Arc<dyn Middleware>>,
    extra: Vec<Arc<dyn Middleware>>,
    storage: Option<Arc<dyn LocalStorage>>,
}

impl RippleBuilder {
    pub fn new() -> Self {
        Self {
            config: RippleConfig::default(),
            modules: Vec::new(),
            global: PartialState::new(),
            named: HashMap::new(),
            extra: Vec::new(),
            storage: None,
        }
    }

    pub fn config(mut self, config: RippleConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a module with its initial state, which must be an object.
    pub fn module(mut self, name: &str, state: Value) -> Self {
        self.modules.push((name.to_string(), state));
        self
    }

    /// Initial keys of `$$global`.
    pub fn global(mut self, state: PartialState) -> Self {
        merge_into(&mut self.global, &state);
        self
    }

    /// Register a middleware under a name, referenced from
    /// `RippleConfig::middlewares`.
    pub fn register_middleware(mut self, name: &str, middleware: Arc<dyn Middleware>) -> Self {
        self.named.insert(name.to_string(), middleware);
        self
    }

    /// Append a middleware after the configured ones.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.extra.push(middleware);
        self
    }

    /// Durable storage for persisted stored keys. Defaults to `MemoryStorage`.
    pub fn storage(mut self, storage: Arc<dyn LocalStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn build(self) -> Result<Ripple, RippleError> {
        let mut chain = MiddlewareChain::from_names(&self.config.middlewares, &self.named);
        for m in self.extra {
            chain.push(m);
        }
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let hot = self.config.hot;
        let ctx = Context::new(self.config, chain, storage);

        init_module_state(&ctx.store, MODULE_GLOBAL, self.global, false, hot)?;
        init_module_state(&ctx.store, MODULE_VOID, PartialState::new(), false, hot)?;
        for (name, state) in self.modules {
            let state = match state {
                Value::Object(map) => map,
                other => {
                    return Err(RippleError::InvalidCommit(format!(
                        "initial state of module {name:?} must be an object, got {other}"
                    )));
                }
            };
            // The global module may be extended; every other one only once.
            let must_not_exist = name != MODULE_GLOBAL;
            init_module_state(&ctx.store, &name, state, must_not_exist, hot)?;
        }

        info!(
            modules = ctx.store.modules().len(),
            middlewares = ctx.middlewares.len(),
            "ripple started"
        );
        Ok(Ripple { ctx: Arc::new(ctx) })
    }
}

impl Default for RippleBuilder {
    fn default() -> Self {
        Self::new()
    }
}
