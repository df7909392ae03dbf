//! Commit pipeline: stage, decide the source render, run middlewares,
//! apply, persist, signal, broadcast.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::computed::compute_value_for_ref;
use crate::context::{CommitScope, Context};
use crate::envelope::{CallInfo, CalledBy, ChangeEnvelope, action_type};
use crate::error::RippleError;
use crate::extract::extract_by_keys;
use crate::middleware::{ChainOutcome, Completion};
use crate::signal::{Signal, StateChanged};
use crate::storage::storage_key;
use crate::store::SetStateOptions;
use crate::subscriber::Subscriber;
use crate::value::{PartialState, SubscriberId, merge_into, sorted_keys};
use crate::watch::watch_key_for_ref;

/// Receives the subscriber's state after a commit applied, or its
/// untouched state when the commit rendered nothing.
pub type StateCallback = Arc<dyn Fn(&PartialState) + Send + Sync>;

// ============================================================================
// Options and outcomes
// ============================================================================

/// Options of one commit.
#[derive(Clone, Default)]
pub struct CommitOptions {
    /// Target module. Defaults to the source subscriber's own module.
    pub module: Option<String>,
    pub skip_middleware: bool,
    pub payload: Option<Value>,
    pub on_state: Option<StateCallback>,
    /// Action name, reported as `dispatch/<type_name>` for dispatches.
    pub type_name: Option<String>,
    pub called_by: CalledBy,
    pub fn_name: String,
    pub render_key: Option<String>,
    /// Defer the broadcast. Zero means immediate.
    pub delay: Option<Duration>,
}

impl CommitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(mut self, module: &str) -> Self {
        self.module = Some(module.to_string());
        self
    }

    pub fn skip_middleware(mut self) -> Self {
        self.skip_middleware = true;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn on_state<F>(mut self, f: F) -> Self
    where
        F: Fn(&PartialState) + Send + Sync + 'static,
    {
        self.on_state = Some(Arc::new(f));
        self
    }

    /// Mark this commit as a dispatched action named `type_name`.
    pub fn action(mut self, type_name: &str) -> Self {
        self.called_by = CalledBy::Dispatch;
        self.type_name = Some(type_name.to_string());
        self
    }

    pub fn called_by(mut self, called_by: CalledBy) -> Self {
        self.called_by = called_by;
        self
    }

    pub fn fn_name(mut self, fn_name: &str) -> Self {
        self.fn_name = fn_name.to_string();
        self
    }

    pub fn render_key(mut self, render_key: &str) -> Self {
        self.render_key = Some(render_key.to_string());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl fmt::Debug for CommitOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitOptions")
            .field("module", &self.module)
            .field("skip_middleware", &self.skip_middleware)
            .field("called_by", &self.called_by)
            .field("type_name", &self.type_name)
            .field("render_key", &self.render_key)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

/// Who a commit renders first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFor {
    /// The commit targets the source's own module: the source renders
    /// first and is skipped during broadcast.
    OneInsFirstly,
    /// The commit targets another module: every subscriber of it is
    /// reached through broadcast.
    AllInsOfMod,
}

impl StateFor {
    fn classify(target_module: &str, ref_module: &str) -> Self {
        if target_module == ref_module {
            StateFor::OneInsFirstly
        } else {
            StateFor::AllInsOfMod
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RenderType {
    NoOp,
    ByKey,
    ByState,
}

/// What a completed commit did.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReport {
    pub render_type: RenderType,
    /// Final committed state, after middlewares.
    pub committed_state: PartialState,
    /// State persisted to the store, if any.
    pub shared_state: Option<PartialState>,
    pub has_mid: bool,
    /// The broadcast was handed to the scheduler.
    pub delayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    /// The committed value was null.
    Ignored,
    /// The committed value was not an object.
    Rejected,
    /// Issued from a middleware of an in-flight commit; runs once that
    /// commit's chain returned.
    Queued,
    Committed(CommitReport),
}

impl CommitOutcome {
    pub fn report(&self) -> Option<&CommitReport> {
        match self {
            CommitOutcome::Committed(report) => Some(report),
            _ => None,
        }
    }
}

pub(crate) struct CommitRequest {
    target: Arc<Subscriber>,
    state: PartialState,
    opts: CommitOptions,
}

// ============================================================================
// Local render decision
// ============================================================================

/// A decided but not yet applied update of one subscriber.
pub struct PendingUpdate {
    sub: Arc<Subscriber>,
    module: String,
    should_render: bool,
    on_state: Option<StateCallback>,
}

impl PendingUpdate {
    pub fn should_render(&self) -> bool {
        self.should_render
    }

    /// Apply `delta`. A no-op if the subscriber unmounted meanwhile.
    pub fn apply(self, delta: &PartialState) {
        if !self.sub.is_mounted() {
            debug!(subscriber = %self.sub.id(), "skipping update of unmounted subscriber");
            return;
        }
        self.sub.record_applied(&self.module, sorted_keys(delta));
        self.sub.merge_state(delta);
        self.sub.sink().apply_delta(delta, self.should_render);
        if let Some(cb) = &self.on_state {
            cb(&self.sub.state());
        }
    }
}

/// Outcome of `prepare_local_render`.
pub struct LocalRender {
    pub render_type: RenderType,
    pub delta: PartialState,
    /// `None` for `RenderType::NoOp`.
    pub update: Option<PendingUpdate>,
}

/// Decide how `sub` renders `state`, without applying anything.
///
/// Nothing renders when the subscriber is unmounted, the commit is not
/// for it first, or the state is empty outside of a forced update; the
/// state callback still receives the subscriber's current state then. A
/// render key that differs from the subscriber's own also renders
/// nothing. Otherwise stored keys are cached (and persisted when
/// configured), computed values re-evaluated and watchers run.
#[allow(clippy::too_many_arguments)]
pub fn prepare_local_render(
    ctx: &Context,
    sub: &Arc<Subscriber>,
    state: &PartialState,
    state_for: StateFor,
    called_by: CalledBy,
    render_key: Option<&str>,
    info: &CallInfo,
    on_state: Option<&StateCallback>,
) -> LocalRender {
    let no_op = LocalRender {
        render_type: RenderType::NoOp,
        delta: state.clone(),
        update: None,
    };

    if !sub.is_mounted()
        || state_for != StateFor::OneInsFirstly
        || (called_by != CalledBy::ForceUpdate && state.is_empty())
    {
        if let Some(cb) = on_state {
            cb(&sub.state());
        }
        return no_op;
    }

    let mut render_type = RenderType::ByState;
    if let Some(rk) = render_key {
        render_type = RenderType::ByKey;
        if sub.render_key() != Some(rk) {
            return no_op;
        }
    }

    let ref_state = sub.state();
    cache_stored_keys(ctx, sub, &ref_state, state);

    let module = sub.module();
    let computed = compute_value_for_ref(sub, module, &ref_state, state, info);
    let should_render =
        watch_key_for_ref(sub, module, &ref_state, state, info, true) || !computed.is_empty();

    LocalRender {
        render_type,
        delta: state.clone(),
        update: Some(PendingUpdate {
            sub: Arc::clone(sub),
            module: module.to_string(),
            should_render,
            on_state: on_state.cloned(),
        }),
    }
}

fn cache_stored_keys(ctx: &Context, sub: &Subscriber, ref_state: &PartialState, state: &PartialState) {
    let stored_keys = sub.stored_keys();
    if stored_keys.is_empty() {
        return;
    }
    let extracted = extract_by_keys(state, stored_keys, true);
    if extracted.is_state_empty {
        return;
    }

    if sub.persist_stored_keys() {
        let mut entire = extract_by_keys(ref_state, stored_keys, true).partial_state;
        merge_into(&mut entire, &extracted.partial_state);
        let key = storage_key(&ctx.config.storage_prefix, sub.id());
        if let Err(e) = ctx.storage.persist(&key, &entire) {
            warn!(subscriber = %sub.id(), "failed to persist stored keys: {e}");
        }
    }
    ctx.store.set_ref_state(sub.id(), &extracted.partial_state);
}

// ============================================================================
// Commit
// ============================================================================

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Commit an untyped value on behalf of `target`.
///
/// `null` is ignored. Any other non-object is rejected with a warning, or
/// returned as `InvalidCommit` in strict mode. Objects go through
/// `commit_state`.
pub async fn commit(
    ctx: &Arc<Context>,
    target: &Arc<Subscriber>,
    state: Value,
    opts: CommitOptions,
) -> Result<CommitOutcome, RippleError> {
    match state {
        Value::Null => {
            debug!(subscriber = %target.id(), "null commit ignored");
            Ok(CommitOutcome::Ignored)
        }
        Value::Object(map) => commit_state(ctx, target, map, opts).await,
        other => {
            let kind = value_kind(&other);
            if ctx.config.strict {
                return Err(RippleError::InvalidCommit(kind.to_string()));
            }
            warn!(subscriber = %target.id(), kind, "committed state is not a plain json object, ignored");
            Ok(CommitOutcome::Rejected)
        }
    }
}

/// Commit a partial state on behalf of `target`.
///
/// Commits are independent and interleave at their suspension points. A
/// commit issued by a middleware of an in-flight commit of the same
/// context, on that commit's task, is queued instead and returns
/// `CommitOutcome::Queued`. Queued commits run in order once the chain
/// that queued them returned; their errors are logged.
pub async fn commit_state(
    ctx: &Arc<Context>,
    target: &Arc<Subscriber>,
    state: PartialState,
    opts: CommitOptions,
) -> Result<CommitOutcome, RippleError> {
    let req = CommitRequest {
        target: Arc::clone(target),
        state,
        opts,
    };

    if let Some(scope) = ctx.active_commit() {
        debug!(subscriber = %target.id(), "commit issued from a middleware, queueing");
        scope.enqueue(req);
        return Ok(CommitOutcome::Queued);
    }

    let scope = CommitScope::new(ctx);
    let outcome = run_commit(ctx, &scope, req).await;

    while let Some(next) = scope.dequeue() {
        let id = next.target.id().clone();
        if let Err(e) = run_commit(ctx, &scope, next).await {
            warn!(subscriber = %id, "queued commit failed: {e}");
        }
    }

    outcome
}

async fn run_commit(
    ctx: &Arc<Context>,
    scope: &CommitScope,
    req: CommitRequest,
) -> Result<CommitOutcome, RippleError> {
    let CommitRequest {
        target,
        mut state,
        opts,
    } = req;

    let module = opts
        .module
        .clone()
        .unwrap_or_else(|| target.module().to_string());
    if !ctx.store.has_module(&module) {
        return Err(RippleError::ModuleNotFound(module));
    }
    let state_for = StateFor::classify(&module, target.module());
    let info = CallInfo {
        payload: opts.payload.clone(),
        render_key: opts.render_key.clone(),
        subscriber_id: Some(target.id().clone()),
        module: module.clone(),
        fn_name: opts.fn_name.clone(),
    };

    // Stage only; nothing reaches the store before the middlewares ran.
    let module_keys = ctx.store.state_keys(&module);
    let extracted = extract_by_keys(&state, &module_keys, true);
    let shared = (!extracted.is_state_empty).then(|| {
        ctx.store
            .set_state(&module, extracted.partial_state, SetStateOptions { no_save: true })
    });
    if let Some(shared) = &shared {
        merge_into(&mut state, shared);
    }

    let local = prepare_local_render(
        ctx,
        &target,
        &state,
        state_for,
        opts.called_by,
        opts.render_key.as_deref(),
        &info,
        opts.on_state.as_ref(),
    );

    let mut env = ChangeEnvelope {
        called_by: opts.called_by,
        action_type: opts.type_name.clone(),
        payload: opts.payload.clone(),
        render_key: opts.render_key.clone(),
        delay: opts.delay,
        subscriber_id: target.id().clone(),
        module: module.clone(),
        ref_module: target.module().to_string(),
        fn_name: opts.fn_name.clone(),
        committed_state: local.delta,
        shared_state: shared.clone().unwrap_or_default(),
    };

    let skip = opts.skip_middleware;
    let finish = FinishCommit {
        ctx: Arc::clone(ctx),
        target: Arc::clone(&target),
        module,
        state_for,
        info,
        opts,
        render_type: local.render_type,
        update: local.update,
        staged: shared,
    };
    let report: Arc<Mutex<Option<CommitReport>>> = Arc::default();
    let slot = Arc::clone(&report);
    let completion: Completion = Box::new(move |env, has_mid| {
        let done = finish.run(env, has_mid);
        *slot.lock().unwrap() = Some(done);
    });

    let result = scope
        .enter(run_middlewares(ctx, skip, &mut env, completion))
        .await;
    let report = report.lock().unwrap().take();

    match (result, report) {
        (Ok(()), Some(report)) => Ok(CommitOutcome::Committed(report)),
        (Err(RippleError::MiddlewareTimeout(ms)), Some(report)) => {
            warn!(
                subscriber = %target.id(),
                timeout_ms = ms,
                "middleware still running at the deadline after the commit persisted"
            );
            Ok(CommitOutcome::Committed(report))
        }
        (Err(e), _) => Err(e),
        (Ok(()), None) => Err(RippleError::MiddlewareStalled),
    }
}

/// The part of a commit run once the middleware chain reached its end:
/// apply the source's update, persist, signal and broadcast.
struct FinishCommit {
    ctx: Arc<Context>,
    target: Arc<Subscriber>,
    module: String,
    state_for: StateFor,
    info: CallInfo,
    opts: CommitOptions,
    render_type: RenderType,
    update: Option<PendingUpdate>,
    /// Shared state staged before the chain ran.
    staged: Option<PartialState>,
}

impl FinishCommit {
    fn run(self, env: &ChangeEnvelope, has_mid: bool) -> CommitReport {
        let ctx = &self.ctx;
        if let Some(update) = self.update {
            update.apply(&env.committed_state);
        }

        // Middlewares may have rewritten the envelope, so re-extract.
        let saved = if has_mid {
            ctx.store
                .save_shared_state(&self.module, env.shared_state.clone(), true)
        } else {
            self.staged
                .and_then(|s| ctx.store.save_shared_state(&self.module, s, false))
        };

        if self.render_type != RenderType::NoOp || saved.is_some() {
            ctx.signals.send(
                Signal::StateChanged,
                &StateChanged {
                    called_by: self.opts.called_by,
                    action_type: action_type(self.opts.called_by, self.opts.type_name.as_deref()),
                    committed_state: env.committed_state.clone(),
                    shared_state: saved.clone(),
                    module: self.module.clone(),
                    subscriber_id: self.target.id().clone(),
                    render_key: self.opts.render_key.clone(),
                },
            );
        }

        let delayed = match &saved {
            Some(saved) => trigger_broadcast(
                ctx,
                &self.target,
                saved.clone(),
                self.state_for,
                &self.info,
                self.opts.delay,
            ),
            None => false,
        };

        debug!(
            subscriber = %self.target.id(),
            module = %self.module,
            render = ?self.render_type,
            has_mid,
            saved = saved.is_some(),
            "commit finished"
        );

        CommitReport {
            render_type: self.render_type,
            committed_state: env.committed_state.clone(),
            shared_state: saved,
            has_mid,
            delayed,
        }
    }
}

/// Run the chain and resolve how it ended. A halted chain never resolves
/// unless a middleware timeout is configured.
async fn run_middlewares(
    ctx: &Context,
    skip: bool,
    env: &mut ChangeEnvelope,
    completion: Completion,
) -> Result<(), RippleError> {
    let bounded = ctx.config.middleware_timeout_ms;
    let chain = ctx.middlewares.call_middlewares(skip, env, completion);

    let outcome = match bounded {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), chain)
            .await
            .map_err(|_| RippleError::MiddlewareTimeout(ms))??,
        None => chain.await?,
    };

    match outcome {
        ChainOutcome::Completed { .. } => Ok(()),
        ChainOutcome::Halted if bounded.is_some() => Err(RippleError::MiddlewareStalled),
        ChainOutcome::Halted => {
            warn!(module = %env.module, subscriber = %env.subscriber_id, "middleware chain halted, commit stalls");
            std::future::pending().await
        }
    }
}

// ============================================================================
// Broadcast
// ============================================================================

/// Coalescing key of a delayed broadcast: source id plus the changed keys.
pub fn compute_feature(id: &SubscriberId, shared: &PartialState) -> String {
    let mut feature = id.to_string();
    for key in sorted_keys(shared) {
        feature.push('|');
        feature.push_str(&key);
    }
    feature
}

/// Broadcast now, or hand the broadcast to the scheduler when a non-zero
/// delay is given. Returns whether it was deferred.
pub fn trigger_broadcast(
    ctx: &Arc<Context>,
    source: &Arc<Subscriber>,
    shared: PartialState,
    state_for: StateFor,
    info: &CallInfo,
    delay: Option<Duration>,
) -> bool {
    match delay.filter(|d| !d.is_zero()) {
        Some(delay) => {
            let feature = compute_feature(source.id(), &shared);
            let ctx_c = Arc::clone(ctx);
            let source = Arc::clone(source);
            let info = info.clone();
            ctx.scheduler.run_later(feature, delay, move || {
                broadcast_state(&ctx_c, &source, &shared, state_for, &info);
            });
            true
        }
        None => {
            broadcast_state(ctx, source, &shared, state_for, info);
            false
        }
    }
}

/// Fan a persisted change out to every other affected subscriber.
///
/// Belonging subscribers (except the source when it already rendered) get
/// the shared delta applied directly. Connected subscribers re-run their
/// computed and watch declarations against the module's prev snapshot and
/// are force-rerendered when that warrants it.
pub fn broadcast_state(
    ctx: &Context,
    source: &Subscriber,
    shared: &PartialState,
    state_for: StateFor,
    info: &CallInfo,
) {
    if shared.is_empty() {
        return;
    }
    let module = info.module.as_str();

    let mut scope = vec![source.class_key().to_string()];
    scope.extend(source.render_key_classes().iter().cloned());
    let refs = ctx
        .index
        .find_update_refs(module, shared, info.render_key.as_deref(), &scope);

    let skip_source = state_for == StateFor::OneInsFirstly;
    for sub in &refs.belong {
        if skip_source && sub.id() == source.id() {
            continue;
        }
        let local = prepare_local_render(
            ctx,
            sub,
            shared,
            StateFor::OneInsFirstly,
            CalledBy::BroadcastState,
            None,
            info,
            None,
        );
        if let Some(update) = local.update {
            update.apply(&local.delta);
        }
    }

    if refs.connect.is_empty() {
        return;
    }
    let prev = ctx.store.get_prev_state(module);
    let current = ctx.store.get_state(module).unwrap_or_default();
    for sub in &refs.connect {
        if !sub.is_mounted() {
            continue;
        }
        let computed = compute_value_for_ref(sub, module, &prev, shared, info);
        let reads_changed = sub
            .connections()
            .get(module)
            .is_some_and(|keys| refs.shared_state_keys.iter().any(|k| keys.contains(k)));
        let should_render =
            watch_key_for_ref(sub, module, &prev, shared, info, reads_changed) || !computed.is_empty();

        sub.record_applied(module, refs.shared_state_keys.clone());
        if should_render {
            sub.reinject_connected_state(module, &current);
            sub.sink().force_rerender();
        }
    }

    debug!(
        module,
        belong = refs.belong.len(),
        connect = refs.connect.len(),
        "broadcast finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::Ripple;
    use crate::subscriber::{RecordingSink, SubscriberSpec};
    use serde_json::json;
    use std::sync::Mutex;

    fn obj(v: Value) -> PartialState {
        v.as_object().cloned().unwrap()
    }

    fn app() -> Ripple {
        Ripple::builder()
            .module("todo", json!({"items": [], "filter": "all"}))
            .build()
            .unwrap()
    }

    fn mount(app: &Ripple, spec: SubscriberSpec) -> (Arc<Subscriber>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let sub = app.mount(spec, sink.clone()).unwrap();
        (sub, sink)
    }

    // ========================================================================
    // Local render decision
    // ========================================================================

    #[test]
    fn other_module_is_no_op_but_calls_back() {
        let app = app();
        let (sub, _) = mount(&app, SubscriberSpec::new("Item", "todo").key("1"));
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let cb: StateCallback = Arc::new(move |state: &PartialState| *s.lock().unwrap() = Some(state.clone()));

        let local = prepare_local_render(
            app.context(),
            &sub,
            &obj(json!({"filter": "done"})),
            StateFor::AllInsOfMod,
            CalledBy::SetState,
            None,
            &CallInfo::default(),
            Some(&cb),
        );
        assert_eq!(local.render_type, RenderType::NoOp);
        assert!(local.update.is_none());
        assert_eq!(seen.lock().unwrap().as_ref().unwrap()["filter"], json!("all"));
    }

    #[test]
    fn empty_state_is_no_op_unless_forced() {
        let app = app();
        let (sub, _) = mount(&app, SubscriberSpec::new("Item", "todo").key("1"));
        let empty = PartialState::new();
        let info = CallInfo::default();

        let plain = prepare_local_render(app.context(), &sub, &empty, StateFor::OneInsFirstly, CalledBy::SetState, None, &info, None);
        assert_eq!(plain.render_type, RenderType::NoOp);

        let forced = prepare_local_render(app.context(), &sub, &empty, StateFor::OneInsFirstly, CalledBy::ForceUpdate, None, &info, None);
        assert_eq!(forced.render_type, RenderType::ByState);
        assert!(forced.update.is_some());
    }

    #[test]
    fn render_key_mismatch_degrades_to_no_op() {
        let app = app();
        let (sub, _) = mount(&app, SubscriberSpec::new("Item", "todo").key("1").render_key("1"));
        let state = obj(json!({"filter": "done"}));
        let info = CallInfo::default();

        let hit = prepare_local_render(app.context(), &sub, &state, StateFor::OneInsFirstly, CalledBy::SetState, Some("1"), &info, None);
        assert_eq!(hit.render_type, RenderType::ByKey);

        let miss = prepare_local_render(app.context(), &sub, &state, StateFor::OneInsFirstly, CalledBy::SetState, Some("2"), &info, None);
        assert_eq!(miss.render_type, RenderType::NoOp);
    }

    #[test]
    fn pending_update_applies_only_when_invoked() {
        let app = app();
        let (sub, sink) = mount(&app, SubscriberSpec::new("Item", "todo").key("1"));
        let state = obj(json!({"filter": "done"}));

        let local = prepare_local_render(app.context(), &sub, &state, StateFor::OneInsFirstly, CalledBy::SetState, None, &CallInfo::default(), None);
        assert!(sink.deltas.lock().unwrap().is_empty());

        local.update.unwrap().apply(&local.delta);
        assert_eq!(sink.deltas.lock().unwrap().as_slice(), &[(state.clone(), true)]);
        assert_eq!(sub.state()["filter"], json!("done"));
        assert_eq!(sub.applied()[0].keys, vec!["filter"]);
    }

    #[test]
    fn pending_update_on_unmounted_is_dropped() {
        let app = app();
        let (sub, sink) = mount(&app, SubscriberSpec::new("Item", "todo").key("1"));
        let state = obj(json!({"filter": "done"}));
        let local = prepare_local_render(app.context(), &sub, &state, StateFor::OneInsFirstly, CalledBy::SetState, None, &CallInfo::default(), None);

        app.unmount(sub.id()).unwrap();
        local.update.unwrap().apply(&local.delta);
        assert!(sink.deltas.lock().unwrap().is_empty());
    }

    #[test]
    fn stored_keys_are_cached_and_persisted() {
        let app = app();
        let spec = SubscriberSpec::new("Item", "todo")
            .key("1")
            .private_state(obj(json!({"draft": "", "pinned": false})))
            .stored_keys(&["draft", "pinned"], true);
        let (sub, _) = mount(&app, spec);

        prepare_local_render(
            app.context(),
            &sub,
            &obj(json!({"draft": "milk"})),
            StateFor::OneInsFirstly,
            CalledBy::SetState,
            None,
            &CallInfo::default(),
            None,
        );

        assert_eq!(app.ref_state(sub.id()), Some(obj(json!({"draft": "milk"}))));
        let key = storage_key("CCSS", sub.id());
        let persisted = app.context().storage.load(&key).unwrap().unwrap();
        assert_eq!(persisted, obj(json!({"draft": "milk", "pinned": false})));
    }

    // ========================================================================
    // Feature key
    // ========================================================================

    #[test]
    fn feature_depends_on_keys_not_values() {
        let id = SubscriberId::new("Counter", "a");
        let a = compute_feature(&id, &obj(json!({"count": 1, "step": 2})));
        let b = compute_feature(&id, &obj(json!({"step": 9, "count": 5})));
        assert_eq!(a, b);
        assert_eq!(a, "Counter$a|count|step");
        assert_ne!(a, compute_feature(&id, &obj(json!({"count": 1}))));
    }

    #[tokio::test]
    async fn non_object_commit_is_rejected() {
        let app = app();
        let (sub, sink) = mount(&app, SubscriberSpec::new("Item", "todo").key("1"));
        let outcome = commit(app.context(), &sub, json!([1, 2]), CommitOptions::new()).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Rejected);
        assert!(sink.deltas.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn strict_mode_returns_invalid_commit() {
        let app = Ripple::builder()
            .config(crate::config::RippleConfig {
                strict: true,
                ..Default::default()
            })
            .module("todo", json!({"filter": "all"}))
            .build()
            .unwrap();
        let (sub, _) = mount(&app, SubscriberSpec::new("Item", "todo").key("1"));
        let err = commit(app.context(), &sub, json!("oops"), CommitOptions::new()).await.unwrap_err();
        assert!(matches!(err, RippleError::InvalidCommit(kind) if kind == "string"));
    }

    #[tokio::test]
    async fn unknown_target_module_fails() {
        let app = app();
        let (sub, _) = mount(&app, SubscriberSpec::new("Item", "todo").key("1"));
        let err = commit(app.context(), &sub, json!({"x": 1}), CommitOptions::new().module("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, RippleError::ModuleNotFound(_)));
    }
}
