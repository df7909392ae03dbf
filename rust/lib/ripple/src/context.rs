use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::RippleConfig;
use crate::deps::DependencyIndex;
use crate::middleware::MiddlewareChain;
use crate::propagate::CommitRequest;
use crate::scheduler::Scheduler;
use crate::signal::SignalBus;
use crate::storage::LocalStorage;
use crate::store::Store;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static ACTIVE_COMMIT: CommitScope;
}

/// Everything one engine instance owns, passed by reference into every
/// propagation step. Independent instances share nothing.
pub struct Context {
    id: u64,
    pub(crate) config: RippleConfig,
    pub(crate) store: Store,
    pub(crate) index: DependencyIndex,
    pub(crate) middlewares: MiddlewareChain,
    pub(crate) signals: SignalBus,
    pub(crate) storage: Arc<dyn LocalStorage>,
    pub(crate) scheduler: Scheduler,
}

impl Context {
    pub(crate) fn new(
        config: RippleConfig,
        middlewares: MiddlewareChain,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            store: Store::new(),
            index: DependencyIndex::new(),
            middlewares,
            signals: SignalBus::new(),
            storage,
            scheduler: Scheduler::new(),
        }
    }

    pub fn config(&self) -> &RippleConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn index(&self) -> &DependencyIndex {
        &self.index
    }

    pub fn signals(&self) -> &SignalBus {
        &self.signals
    }

    /// The scope of the commit of this context whose middlewares the
    /// current task is running, if any. Other tasks never see it.
    pub(crate) fn active_commit(&self) -> Option<CommitScope> {
        ACTIVE_COMMIT
            .try_with(|scope| (scope.context == self.id).then(|| scope.clone()))
            .ok()
            .flatten()
    }
}

/// Queue of commits re-entered from inside one commit's middleware chain.
/// They run, in order, after that chain returns.
#[derive(Clone)]
pub(crate) struct CommitScope {
    context: u64,
    queued: Arc<Mutex<VecDeque<CommitRequest>>>,
}

impl CommitScope {
    pub(crate) fn new(ctx: &Context) -> Self {
        Self {
            context: ctx.id,
            queued: Arc::default(),
        }
    }

    /// Run `fut` with this scope marked active on the current task.
    pub(crate) async fn enter<F: Future>(&self, fut: F) -> F::Output {
        ACTIVE_COMMIT.scope(self.clone(), fut).await
    }

    pub(crate) fn enqueue(&self, req: CommitRequest) {
        self.queued.lock().unwrap().push_back(req);
    }

    pub(crate) fn dequeue(&self) -> Option<CommitRequest> {
        self.queued.lock().unwrap().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn context() -> Context {
        Context::new(
            RippleConfig::default(),
            MiddlewareChain::new(),
            Arc::new(MemoryStorage::new()),
        )
    }

    // ========================================================================
    // Commit scope
    // ========================================================================

    #[tokio::test]
    async fn scope_is_visible_only_inside_enter() {
        let ctx = context();
        assert!(ctx.active_commit().is_none());

        let scope = CommitScope::new(&ctx);
        let inside = scope.enter(async { ctx.active_commit().is_some() }).await;
        assert!(inside);
        assert!(ctx.active_commit().is_none());
    }

    #[tokio::test]
    async fn scope_belongs_to_one_context() {
        let ctx = context();
        let other = context();
        let scope = CommitScope::new(&ctx);
        let seen = scope.enter(async { other.active_commit().is_some() }).await;
        assert!(!seen);
    }

    #[tokio::test]
    async fn scope_does_not_leak_into_spawned_tasks() {
        let ctx = Arc::new(context());
        let scope = CommitScope::new(&ctx);
        let c = Arc::clone(&ctx);
        let seen = scope
            .enter(async move { tokio::spawn(async move { c.active_commit().is_some() }).await })
            .await
            .unwrap();
        assert!(!seen);
    }
}
