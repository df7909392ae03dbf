use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::envelope::ChangeEnvelope;
use crate::error::RippleError;

/// A boxed, `Send`-able future borrowing for `'a`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A step of the commit pipeline, run after the source subscriber's render
/// was decided and before shared state is persisted.
///
/// A middleware advances the chain by awaiting `next.run(env)`. Once the
/// last middleware advanced, the commit is applied and persisted inside
/// that call, so code after `next.run(env).await` sees the commit done and
/// its envelope changes are no longer picked up. Returning without
/// advancing halts the commit. An `Err` aborts the commit and is returned
/// to the committer.
///
/// ```ignore
/// struct Clamp;
///
/// impl Middleware for Clamp {
///     fn handle<'a>(&'a self, env: &'a mut ChangeEnvelope, next: Next<'a>) -> BoxFuture<'a, Result<(), RippleError>> {
///         Box::pin(async move {
///             env.mod_state("count", json!(99));
///             next.run(env).await
///         })
///     }
/// }
/// ```
pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        env: &'a mut ChangeEnvelope,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), RippleError>>;
}

/// One entry of the chain.
#[derive(Clone)]
pub enum MiddlewareSlot {
    Handler(Arc<dyn Middleware>),
    /// A configured name nothing was registered under. Skipped with a warning.
    Unresolved(String),
}

/// Work run once when the chain reaches its end, with the final envelope
/// and whether any middleware slot was passed.
pub type Completion = Box<dyn FnOnce(&ChangeEnvelope, bool) + Send>;

struct ChainEnd {
    reached: AtomicBool,
    completion: Mutex<Option<Completion>>,
}

impl ChainEnd {
    fn new(completion: Completion) -> Self {
        Self {
            reached: AtomicBool::new(false),
            completion: Mutex::new(Some(completion)),
        }
    }

    fn finish(&self, env: &ChangeEnvelope, has_mid: bool) {
        self.reached.store(true, Ordering::Release);
        let completion = self.completion.lock().unwrap().take();
        if let Some(completion) = completion {
            completion(env, has_mid);
        }
    }
}

/// Continuation handed to a middleware. Consumed by `run`, so each
/// middleware advances at most once.
pub struct Next<'a> {
    rest: &'a [MiddlewareSlot],
    end: &'a ChainEnd,
}

impl<'a> Next<'a> {
    /// Run the remaining middlewares, then the completion.
    pub fn run<'e>(self, env: &'e mut ChangeEnvelope) -> BoxFuture<'e, Result<(), RippleError>>
    where
        'a: 'e,
    {
        Box::pin(async move {
            let mut rest = self.rest;
            loop {
                match rest.split_first() {
                    None => {
                        self.end.finish(env, true);
                        return Ok(());
                    }
                    Some((MiddlewareSlot::Unresolved(name), tail)) => {
                        warn!(middleware = %name, "middleware is not registered, skipping");
                        rest = tail;
                    }
                    Some((MiddlewareSlot::Handler(handler), tail)) => {
                        let next = Next {
                            rest: tail,
                            end: self.end,
                        };
                        return handler.handle(env, next).await;
                    }
                }
            }
        })
    }
}

struct FnMiddleware<F>(F);

impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut ChangeEnvelope, Next<'a>) -> BoxFuture<'a, Result<(), RippleError>>
        + Send
        + Sync,
{
    fn handle<'a>(
        &'a self,
        env: &'a mut ChangeEnvelope,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), RippleError>> {
        (self.0)(env, next)
    }
}

/// Adapt a closure into a middleware.
///
/// ```ignore
/// let audit = from_fn(|env, next| Box::pin(async move {
///     info!(module = %env.module, "commit");
///     next.run(env).await
/// }));
/// ```
pub fn from_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: for<'a> Fn(&'a mut ChangeEnvelope, Next<'a>) -> BoxFuture<'a, Result<(), RippleError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(FnMiddleware(f))
}

/// How a chain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every middleware advanced and the completion ran. `has_mid` is false
    /// when the chain was skipped or empty.
    Completed { has_mid: bool },
    /// A middleware returned without advancing. The completion never ran.
    Halted,
}

/// Ordered middleware list, fixed at startup.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    slots: Vec<MiddlewareSlot>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the chain from configured names, looked up in `registry`.
    /// Names with no registration become unresolved slots.
    pub fn from_names(names: &[String], registry: &HashMap<String, Arc<dyn Middleware>>) -> Self {
        let slots = names
            .iter()
            .map(|name| match registry.get(name) {
                Some(handler) => MiddlewareSlot::Handler(Arc::clone(handler)),
                None => MiddlewareSlot::Unresolved(name.clone()),
            })
            .collect();
        Self { slots }
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.slots.push(MiddlewareSlot::Handler(middleware));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Run the chain over `env` and call `completion` the moment the last
    /// middleware advances, before any middleware resumes after its `next`.
    ///
    /// With `skip` or an empty chain only the completion runs and the
    /// outcome is `Completed { has_mid: false }`. Errors from a middleware
    /// are returned as is, even when raised after the completion ran.
    pub async fn call_middlewares(
        &self,
        skip: bool,
        env: &mut ChangeEnvelope,
        completion: Completion,
    ) -> Result<ChainOutcome, RippleError> {
        if skip || self.slots.is_empty() {
            completion(env, false);
            return Ok(ChainOutcome::Completed { has_mid: false });
        }

        let end = ChainEnd::new(completion);
        let next = Next {
            rest: &self.slots,
            end: &end,
        };
        next.run(env).await?;

        if end.reached.load(Ordering::Acquire) {
            Ok(ChainOutcome::Completed { has_mid: true })
        } else {
            debug!(module = %env.module, "middleware chain halted");
            Ok(ChainOutcome::Halted)
        }
    }
}
