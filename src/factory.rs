//! Bridge from "notify once" sources into [`Promise`]s.

use std::fmt;
use std::sync::Arc;

use crate::executor::Executor;
use crate::plugins::{ErrorHandler, PluginError, PluginRegistry};
use crate::promise::{Context, Promise};
use crate::Error;

pub type OnSuccess<T> = Box<dyn FnOnce(T) + Send + 'static>;
pub type OnFailure = Box<dyn FnOnce(Error) + Send + 'static>;

/// A source that reports success or failure exactly once.
///
/// The source must call exactly one of the two callbacks, exactly once, at
/// any time including synchronously inside `register`.
pub trait Listenable<T> {
    fn register(self, on_success: OnSuccess<T>, on_failure: OnFailure);
}

impl<T, F> Listenable<T> for F
where
    F: FnOnce(OnSuccess<T>, OnFailure),
{
    fn register(self, on_success: OnSuccess<T>, on_failure: OnFailure) {
        self(on_success, on_failure)
    }
}

/// Creates promises sharing a default executor and an error handler.
///
/// # Examples
///
/// ```
/// use promise_stage::{InlineExecutor, NoopHandler, OnFailure, OnSuccess, StageFactory};
/// use std::sync::Arc;
///
/// let factory = StageFactory::with_handler(Arc::new(InlineExecutor), Arc::new(NoopHandler));
/// let promise = factory.from_listenable(|on_success: OnSuccess<u32>, _: OnFailure| on_success(7));
/// assert_eq!(promise.outcome().unwrap().unwrap(), 7);
/// ```
#[derive(Clone)]
pub struct StageFactory {
    context: Arc<Context>,
}

impl StageFactory {
    /// Uses the handler resolved by [`PluginRegistry::global`].
    pub fn new(default_executor: Arc<dyn Executor>) -> Result<Self, PluginError> {
        Self::from_registry(default_executor, PluginRegistry::global())
    }

    pub fn from_registry(
        default_executor: Arc<dyn Executor>,
        registry: &PluginRegistry,
    ) -> Result<Self, PluginError> {
        let handler = registry.error_handler()?;
        Ok(Self::with_handler(default_executor, handler))
    }

    pub fn with_handler(default_executor: Arc<dyn Executor>, handler: Arc<dyn ErrorHandler>) -> Self {
        StageFactory {
            context: Arc::new(Context::new(default_executor, handler)),
        }
    }

    pub fn pending<T>(&self) -> Promise<T>
    where
        T: Clone + Send + 'static,
    {
        Promise::with_context(self.context.clone())
    }

    /// A pending promise settled by whichever callback `listenable` invokes.
    pub fn from_listenable<T, L>(&self, listenable: L) -> Promise<T>
    where
        T: Clone + Send + 'static,
        L: Listenable<T>,
    {
        let promise = self.pending::<T>();
        let (succeed, fail) = (promise.clone(), promise.clone());
        listenable.register(
            Box::new(move |value: T| {
                succeed.complete(value);
            }),
            Box::new(move |err: Error| {
                fail.complete_failed(err);
            }),
        );
        promise
    }
}

impl fmt::Debug for StageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageFactory").finish_non_exhaustive()
    }
}
