//! Operators deriving a new [`Promise`] from one or two parents.
//!
//! Every combinator comes in up to three flavours:
//!
//! * `name` runs the user function inline, on the thread that settled the
//!   parent (or on the caller if the parent was already settled);
//! * `name_async` hands it to the default executor of the parent;
//! * `name_async_with` hands it to the given executor.
//!
//! A panic in the user function fails the derived promise with
//! [`Error::Panicked`] and is reported once to the error handler.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::executor::{Dispatch, Executor};
use crate::promise::Promise;
use crate::scheduler::Reporter;
use crate::Error;

/// Bookkeeping for the AND combinators.
struct Both<T, U, F> {
    left: Option<T>,
    right: Option<U>,
    action: Option<F>,
}

impl<T, U, F> Both<T, U, F> {
    /// Takes everything needed to fire once both sides have arrived.
    fn ready(&mut self) -> Option<(T, U, F)> {
        if self.left.is_none() || self.right.is_none() {
            return None;
        }
        match (self.left.take(), self.right.take(), self.action.take()) {
            (Some(left), Some(right), Some(action)) => Some((left, right, action)),
            _ => None,
        }
    }
}

/// Bookkeeping for the OR-over-success combinators.
struct Either<F> {
    action: Option<F>,
    failures: u8,
    first_error: Option<Error>,
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    fn async_dispatch(&self) -> Dispatch {
        Dispatch::Via(self.context().executor.clone())
    }

    /// Derives a promise whose settlement is driven by `react` once this
    /// promise settles.
    fn then_on<U, R>(&self, dispatch: Dispatch, react: R) -> Promise<U>
    where
        U: Clone + Send + 'static,
        R: FnOnce(Result<T, Error>, &Promise<U>, &Reporter) + Send + 'static,
    {
        let derived = self.derive::<U>();
        let target = derived.clone();
        let reporter = self.context().reporter.clone();
        self.register(
            Box::new(move |outcome: Result<T, Error>| react(outcome, &target, &reporter)),
            dispatch,
        );
        derived
    }

    fn transform_on<U, F>(&self, dispatch: Dispatch, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_on(dispatch, move |outcome, target, reporter| {
            match outcome {
                Ok(value) => target.settle(reporter.guard(move || f(value))),
                Err(err) => target.complete_failed(err),
            };
        })
    }

    /// Applies `f` to the value; failures pass through unchanged.
    pub fn transform<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.transform_on(Dispatch::Inline, f)
    }

    pub fn transform_async<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.transform_on(self.async_dispatch(), f)
    }

    pub fn transform_async_with<U, F>(&self, f: F, executor: Arc<dyn Executor>) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.transform_on(Dispatch::Via(executor), f)
    }

    /// Runs `f` on the value; the derived promise succeeds with `()`.
    pub fn consume<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.transform_on(Dispatch::Inline, f)
    }

    pub fn consume_async<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.transform_on(self.async_dispatch(), f)
    }

    pub fn consume_async_with<F>(&self, f: F, executor: Arc<dyn Executor>) -> Promise<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.transform_on(Dispatch::Via(executor), f)
    }

    /// Runs `f` after success, ignoring the value.
    pub fn effect<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.transform_on(Dispatch::Inline, move |_| f())
    }

    pub fn effect_async<F>(&self, f: F) -> Promise<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.transform_on(self.async_dispatch(), move |_| f())
    }

    pub fn effect_async_with<F>(&self, f: F, executor: Arc<dyn Executor>) -> Promise<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.transform_on(Dispatch::Via(executor), move |_| f())
    }

    fn flat_transform_on<U, F>(&self, dispatch: Dispatch, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.then_on(dispatch, move |outcome, target: &Promise<U>, reporter| {
            let inner = match outcome.and_then(|value| reporter.guard(move || f(value))) {
                Ok(inner) => inner,
                Err(err) => {
                    target.complete_failed(err);
                    return;
                }
            };
            let target = target.clone();
            inner.register(
                Box::new(move |outcome: Result<U, Error>| {
                    target.settle(outcome);
                }),
                Dispatch::Inline,
            );
        })
    }

    /// Applies `f` and adopts the eventual outcome of the promise it returns.
    pub fn flat_transform<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.flat_transform_on(Dispatch::Inline, f)
    }

    pub fn flat_transform_async<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.flat_transform_on(self.async_dispatch(), f)
    }

    pub fn flat_transform_async_with<U, F>(&self, f: F, executor: Arc<dyn Executor>) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        self.flat_transform_on(Dispatch::Via(executor), f)
    }

    fn both_on<U, V, F>(&self, other: &Promise<U>, dispatch: Dispatch, f: F) -> Promise<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        let derived = self.derive::<V>();
        let shared = Arc::new(Mutex::new(Both {
            left: None,
            right: None,
            action: Some(f),
        }));
        let reporter = self.context().reporter.clone();

        let (target, state, rep) = (derived.clone(), shared.clone(), reporter.clone());
        self.register(
            Box::new(move |outcome: Result<T, Error>| match outcome {
                Ok(value) => {
                    let ready = {
                        let mut both = state.lock();
                        both.left = Some(value);
                        both.ready()
                    };
                    if let Some((left, right, action)) = ready {
                        target.settle(rep.guard(move || action(left, right)));
                    }
                }
                Err(err) => {
                    state.lock().action.take();
                    target.complete_failed(err);
                }
            }),
            dispatch.clone(),
        );

        let target = derived.clone();
        other.register(
            Box::new(move |outcome: Result<U, Error>| match outcome {
                Ok(value) => {
                    let ready = {
                        let mut both = shared.lock();
                        both.right = Some(value);
                        both.ready()
                    };
                    if let Some((left, right, action)) = ready {
                        target.settle(reporter.guard(move || action(left, right)));
                    }
                }
                Err(err) => {
                    shared.lock().action.take();
                    target.complete_failed(err);
                }
            }),
            dispatch,
        );
        derived
    }

    /// Applies `f` once both promises succeed. Fails with the first failure
    /// of either parent.
    pub fn combine<U, V, F>(&self, other: &Promise<U>, f: F) -> Promise<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.both_on(other, Dispatch::Inline, f)
    }

    pub fn combine_async<U, V, F>(&self, other: &Promise<U>, f: F) -> Promise<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.both_on(other, self.async_dispatch(), f)
    }

    pub fn combine_async_with<U, V, F>(
        &self,
        other: &Promise<U>,
        f: F,
        executor: Arc<dyn Executor>,
    ) -> Promise<V>
    where
        U: Clone + Send + 'static,
        V: Clone + Send + 'static,
        F: FnOnce(T, U) -> V + Send + 'static,
    {
        self.both_on(other, Dispatch::Via(executor), f)
    }

    pub fn accept_both<U, F>(&self, other: &Promise<U>, f: F) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.both_on(other, Dispatch::Inline, f)
    }

    pub fn accept_both_async<U, F>(&self, other: &Promise<U>, f: F) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.both_on(other, self.async_dispatch(), f)
    }

    pub fn accept_both_async_with<U, F>(
        &self,
        other: &Promise<U>,
        f: F,
        executor: Arc<dyn Executor>,
    ) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T, U) + Send + 'static,
    {
        self.both_on(other, Dispatch::Via(executor), f)
    }

    pub fn run_after_both<U, F>(&self, other: &Promise<U>, f: F) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.both_on(other, Dispatch::Inline, move |_, _| f())
    }

    pub fn run_after_both_async<U, F>(&self, other: &Promise<U>, f: F) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.both_on(other, self.async_dispatch(), move |_, _| f())
    }

    pub fn run_after_both_async_with<U, F>(
        &self,
        other: &Promise<U>,
        f: F,
        executor: Arc<dyn Executor>,
    ) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.both_on(other, Dispatch::Via(executor), move |_, _| f())
    }

    fn either_on<U, F>(&self, other: &Promise<T>, dispatch: Dispatch, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let derived = self.derive::<U>();
        let shared = Arc::new(Mutex::new(Either {
            action: Some(f),
            failures: 0,
            first_error: None,
        }));
        let reporter = self.context().reporter.clone();
        for parent in [self, other] {
            let (target, state, reporter) = (derived.clone(), shared.clone(), reporter.clone());
            parent.register(
                Box::new(move |outcome: Result<T, Error>| match outcome {
                    Ok(value) => {
                        let action = state.lock().action.take();
                        if let Some(action) = action {
                            target.settle(reporter.guard(move || action(value)));
                        }
                    }
                    Err(err) => {
                        let exhausted = {
                            let mut either = state.lock();
                            if either.action.is_none() {
                                return;
                            }
                            either.failures += 1;
                            let first = either.first_error.get_or_insert(err).clone();
                            if either.failures == 2 {
                                either.action.take();
                                Some(first)
                            } else {
                                None
                            }
                        };
                        if let Some(err) = exhausted {
                            target.complete_failed(err);
                        }
                    }
                }),
                dispatch.clone(),
            );
        }
        derived
    }

    /// Applies `f` to the value of whichever promise succeeds first. Fails
    /// only once both parents have failed, with the first failure.
    pub fn either_apply<U, F>(&self, other: &Promise<T>, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.either_on(other, Dispatch::Inline, f)
    }

    pub fn either_apply_async<U, F>(&self, other: &Promise<T>, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.either_on(other, self.async_dispatch(), f)
    }

    pub fn either_apply_async_with<U, F>(
        &self,
        other: &Promise<T>,
        f: F,
        executor: Arc<dyn Executor>,
    ) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.either_on(other, Dispatch::Via(executor), f)
    }

    pub fn either_accept<F>(&self, other: &Promise<T>, f: F) -> Promise<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.either_on(other, Dispatch::Inline, f)
    }

    pub fn either_accept_async<F>(&self, other: &Promise<T>, f: F) -> Promise<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.either_on(other, self.async_dispatch(), f)
    }

    pub fn either_accept_async_with<F>(
        &self,
        other: &Promise<T>,
        f: F,
        executor: Arc<dyn Executor>,
    ) -> Promise<()>
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.either_on(other, Dispatch::Via(executor), f)
    }

    fn run_after_either_on<U, F>(&self, other: &Promise<U>, dispatch: Dispatch, f: F) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        let derived = self.derive::<()>();
        let first = Arc::new(Mutex::new(Some(f)));
        let reporter = self.context().reporter.clone();

        let (target, state, rep) = (derived.clone(), first.clone(), reporter.clone());
        self.register(
            Box::new(move |outcome: Result<T, Error>| {
                let action = state.lock().take();
                if let Some(action) = action {
                    match outcome {
                        Ok(_) => target.settle(rep.guard(action)),
                        Err(err) => target.complete_failed(err),
                    };
                }
            }),
            dispatch.clone(),
        );

        let target = derived.clone();
        other.register(
            Box::new(move |outcome: Result<U, Error>| {
                let action = first.lock().take();
                if let Some(action) = action {
                    match outcome {
                        Ok(_) => target.settle(reporter.guard(action)),
                        Err(err) => target.complete_failed(err),
                    };
                }
            }),
            dispatch,
        );
        derived
    }

    /// Settles with whichever promise settles first: runs `f` if that was a
    /// success, fails with its error otherwise.
    pub fn run_after_either<U, F>(&self, other: &Promise<U>, f: F) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.run_after_either_on(other, Dispatch::Inline, f)
    }

    pub fn run_after_either_async<U, F>(&self, other: &Promise<U>, f: F) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.run_after_either_on(other, self.async_dispatch(), f)
    }

    pub fn run_after_either_async_with<U, F>(
        &self,
        other: &Promise<U>,
        f: F,
        executor: Arc<dyn Executor>,
    ) -> Promise<()>
    where
        U: Clone + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        self.run_after_either_on(other, Dispatch::Via(executor), f)
    }

    /// Turns a failure into a value; success passes through unchanged.
    pub fn recover<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(Error) -> T + Send + 'static,
    {
        self.then_on(Dispatch::Inline, move |outcome, target, reporter| {
            match outcome {
                Ok(value) => target.complete(value),
                Err(err) => target.settle(reporter.guard(move || f(err))),
            };
        })
    }

    fn observe_on<F>(&self, dispatch: Dispatch, f: F) -> Promise<T>
    where
        F: FnOnce(&Result<T, Error>) + Send + 'static,
    {
        self.then_on(dispatch, move |outcome, target, reporter| {
            let observed = reporter.guard(|| f(&outcome));
            match (outcome, observed) {
                (Ok(_), Err(panic)) => target.complete_failed(panic),
                (outcome, _) => target.settle(outcome),
            };
        })
    }

    /// Calls `f` with the outcome and passes the outcome on. If `f` panics
    /// on a success, the derived promise fails with the panic instead.
    pub fn observe<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(&Result<T, Error>) + Send + 'static,
    {
        self.observe_on(Dispatch::Inline, f)
    }

    pub fn observe_async<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(&Result<T, Error>) + Send + 'static,
    {
        self.observe_on(self.async_dispatch(), f)
    }

    pub fn observe_async_with<F>(&self, f: F, executor: Arc<dyn Executor>) -> Promise<T>
    where
        F: FnOnce(&Result<T, Error>) + Send + 'static,
    {
        self.observe_on(Dispatch::Via(executor), f)
    }

    fn fold_on<U, F>(&self, dispatch: Dispatch, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, Error>) -> U + Send + 'static,
    {
        self.then_on(dispatch, move |outcome, target, reporter| {
            target.settle(reporter.guard(move || f(outcome)));
        })
    }

    /// Maps either outcome to a value; the derived promise succeeds unless
    /// `f` panics.
    pub fn fold<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, Error>) -> U + Send + 'static,
    {
        self.fold_on(Dispatch::Inline, f)
    }

    pub fn fold_async<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, Error>) -> U + Send + 'static,
    {
        self.fold_on(self.async_dispatch(), f)
    }

    pub fn fold_async_with<U, F>(&self, f: F, executor: Arc<dyn Executor>) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, Error>) -> U + Send + 'static,
    {
        self.fold_on(Dispatch::Via(executor), f)
    }
}
