use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::executor::{Dispatch, Executor, ThreadExecutor};
use crate::plugins::ErrorHandler;
use crate::scheduler::{Callback, Continuation, Reporter};
use crate::Error;

/// A single-assignment container for a value or an [`Error`].
///
/// Cloning a `Promise` clones the handle; every clone observes and settles
/// the same instance.
///
/// Inline continuations run on the settling thread, nested inside
/// [`complete`](Promise::complete). Settling the head of a long chain of
/// inline combinators therefore recurses once per link; chains many
/// thousands deep should use the `_async` variants for some links, which
/// restart the stack on the executor.
///
/// # Examples
///
/// ```
/// use promise_stage::Promise;
///
/// let promise = Promise::<u32>::new();
/// let next = promise.transform(|x| x + 1);
/// assert!(promise.complete(5));
/// assert!(!promise.complete(6));
/// assert_eq!(next.outcome().unwrap().unwrap(), 6);
/// ```
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    context: Arc<Context>,
}

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Succeeded(T),
    Failed(Error),
}

/// Shared by a promise and everything derived from it.
pub(crate) struct Context {
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) reporter: Reporter,
}

impl Context {
    pub(crate) fn new(executor: Arc<dyn Executor>, handler: Arc<dyn ErrorHandler>) -> Self {
        Context {
            executor,
            reporter: Reporter::Fixed(handler),
        }
    }

    fn global() -> Self {
        Context {
            executor: Arc::new(ThreadExecutor),
            reporter: Reporter::Global,
        }
    }
}

impl<T> State<T>
where
    T: Clone,
{
    fn outcome(&self) -> Option<Result<T, Error>> {
        match self {
            State::Pending(_) => None,
            State::Succeeded(value) => Some(Ok(value.clone())),
            State::Failed(err) => Some(Err(err.clone())),
        }
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    /// A pending promise using [`ThreadExecutor`] for `*_async` combinators
    /// and the process-wide [`PluginRegistry`](crate::PluginRegistry) for
    /// failure reporting.
    pub fn new() -> Self {
        Self::with_context(Arc::new(Context::global()))
    }

    pub fn completed(value: T) -> Self {
        let promise = Self::new();
        promise.complete(value);
        promise
    }

    pub fn failed(err: Error) -> Self {
        let promise = Self::new();
        promise.complete_failed(err);
        promise
    }

    pub(crate) fn with_context(context: Arc<Context>) -> Self {
        Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                context,
            }),
        }
    }

    /// A pending promise sharing this one's executor and error reporting.
    pub(crate) fn derive<U>(&self) -> Promise<U>
    where
        U: Clone + Send + 'static,
    {
        Promise::with_context(self.inner.context.clone())
    }

    pub(crate) fn context(&self) -> &Context {
        &self.inner.context
    }

    /// Settles the promise with `value`.
    ///
    /// Returns `false` without effect if the promise was already settled.
    pub fn complete(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles the promise with `err`.
    ///
    /// Returns `false` without effect if the promise was already settled.
    pub fn complete_failed(&self, err: Error) -> bool {
        self.settle(Err(err))
    }

    pub(crate) fn settle(&self, outcome: Result<T, Error>) -> bool {
        let continuations = {
            let mut state = self.inner.state.lock();
            if !matches!(*state, State::Pending(_)) {
                return false;
            }
            let terminal = match &outcome {
                Ok(value) => State::Succeeded(value.clone()),
                Err(err) => State::Failed(err.clone()),
            };
            match mem::replace(&mut *state, terminal) {
                State::Pending(continuations) => continuations,
                _ => Vec::new(),
            }
        };
        trace!(
            succeeded = outcome.is_ok(),
            continuations = continuations.len(),
            "promise settled"
        );
        let reporter = &self.inner.context.reporter;
        for continuation in continuations {
            continuation.fire(outcome.clone(), reporter);
        }
        true
    }

    /// Registers a continuation, firing it right away if already settled.
    ///
    /// A panic in either callback is reported to the error handler and
    /// never propagates to the thread that settled the promise.
    pub fn add_continuation<S, F>(&self, on_success: S, on_failure: F, dispatch: Dispatch)
    where
        S: FnOnce(T) + Send + 'static,
        F: FnOnce(Error) + Send + 'static,
    {
        let reporter = self.inner.context.reporter.clone();
        self.register(
            Box::new(move |outcome: Result<T, Error>| {
                let _ = reporter.guard(move || match outcome {
                    Ok(value) => on_success(value),
                    Err(err) => on_failure(err),
                });
            }),
            dispatch,
        );
    }

    pub(crate) fn register(&self, callback: Callback<T>, dispatch: Dispatch) {
        let continuation = Continuation::new(callback, dispatch);
        let outcome = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(continuations) => {
                    continuations.push(continuation);
                    return;
                }
                settled => settled.outcome(),
            }
        };
        if let Some(outcome) = outcome {
            continuation.fire(outcome, &self.inner.context.reporter);
        }
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.inner.state.lock(), State::Pending(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Failed(_))
    }

    /// The settled outcome, or `None` while pending. Never blocks on the
    /// computation.
    pub fn outcome(&self) -> Option<Result<T, Error>> {
        self.inner.state.lock().outcome()
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.inner.state.lock() {
            State::Pending(continuations) => format!("pending({})", continuations.len()),
            State::Succeeded(_) => "succeeded".to_string(),
            State::Failed(err) => format!("failed({err})"),
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::thread;

    #[test]
    fn test_complete_once() {
        let promise = Promise::<String>::new();
        assert!(promise.complete("🍓".into()));
        assert!(!promise.complete("🍌".into()));
        assert!(!promise.complete_failed(Error::msg("late")));
        assert_eq!(promise.outcome().unwrap().unwrap(), "🍓");
    }

    #[test]
    fn test_complete_failed_once() {
        let promise = Promise::<String>::new();
        let err = Error::msg("reject!!");
        assert!(promise.complete_failed(err.clone()));
        assert!(!promise.complete("🍓".into()));
        assert!(promise.is_failed());
        assert!(promise.outcome().unwrap().unwrap_err().same_as(&err));
    }

    #[test]
    fn test_pending_has_no_outcome() {
        let promise = Promise::<u8>::default();
        assert!(!promise.is_done());
        assert!(promise.outcome().is_none());
    }

    #[test]
    fn test_continuations_fire_in_registration_order() {
        let promise = Promise::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            promise.add_continuation(
                move |value| order.lock().push((i, value)),
                |_| unreachable!(),
                Dispatch::Inline,
            );
        }
        promise.complete(9);
        assert_eq!(
            *order.lock(),
            vec![(0, 9), (1, 9), (2, 9), (3, 9), (4, 9)]
        );
    }

    #[test]
    fn test_late_continuation_sees_same_outcome() {
        let promise = Promise::<u32>::new();
        let (tx, rx) = channel();
        let early = tx.clone();
        promise.add_continuation(move |v| early.send(v).unwrap(), |_| {}, Dispatch::Inline);
        promise.complete(3);
        promise.add_continuation(move |v| tx.send(v).unwrap(), |_| {}, Dispatch::Inline);
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_late_failure_continuation() {
        let promise = Promise::<u32>::failed(Error::msg("gone"));
        let (tx, rx) = channel();
        promise.add_continuation(|_| unreachable!(), move |e| tx.send(e).unwrap(), Dispatch::Inline);
        assert_eq!(rx.try_recv().unwrap().to_string(), "gone");
    }

    #[test]
    fn test_racing_registration_fires_exactly_once() {
        for _ in 0..50 {
            let promise = Promise::<usize>::new();
            let fired = Arc::new(AtomicUsize::new(0));
            let registrars: Vec<_> = (0..4)
                .map(|_| {
                    let promise = promise.clone();
                    let fired = fired.clone();
                    thread::spawn(move || {
                        for _ in 0..25 {
                            let fired = fired.clone();
                            promise.add_continuation(
                                move |_| {
                                    fired.fetch_add(1, Ordering::SeqCst);
                                },
                                |_| {},
                                Dispatch::Inline,
                            );
                        }
                    })
                })
                .collect();
            let settler = {
                let promise = promise.clone();
                thread::spawn(move || promise.complete(1))
            };
            for registrar in registrars {
                registrar.join().expect("The registrar thread has panicked");
            }
            assert!(settler.join().expect("The settler thread has panicked"));
            assert_eq!(fired.load(Ordering::SeqCst), 100);
        }
    }

    #[test]
    fn test_racing_completions_have_one_winner() {
        let promise = Promise::<usize>::new();
        let winners: usize = (0..8)
            .map(|i| {
                let promise = promise.clone();
                thread::spawn(move || promise.complete(i))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_continuation_panic_does_not_reach_settler() {
        let promise = Promise::<u32>::new();
        promise.add_continuation(|_| panic!("in continuation"), |_| {}, Dispatch::Inline);
        assert!(promise.complete(1));
    }

    #[test]
    fn test_panicking_executor_does_not_break_the_drain() {
        let reports = Arc::new(AtomicUsize::new(0));
        let counter = reports.clone();
        let handler = Arc::new(move |_: &Error| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let promise =
            Promise::<u32>::with_context(Arc::new(Context::new(Arc::new(ThreadExecutor), handler)));
        let fired = Arc::new(AtomicUsize::new(0));
        let (first, second) = (fired.clone(), fired.clone());
        promise.add_continuation(
            move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
            Dispatch::via(|_task: crate::Task| panic!("rejected")),
        );
        promise.add_continuation(
            move |_| {
                second.fetch_add(1, Ordering::SeqCst);
            },
            |_| {},
            Dispatch::Inline,
        );
        let settled = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| promise.complete(1)));
        assert!(settled.unwrap());
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deep_inline_chain_settles() {
        let head = Promise::<u64>::new();
        let mut tail = head.clone();
        for _ in 0..256 {
            tail = tail.transform(|x| x + 1);
        }
        head.complete(0);
        assert_eq!(tail.outcome().unwrap().unwrap(), 256);
    }
}
