//! A `Future` view of a promise, for callers living in async code.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

use crate::executor::Dispatch;
use crate::promise::Promise;
use crate::Error;

/// Resolves to the outcome of the promise it was created from.
///
/// # Examples
///
/// ```
/// use promise_stage::Promise;
/// use futures::executor::block_on;
/// use std::thread;
///
/// let promise = Promise::<String>::new();
/// let waiter = promise.waiter();
/// let task = thread::spawn(move || block_on(waiter));
/// promise.complete("Hi".into());
/// assert_eq!(task.join().unwrap().unwrap(), "Hi");
/// ```
#[derive(Debug)]
pub struct Waiter<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

#[derive(Debug)]
struct Slot<T> {
    outcome: Option<Result<T, Error>>,
    waker: Option<Waker>,
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    pub fn waiter(&self) -> Waiter<T> {
        let slot = Arc::new(Mutex::new(Slot {
            outcome: None,
            waker: None,
        }));
        let filled = slot.clone();
        self.register(
            Box::new(move |outcome: Result<T, Error>| {
                let waker = {
                    let mut slot = filled.lock();
                    slot.outcome = Some(outcome);
                    slot.waker.take()
                };
                if let Some(waker) = waker {
                    waker.wake()
                }
            }),
            Dispatch::Inline,
        );
        Waiter { slot }
    }
}

impl<T> Future for Waiter<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.lock();
        match slot.outcome.take() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use std::thread;

    #[test]
    fn test_waiter_resolve() {
        let promise = Promise::<String>::new();
        let waiter = promise.waiter();
        let task1 = thread::spawn(move || block_on(waiter));
        let task2 = thread::spawn(move || promise.complete(String::from("🍓")));
        assert!(task2.join().expect("The task2 thread has panicked"));
        assert_eq!(task1.join().expect("The task1 thread has panicked").unwrap(), "🍓");
    }

    #[test]
    fn test_waiter_reject() {
        let promise = Promise::<String>::new();
        let waiter = promise.waiter();
        promise.complete_failed(Error::msg("reject!!"));
        let err = block_on(waiter).unwrap_err();
        assert_eq!(err.to_string(), "reject!!");
    }

    #[test]
    fn test_two_waiters() {
        let promise = Promise::<u32>::new();
        let (a, b) = (promise.waiter(), promise.waiter());
        let task1 = thread::spawn(move || block_on(a));
        let task2 = thread::spawn(move || block_on(b));
        promise.complete(7);
        assert_eq!(task1.join().expect("The task1 thread has panicked").unwrap(), 7);
        assert_eq!(task2.join().expect("The task2 thread has panicked").unwrap(), 7);
    }

    #[test]
    fn test_waiter_on_settled_promise() {
        let waiter = Promise::completed(3u8).transform(|x| x * 2).waiter();
        assert_eq!(block_on(waiter).unwrap(), 6);
    }
}
