//! Executors run continuations handed off by the `*_async` combinators.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::warn;

/// A unit of work submitted to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted tasks at its own discretion.
///
/// Implementations must eventually run every task unless the process exits
/// first. Ordering across tasks is up to the implementation.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

impl<F> Executor for F
where
    F: Fn(Task) + Send + Sync,
{
    fn execute(&self, task: Task) {
        self(task)
    }
}

/// Runs each task immediately on the submitting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task()
    }
}

/// Spawns a detached thread per task. If no thread can be spawned the task
/// runs on the submitting thread instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn execute(&self, task: Task) {
        let (slot, claim) = handoff(task);
        if let Err(err) = thread::Builder::new().spawn(claim) {
            warn!(error = %err, "cannot spawn thread, running task inline");
            run_unclaimed(&slot);
        }
    }
}

type Slot = Arc<Mutex<Option<Task>>>;

/// Wraps `task` so that exactly one of the returned claim or a later
/// [`run_unclaimed`] on the slot gets to run it.
fn handoff(task: Task) -> (Slot, impl FnOnce() + Send + 'static) {
    let slot = Arc::new(Mutex::new(Some(task)));
    let claimed = slot.clone();
    let claim = move || {
        let task = claimed.lock().take();
        if let Some(task) = task {
            task()
        }
    };
    (slot, claim)
}

fn run_unclaimed(slot: &Slot) {
    let task = slot.lock().take();
    if let Some(task) = task {
        task()
    }
}

/// Where a continuation runs once its promise settles.
#[derive(Clone)]
pub enum Dispatch {
    /// On the thread that settled the promise, or the registering thread if
    /// the promise was already settled.
    Inline,
    /// Submitted to the given executor.
    Via(Arc<dyn Executor>),
}

impl Dispatch {
    pub fn via<E: Executor + 'static>(executor: E) -> Self {
        Dispatch::Via(Arc::new(executor))
    }

    /// Runs `task` here or on the executor.
    ///
    /// A panicking executor does not lose the task: if the executor never
    /// started it, it runs on the calling thread. The executor's panic
    /// payload is handed back for reporting.
    pub(crate) fn run(&self, task: Task) -> Result<(), Box<dyn Any + Send>> {
        match self {
            Dispatch::Inline => {
                task();
                Ok(())
            }
            Dispatch::Via(executor) => {
                let (slot, claim) = handoff(task);
                catch_unwind(AssertUnwindSafe(|| executor.execute(Box::new(claim)))).map_err(
                    |payload| {
                        run_unclaimed(&slot);
                        payload
                    },
                )
            }
        }
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::Inline => f.write_str("Inline"),
            Dispatch::Via(_) => f.write_str("Via(..)"),
        }
    }
}
