//! Single-assignment promises with a combinator algebra.
//!
//! A [`Promise`] starts pending and settles exactly once, either with a value
//! or with an [`Error`]. Continuations registered before the transition fire in
//! registration order on the settling thread; continuations registered after it
//! fire immediately on the registering thread. Combinators such as
//! [`Promise::transform`] or [`Promise::combine`] derive new promises from one
//! or two parents.
//!
//! # Examples
//!
//! ```
//! use promise_stage::Promise;
//!
//! let a = Promise::<i32>::new();
//! let b = Promise::<i32>::new();
//! let sum = a.combine(&b, |x, y| x + y);
//!
//! b.complete(3);
//! a.complete(4);
//! assert_eq!(sum.outcome().unwrap().unwrap(), 7);
//! ```
//!
//! Panics escaping user callbacks never reach the settling thread. They turn
//! into the failure of the derived promise and are reported once to the
//! [`ErrorHandler`] resolved by the [`PluginRegistry`].

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

pub mod combinators;
pub mod executor;
pub mod factory;
pub mod plugins;
pub mod promise;
mod scheduler;
pub mod waiter;

pub use executor::{Dispatch, Executor, InlineExecutor, Task, ThreadExecutor};
pub use factory::{Listenable, OnFailure, OnSuccess, StageFactory};
pub use plugins::{
    ErrorHandler, NoopHandler, PluginError, PluginRegistry, TracingHandler, ERROR_HANDLER_ENV,
};
pub use promise::Promise;
pub use waiter::Waiter;

/// Failure carried by a settled promise.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The computation behind the promise failed.
    #[error(transparent)]
    Failed(Arc<dyn StdError + Send + Sync>),
    /// A user callback panicked while settling a derived promise.
    #[error("callback panicked: {0}")]
    Panicked(Arc<Panic>),
}

/// The payload of a panic caught in a user callback.
pub struct Panic {
    message: Box<str>,
    payload: Mutex<Box<dyn Any + Send>>,
}

impl Panic {
    fn new(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&'static str>() {
            (*message).into()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.as_str().into()
        } else {
            "non-string panic payload".into()
        };
        Panic {
            message,
            payload: Mutex::new(payload),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the value passed to `panic!`/`panic_any` has type `P`.
    pub fn payload_is<P: Any>(&self) -> bool {
        self.payload.lock().is::<P>()
    }

    /// Gives `f` access to the original panic payload.
    pub fn with_payload<R>(&self, f: impl FnOnce(&(dyn Any + Send)) -> R) -> R {
        f(self.payload.lock().as_ref())
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Panic").field("message", &self.message).finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for Message {}

impl Error {
    pub fn new<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Error::Failed(Arc::new(err))
    }

    /// A failure described only by a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Failed(Arc::new(Message(message.into())))
    }

    /// Converts a caught panic payload. A panic raised with an [`Error`]
    /// as payload yields that error unchanged.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        match payload.downcast::<Error>() {
            Ok(err) => *err,
            Err(payload) => Error::Panicked(Arc::new(Panic::new(payload))),
        }
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Error::Panicked(_))
    }

    /// Whether both values denote the same failure instance.
    pub fn same_as(&self, other: &Error) -> bool {
        match (self, other) {
            (Error::Failed(a), Error::Failed(b)) => Arc::ptr_eq(a, b),
            (Error::Panicked(a), Error::Panicked(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
