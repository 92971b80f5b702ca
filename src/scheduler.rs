use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, warn};

use crate::executor::Dispatch;
use crate::plugins::{ErrorHandler, PluginRegistry};
use crate::Error;

/// Callback fired once with the outcome of the promise it is registered on.
pub(crate) type Callback<T> = Box<dyn FnOnce(Result<T, Error>) + Send + 'static>;

pub(crate) struct Continuation<T> {
    callback: Callback<T>,
    dispatch: Dispatch,
}

impl<T: Send + 'static> Continuation<T> {
    pub(crate) fn new(callback: Callback<T>, dispatch: Dispatch) -> Self {
        Continuation { callback, dispatch }
    }

    /// Consumes the continuation, running it inline or on its executor.
    ///
    /// Never unwinds into the caller: a panicking executor is reported and
    /// the continuation still runs exactly once.
    pub(crate) fn fire(self, outcome: Result<T, Error>, reporter: &Reporter) {
        let Continuation { callback, dispatch } = self;
        let fired = catch_unwind(AssertUnwindSafe(|| {
            dispatch.run(Box::new(move || callback(outcome)))
        }));
        if let Err(payload) = fired.and_then(|submitted| submitted) {
            let err = Error::from_panic(payload);
            warn!(error = %err, "continuation dispatch panicked");
            reporter.report(&err);
        }
    }
}

/// Where unhandled callback failures of a promise are reported.
#[derive(Clone)]
pub(crate) enum Reporter {
    /// Resolve through [`PluginRegistry::global`] at report time.
    Global,
    Fixed(Arc<dyn ErrorHandler>),
}

impl Reporter {
    pub(crate) fn report(&self, err: &Error) {
        let handler = match self {
            Reporter::Fixed(handler) => handler.clone(),
            Reporter::Global => match PluginRegistry::global().error_handler() {
                Ok(handler) => handler,
                Err(resolve_err) => {
                    error!(error = %resolve_err, failure = %err, "cannot resolve error handler");
                    return;
                }
            },
        };
        if catch_unwind(AssertUnwindSafe(|| handler.handle(err))).is_err() {
            error!(failure = %err, "error handler panicked");
        }
    }

    /// Runs a user callback. A panic is reported once and returned as the
    /// failure the caller should settle its derived promise with.
    pub(crate) fn guard<R>(&self, f: impl FnOnce() -> R) -> Result<R, Error> {
        catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            let err = Error::from_panic(payload);
            warn!(error = %err, "promise callback panicked");
            self.report(&err);
            err
        })
    }
}
