//! Process-wide registry for the hook that receives unhandled callback failures.
//!
//! The handler is resolved lazily, once, in this order:
//!
//! 1. a handler registered with [`PluginRegistry::register_error_handler`];
//! 2. a built-in handler named by the [`ERROR_HANDLER_ENV`] environment entry;
//! 3. [`NoopHandler`].
//!
//! Registering after resolution is rejected with
//! [`PluginError::AlreadyRegistered`].

use std::env;
use std::fmt;
use std::sync::{Arc, OnceLock};

use tracing::{debug, error};

use crate::Error;

/// Environment entry naming the default error handler.
pub const ERROR_HANDLER_ENV: &str = "PROMISE_STAGE_ERROR_HANDLER";

/// Receives failures that escaped user callbacks.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: &Error);
}

impl<F> ErrorHandler for F
where
    F: Fn(&Error) + Send + Sync,
{
    fn handle(&self, error: &Error) {
        self(error)
    }
}

/// Discards every failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ErrorHandler for NoopHandler {
    fn handle(&self, _error: &Error) {}
}

/// Logs every failure at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandler;

impl ErrorHandler for TracingHandler {
    fn handle(&self, err: &Error) {
        error!(error = %err, "unhandled failure in promise callback");
    }
}

type Constructor = fn() -> Arc<dyn ErrorHandler>;

/// Built-in handlers selectable through [`ERROR_HANDLER_ENV`].
const BUILTIN_HANDLERS: &[(&str, Constructor)] = &[("noop", noop), ("tracing", tracing_handler)];

fn noop() -> Arc<dyn ErrorHandler> {
    Arc::new(NoopHandler)
}

fn tracing_handler() -> Arc<dyn ErrorHandler> {
    Arc::new(TracingHandler)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PluginError {
    #[error("unknown error handler implementation: {name:?}")]
    UnknownHandler { name: String },
    #[error("an error handler was already registered or resolved")]
    AlreadyRegistered,
}

type Lookup = Box<dyn Fn() -> Option<String> + Send + Sync>;

pub struct PluginRegistry {
    error_handler: OnceLock<Arc<dyn ErrorHandler>>,
    configured: OnceLock<Option<String>>,
    lookup: Lookup,
}

static GLOBAL: OnceLock<PluginRegistry> = OnceLock::new();

impl PluginRegistry {
    /// A registry reading [`ERROR_HANDLER_ENV`] from the process environment.
    pub fn new() -> Self {
        Self::with_lookup(|| env::var(ERROR_HANDLER_ENV).ok())
    }

    /// A registry whose configuration entry comes from `lookup`.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        PluginRegistry {
            error_handler: OnceLock::new(),
            configured: OnceLock::new(),
            lookup: Box::new(lookup),
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static PluginRegistry {
        GLOBAL.get_or_init(PluginRegistry::new)
    }

    /// Installs `handler` ahead of any configured or default one.
    ///
    /// Fails if a handler was already registered or resolved.
    pub fn register_error_handler<H>(&self, handler: H) -> Result<(), PluginError>
    where
        H: ErrorHandler + 'static,
    {
        self.error_handler
            .set(Arc::new(handler))
            .map_err(|_| PluginError::AlreadyRegistered)
    }

    /// Resolves the handler on first use and returns the same one afterwards.
    ///
    /// The configuration entry is read once. An unknown name keeps failing
    /// with the same [`PluginError::UnknownHandler`] on every call, while
    /// [`register_error_handler`](Self::register_error_handler) stays open.
    pub fn error_handler(&self) -> Result<Arc<dyn ErrorHandler>, PluginError> {
        if let Some(handler) = self.error_handler.get() {
            return Ok(handler.clone());
        }
        let candidate = match self.configured.get_or_init(|| (self.lookup)()) {
            Some(name) => {
                let handler = handler_by_name(name)?;
                debug!(name = name.trim(), "resolved error handler from configuration");
                handler
            }
            None => {
                debug!("resolved default error handler");
                Arc::new(NoopHandler) as Arc<dyn ErrorHandler>
            }
        };
        // A racing resolver or registration may have won; keep theirs.
        Ok(self.error_handler.get_or_init(|| candidate).clone())
    }

    pub fn is_resolved(&self) -> bool {
        self.error_handler.get().is_some()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

fn handler_by_name(name: &str) -> Result<Arc<dyn ErrorHandler>, PluginError> {
    let name = name.trim();
    BUILTIN_HANDLERS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, construct)| construct())
        .ok_or_else(|| PluginError::UnknownHandler {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    #[test]
    fn test_default_is_noop() {
        let registry = PluginRegistry::with_lookup(|| None);
        assert!(!registry.is_resolved());
        registry.error_handler().unwrap().handle(&Error::msg("ignored"));
        assert!(registry.is_resolved());
    }

    #[test]
    fn test_registered_handler_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let registry = PluginRegistry::with_lookup(|| Some("tracing".into()));
        registry
            .register_error_handler(move |_: &Error| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        registry.error_handler().unwrap().handle(&Error::msg("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_after_resolution_conflicts() {
        let registry = PluginRegistry::with_lookup(|| None);
        registry.error_handler().unwrap();
        assert_eq!(
            registry.register_error_handler(NoopHandler),
            Err(PluginError::AlreadyRegistered)
        );
    }

    #[test]
    fn test_register_twice_conflicts() {
        let registry = PluginRegistry::with_lookup(|| None);
        registry.register_error_handler(NoopHandler).unwrap();
        assert_eq!(
            registry.register_error_handler(TracingHandler),
            Err(PluginError::AlreadyRegistered)
        );
    }

    #[test]
    fn test_unknown_name_is_configuration_error() {
        let registry = PluginRegistry::with_lookup(|| Some("com.example.Missing".into()));
        assert_eq!(
            registry.error_handler().err(),
            Some(PluginError::UnknownHandler {
                name: "com.example.Missing".into()
            })
        );
        assert!(!registry.is_resolved());
    }

    #[test]
    fn test_configuration_read_once() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let registry = PluginRegistry::with_lookup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some(" tracing ".into())
        });
        registry.error_handler().unwrap();
        registry.error_handler().unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_name_is_read_once() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let registry = PluginRegistry::with_lookup(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Some("missing".into())
        });
        assert!(registry.error_handler().is_err());
        assert!(registry.error_handler().is_err());
        assert_eq!(reads.load(Ordering::SeqCst), 1);
        registry.register_error_handler(NoopHandler).unwrap();
        assert!(registry.error_handler().is_ok());
    }

    #[test]
    fn test_concurrent_resolution_installs_one_handler() {
        let registry = Arc::new(PluginRegistry::with_lookup(|| Some("noop".into())));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.error_handler().unwrap())
            })
            .collect();
        let resolved: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for handler in &resolved[1..] {
            assert!(Arc::ptr_eq(handler, &resolved[0]));
        }
    }
}
