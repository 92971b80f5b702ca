use promise_stage::{Error, PluginError, PluginRegistry, Promise};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// Lives in its own test binary: the global registry can be set only once
// per process.
#[test]
fn test_global_registration_then_conflict() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    PluginRegistry::global()
        .register_error_handler(move |err: &Error| {
            assert!(err.is_panic());
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let promise = Promise::<u32>::new();
    let derived = promise.transform(|_| -> u32 { panic!("global") });
    promise.complete(1);
    assert!(derived.is_failed());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(
        PluginRegistry::global().register_error_handler(|_: &Error| {}),
        Err(PluginError::AlreadyRegistered)
    );
}
