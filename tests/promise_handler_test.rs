use deferred_out::Error;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(5);

#[test]
fn test_handler_before_resolve() {
    let deferred = deferred_out::create::<String>();
    let (tx, rx) = mpsc::channel();
    deferred.promise().on_resolve(move |outcome| tx.send(outcome).unwrap());

    deferred.resolve("test data 123".into()).unwrap();

    let value = rx.recv_timeout(PATIENCE).unwrap().unwrap();
    assert_eq!(*value, "test data 123");
}

#[test]
fn test_handler_after_resolve() {
    let deferred = deferred_out::create::<String>();
    deferred.resolve("test data 123".into()).unwrap();

    let (tx, rx) = mpsc::channel();
    deferred.promise().on_resolve(move |outcome| tx.send(outcome).unwrap());

    let value = rx.recv_timeout(PATIENCE).unwrap().unwrap();
    assert_eq!(*value, "test data 123");
}

#[test]
fn test_success_and_fail_filters() {
    let deferred = deferred_out::create::<String>();
    let promise = deferred.promise();
    let (ok_tx, ok_rx) = mpsc::channel();
    let (fail_tx, fail_rx) = mpsc::channel::<Error>();
    promise.on_success(move |value| ok_tx.send(value).unwrap());
    promise.on_fail(move |err| fail_tx.send(err).unwrap());

    deferred.resolve("X".into()).unwrap();

    assert_eq!(*ok_rx.recv_timeout(PATIENCE).unwrap(), "X");
    // The failure callback is dropped without running, closing its channel.
    assert_eq!(
        fail_rx.recv_timeout(PATIENCE).unwrap_err(),
        mpsc::RecvTimeoutError::Disconnected
    );
}

#[test]
fn test_fail_filter_on_reject() {
    let deferred = deferred_out::create_empty();
    let promise = deferred.promise();
    let (ok_tx, ok_rx) = mpsc::channel();
    let (fail_tx, fail_rx) = mpsc::channel();
    promise.on_success(move |_| ok_tx.send(()).unwrap());
    promise.on_fail(move |err| fail_tx.send(err).unwrap());

    deferred.reject("test error").unwrap();

    assert_eq!(fail_rx.recv_timeout(PATIENCE).unwrap().to_string(), "test error");
    assert_eq!(
        ok_rx.recv_timeout(PATIENCE).unwrap_err(),
        mpsc::RecvTimeoutError::Disconnected
    );
}

#[test]
fn test_handlers_racing_resolve_all_run() {
    let deferred = deferred_out::create::<u32>();
    let (tx, rx) = mpsc::channel();
    let subscribers: Vec<_> = (0..32)
        .map(|_| {
            let promise = deferred.promise();
            let tx = tx.clone();
            thread::spawn(move || promise.on_success(move |value| tx.send(*value).unwrap()))
        })
        .collect();
    deferred.resolve(5).unwrap();
    for subscriber in subscribers {
        subscriber.join().expect("A subscriber thread has panicked");
    }
    drop(tx);

    let seen: Vec<u32> = rx.iter().collect();
    assert_eq!(seen, vec![5; 32]);
}
