//! Lifecycle transitions around `start`.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use firemesh::adapter::{Adapter, AdapterError, AdapterState};
use firemesh::config::AdapterConfig;

async fn loopback_listener() -> TcpListener {
    match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(err) => panic!("listener should bind: {err}"),
    }
}

#[tokio::test]
async fn cancellation_stops_the_adapter() {
    let adapter = match Adapter::new(AdapterConfig::new("http://firefly:5000")) {
        Ok(adapter) => adapter,
        Err(err) => panic!("adapter should build: {err}"),
    };
    let mut states = adapter.subscribe();
    assert_eq!(*states.borrow(), AdapterState::Initializing);

    let cancel = CancellationToken::new();
    let listener = loopback_listener().await;
    let handle = tokio::spawn(adapter.start_with_listener(listener, cancel.clone()));

    let running = states
        .wait_for(|s| *s == AdapterState::Running)
        .await
        .is_ok();
    assert!(running);

    cancel.cancel();
    let joined = handle.await;
    let result = match joined {
        Ok(result) => result,
        Err(err) => panic!("adapter task should not panic: {err}"),
    };
    assert!(result.is_ok());
    assert_eq!(*states.borrow(), AdapterState::Stopped);
    assert!(states.borrow().is_terminal());
}

#[tokio::test]
async fn bind_failure_marks_adapter_failed() {
    let occupied = match TcpListener::bind("0.0.0.0:0").await {
        Ok(listener) => listener,
        Err(err) => panic!("listener should bind: {err}"),
    };
    let port = match occupied.local_addr() {
        Ok(addr) => addr.port(),
        Err(err) => panic!("listener should expose local addr: {err}"),
    };

    let mut config = AdapterConfig::new("http://firefly:5000");
    config.port = port;
    let adapter = match Adapter::new(config) {
        Ok(adapter) => adapter,
        Err(err) => panic!("adapter should build: {err}"),
    };
    let states = adapter.subscribe();

    let result = adapter.start(CancellationToken::new()).await;
    match result {
        Err(AdapterError::Bind { .. }) => {
            assert_eq!(*states.borrow(), AdapterState::Failed);
            assert!(states.borrow().is_terminal());
        }
        Err(other) => panic!("expected bind error, got: {other}"),
        Ok(()) => panic!("binding an occupied port should fail"),
    }
}
