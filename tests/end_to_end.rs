//! Full request/response exchanges through a running command server.

use commander_ipc::framing::{receive_message, send_message};
use commander_ipc::{
    invoke, invoke_async, CancellationToken, CommandServer, DispatchError, IpcConfig, IpcError,
    Listener, Registry, Request, Response, TransportKind,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

static NEXT: AtomicU64 = AtomicU64::new(0);

fn config_for(kind: TransportKind, dir: &TempDir) -> IpcConfig {
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    let channel = match kind {
        TransportKind::SharedMemory => format!("e2e_{}_{}", std::process::id(), id),
        TransportKind::LocalSocket => dir
            .path()
            .join(format!("e2e_{id}.sock"))
            .to_string_lossy()
            .into_owned(),
    };
    IpcConfig::new(channel).with_transport(kind)
}

const KINDS: [TransportKind; 2] = [TransportKind::SharedMemory, TransportKind::LocalSocket];

/// Registry that records every Foo.Bar call it sees
fn registry(seen: Arc<Mutex<Vec<Vec<String>>>>) -> Registry {
    let mut registry = Registry::new();
    registry
        .register("Foo", "Bar", move |args| {
            seen.lock().unwrap().push(args.to_vec());
            Ok(Some("42".to_string()))
        })
        .register("Foo", "Boom", |_| Err(DispatchError::Failed("boom".into())))
        .register("Foo", "Quiet", |_| Ok(None));
    registry
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ok_scenario_both_transports() {
    let dir = tempfile::tempdir().unwrap();
    for kind in KINDS {
        let config = config_for(kind, &dir);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let server = CommandServer::start(&config, registry(Arc::clone(&seen))).unwrap();
        assert_eq!(server.kind(), kind);

        let token = CancellationToken::new();
        let request = Request::new("Foo", "Bar", ["x", "y"]);
        let response = invoke_async(&config, &request, &token).await.unwrap();

        assert_eq!(response, Response::Ok(Some("42".into())));
        assert_eq!(response.encode(), "OK\u{0}42");
        assert_eq!(*seen.lock().unwrap(), vec![vec!["x".to_string(), "y".to_string()]]);

        server.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_scenario_both_transports() {
    let dir = tempfile::tempdir().unwrap();
    for kind in KINDS {
        let config = config_for(kind, &dir);
        let server = CommandServer::start(&config, registry(Default::default())).unwrap();

        let token = CancellationToken::new();
        let response = invoke_async(&config, &Request::new("Foo", "Boom", ["a"]), &token)
            .await
            .unwrap();
        assert_eq!(response, Response::Fail(Some("boom".into())));

        // The failure did not take the server down
        let response = invoke_async(&config, &Request::new("Foo", "Quiet", Vec::<String>::new()), &token)
            .await
            .unwrap();
        assert_eq!(response, Response::Ok(None));

        server.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_client_sequential_calls() {
    let dir = tempfile::tempdir().unwrap();
    for kind in KINDS {
        let config = config_for(kind, &dir);
        let server = CommandServer::start(&config, registry(Default::default())).unwrap();

        let client_config = config.clone();
        let responses = tokio::task::spawn_blocking(move || {
            (0..5)
                .map(|i| invoke(&client_config, &Request::new("Foo", "Bar", [i.to_string()])))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();

        for response in responses {
            assert_eq!(response.unwrap(), Response::Ok(Some("42".into())));
        }
        server.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_survives_silent_client() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(TransportKind::LocalSocket, &dir);
    let server = CommandServer::start(&config, registry(Default::default())).unwrap();

    // Connect and hang up without sending anything
    let path = config.socket_path();
    tokio::task::spawn_blocking(move || drop(commander_ipc::socket::connect(path).unwrap()))
        .await
        .unwrap();

    let token = CancellationToken::new();
    let response = invoke_async(&config, &Request::new("Foo", "Quiet", Vec::<String>::new()), &token)
        .await
        .unwrap();
    assert_eq!(response, Response::Ok(None));
    assert!(server.is_running());
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_releases_channel_for_reuse() {
    let dir = tempfile::tempdir().unwrap();
    for kind in KINDS {
        let config = config_for(kind, &dir);

        let first = CommandServer::start(&config, registry(Default::default())).unwrap();
        first.shutdown().await.unwrap();

        let second = CommandServer::start(&config, registry(Default::default())).unwrap();
        let token = CancellationToken::new();
        let response = invoke_async(&config, &Request::new("Foo", "Quiet", Vec::<String>::new()), &token)
            .await
            .unwrap();
        assert!(response.is_ok());
        second.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_without_server_is_cancellable() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(TransportKind::SharedMemory, &dir);
    let token = CancellationToken::new();

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };

    let err = invoke_async(&config, &Request::new("Foo", "Bar", Vec::<String>::new()), &token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    canceller.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_socket_without_server_is_a_failure_not_a_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(TransportKind::LocalSocket, &dir);
    let token = CancellationToken::new();

    let err = invoke_async(&config, &Request::new("Foo", "Bar", Vec::<String>::new()), &token)
        .await
        .unwrap_err();
    assert!(!err.is_cancelled());
    assert!(matches!(err, IpcError::Socket { .. }));
}

/// Cancel at varying points around a successful accept. Whatever the outcome,
/// an `Ok` connection must be usable and a cancelled one must not leak.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_races_completed_accept() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(TransportKind::LocalSocket, &dir);
    let listener = Listener::bind(&config).unwrap();

    for delay_us in [0u64, 50, 200, 1_000, 5_000] {
        let token = CancellationToken::new();
        let path = config.socket_path();
        let client = tokio::task::spawn_blocking(move || {
            let mut stream = commander_ipc::socket::connect(path).unwrap();
            // Either the server answers or it dropped the connection
            send_message(&mut stream, "ping").ok()?;
            receive_message(&mut stream).ok()
        });

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_micros(delay_us)).await;
                token.cancel();
            })
        };

        match listener.accept_async(&token).await {
            Ok(mut conn) => {
                // Cancellation after completion must not have touched it
                let request = conn.receive_message().unwrap();
                conn.send_message(&request).unwrap();
                assert_eq!(client.await.unwrap().as_deref(), Some("ping"));
            }
            Err(e) => {
                assert!(e.is_cancelled(), "unexpected error {e}");
                // The client may still be queued; take it off the backlog
                let drain_token = CancellationToken::new();
                let stopper = {
                    let token = drain_token.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        token.cancel();
                    })
                };
                drop(listener.accept_async(&drain_token).await);
                stopper.await.unwrap();
                let _ = client.await;
            }
        }
        canceller.await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_with_idle_shm_client() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_for(TransportKind::SharedMemory, &dir);
    let server = CommandServer::start(&config, registry(Default::default())).unwrap();

    // Connected, but never sends a request
    let (name, read, write) = (config.channel.clone(), config.read_capacity, config.write_capacity);
    let client = tokio::task::spawn_blocking(move || {
        commander_ipc::shm_listener::connect(&name, read, write).unwrap()
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    tokio::time::timeout(Duration::from_secs(5), server.shutdown())
        .await
        .expect("shutdown stalled on an shm exchange")
        .unwrap();
    drop(client);
}
