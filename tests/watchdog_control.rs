//! Watchdog control path over TCP: client -> RPC server -> supervisor -> child.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use omega::client::{WatchdogClient, DEFAULT_TIMEOUT};
use omega::error::RpcError;
use omega::server::{RpcServer, WatchdogService};
use omega::supervisor::{CommandSpawner, ProcessState, Supervisor, SupervisorConfig};
use omega::wire::ControlSignal;

fn looping_child() -> Arc<CommandSpawner> {
    Arc::new(CommandSpawner::new(
        "/bin/sh",
        vec![
            "-c".to_string(),
            "trap 'exit 0' QUIT; while :; do sleep 0.05; done".to_string(),
        ],
    ))
}

fn config() -> SupervisorConfig {
    SupervisorConfig {
        start_confirm: Duration::from_millis(200),
        quit_timeout: Duration::from_secs(2),
        auto_start: false,
        child_pid_file: None,
    }
}

#[tokio::test]
async fn test_up_status_quit_over_rpc() {
    let supervisor = Supervisor::new(config(), looping_child());
    let cancel = CancellationToken::new();
    let supervise = tokio::spawn(supervisor.clone().run(cancel.clone()));

    let server = RpcServer::bind("127.0.0.1:0", Arc::new(WatchdogService::new(supervisor.clone())))
        .await
        .unwrap();
    let addr = server.local_addr().to_string();
    let mut client = WatchdogClient::connect(&addr, DEFAULT_TIMEOUT).await.unwrap();

    assert_eq!(client.status().await.unwrap(), ProcessState::Idle);

    let pid = client.notify(ControlSignal::Up).await.unwrap();
    assert!(pid > 0);
    assert_eq!(client.status().await.unwrap(), ProcessState::Running { pid: pid as u32 });

    match client.notify(ControlSignal::Up).await {
        Err(RpcError::Remote { message }) => assert_eq!(message, "omega is running"),
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(client.notify(ControlSignal::Quit).await.unwrap(), pid);
    assert_eq!(client.status().await.unwrap(), ProcessState::Idle);

    match client.notify(ControlSignal::Quit).await {
        Err(RpcError::Remote { message }) => assert_eq!(message, "omega is stopped"),
        other => panic!("unexpected {:?}", other),
    }

    server.shutdown().await;
    cancel.cancel();
    supervise.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_second_client_sees_busy_while_starting() {
    let mut cfg = config();
    cfg.start_confirm = Duration::from_millis(800);
    let supervisor = Supervisor::new(cfg, looping_child());
    let cancel = CancellationToken::new();
    let supervise = tokio::spawn(supervisor.clone().run(cancel.clone()));

    let server = RpcServer::bind("127.0.0.1:0", Arc::new(WatchdogService::new(supervisor.clone())))
        .await
        .unwrap();
    let addr = server.local_addr().to_string();

    let first_addr = addr.clone();
    let first = tokio::spawn(async move {
        let mut client = WatchdogClient::connect(&first_addr, DEFAULT_TIMEOUT).await.unwrap();
        client.notify(ControlSignal::Up).await
    });

    // Wait until the first request holds the gate.
    let mut states = supervisor.subscribe();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == ProcessState::Starting))
        .await
        .unwrap()
        .unwrap();

    let mut second = WatchdogClient::connect(&addr, DEFAULT_TIMEOUT).await.unwrap();
    match second.notify(ControlSignal::Quit).await {
        Err(RpcError::Remote { message }) => assert_eq!(message, "watchdog service is busy"),
        other => panic!("unexpected {:?}", other),
    }

    assert!(first.await.unwrap().unwrap() > 0);
    assert!(second.notify(ControlSignal::Quit).await.unwrap() > 0);

    server.shutdown().await;
    cancel.cancel();
    supervise.await.unwrap().unwrap();
}
