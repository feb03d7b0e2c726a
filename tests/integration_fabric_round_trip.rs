use std::sync::Arc;
use std::time::Duration;

use nimbus::config::IpcConfig;
use nimbus::error::CoreError;
use nimbus::ipc::fabric::handler_fn;
use nimbus::ipc::{
    ChannelConfig, Endpoint, IpcFabric, Message, MessageKind, SerializationFormat, TransportKind,
};

fn fast_ipc() -> IpcConfig {
    IpcConfig {
        heartbeat_interval: Duration::from_millis(500),
        default_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Two fabric instances talking over a Unix domain socket, as the
/// supervisor and a child process would.
#[tokio::test]
async fn uds_request_response_between_two_fabrics() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("core.sock");
    let endpoint = Endpoint::path(path.to_string_lossy().to_string());

    let server_fabric = IpcFabric::new(fast_ipc());
    let client_fabric = IpcFabric::new(fast_ipc());

    let server = server_fabric.open(
        ChannelConfig::new("network", TransportKind::LocalSocket, endpoint.clone()).listening(),
    );
    server_fabric
        .register_handler(
            server,
            "resource.fetch",
            handler_fn(|message| async move {
                let mut body = b"fetched:".to_vec();
                body.extend_from_slice(&message.payload);
                Some(message.response(body))
            }),
        )
        .unwrap();

    // Give the listener a moment to bind before the client connects.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = client_fabric.open(ChannelConfig::new(
        "renderer-1",
        TransportKind::LocalSocket,
        endpoint,
    ));
    client_fabric
        .wait_connected(client, Duration::from_secs(2))
        .await
        .unwrap();

    let request =
        Message::new(MessageKind::Request, b"https://example.test/a".to_vec())
            .with_route("resource.fetch");
    let response = client_fabric
        .send_and_await(client, request, Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(response.kind, MessageKind::Response);
    assert_eq!(response.payload, b"fetched:https://example.test/a");
}

/// TCP transport with JSON serialization: the structured-text encoding
/// must interoperate end to end, not just in unit round trips.
#[tokio::test]
async fn tcp_json_channel_round_trip() {
    let endpoint = Endpoint::tcp("127.0.0.1", 29871);

    let server_fabric = IpcFabric::new(fast_ipc());
    let client_fabric = IpcFabric::new(fast_ipc());

    let mut server_config =
        ChannelConfig::new("gpu", TransportKind::Tcp, endpoint.clone()).listening();
    server_config.serialization = SerializationFormat::Json;
    let server = server_fabric.open(server_config);
    server_fabric
        .register_handler(
            server,
            "frame.submit",
            handler_fn(|message| async move { Some(message.response(vec![1])) }),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client_config = ChannelConfig::new("compositor", TransportKind::Tcp, endpoint);
    client_config.serialization = SerializationFormat::Json;
    let client = client_fabric.open(client_config);
    client_fabric
        .wait_connected(client, Duration::from_secs(2))
        .await
        .unwrap();

    let mut request = Message::new(MessageKind::Request, vec![0xDE, 0xAD]);
    request.metadata.insert("surface".into(), "main".into());
    let response = client_fabric
        .send_and_await(client, request.with_route("frame.submit"), Some(Duration::from_secs(1)))
        .await
        .unwrap();
    assert_eq!(response.payload, vec![1]);
}

/// A peer that sleeps past the caller's deadline: the await fails at
/// the deadline, the pending slot is gone, and the late response is
/// dropped without completing anything.
#[tokio::test]
async fn slow_peer_times_out_and_late_response_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("slow.sock");
    let endpoint = Endpoint::path(path.to_string_lossy().to_string());

    let server_fabric = IpcFabric::new(fast_ipc());
    let client_fabric = IpcFabric::new(fast_ipc());

    let server = server_fabric.open(
        ChannelConfig::new("storage", TransportKind::LocalSocket, endpoint.clone()).listening(),
    );
    server_fabric
        .register_handler(
            server,
            "blob.read",
            handler_fn(|message| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Some(message.response(b"too late".to_vec()))
            }),
        )
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = client_fabric.open(ChannelConfig::new(
        "renderer-2",
        TransportKind::LocalSocket,
        endpoint,
    ));
    client_fabric
        .wait_connected(client, Duration::from_secs(2))
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let request = Message::new(MessageKind::Request, vec![]).with_route("blob.read");
    let err = client_fabric
        .send_and_await(client, request, Some(Duration::from_millis(100)))
        .await
        .err()
        .expect("await must time out");
    assert!(matches!(err, CoreError::Timeout(_)));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(90) && elapsed < Duration::from_millis(400),
        "timeout fired at {elapsed:?}"
    );

    // Let the late response arrive; the channel must survive it.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = client_fabric.status(client).unwrap();
    assert_eq!(status.state, nimbus::ipc::ChannelState::Connected);
}

/// Messages within one priority class keep their send order.
#[tokio::test]
async fn per_class_fifo_ordering_is_preserved() {
    let endpoint = Endpoint::path("fifo-ordering-ring");
    let fabric = IpcFabric::new(fast_ipc());

    let server = fabric.open(
        ChannelConfig::new("collector", TransportKind::Memory, endpoint.clone()).listening(),
    );
    let received: Arc<parking_lot::Mutex<Vec<u8>>> = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = received.clone();
    fabric
        .register_handler(
            server,
            "sample",
            handler_fn(move |message| {
                let sink = sink.clone();
                async move {
                    sink.lock().push(message.payload[0]);
                    None
                }
            }),
        )
        .unwrap();

    let client = fabric.open(ChannelConfig::new(
        "producer",
        TransportKind::Memory,
        endpoint,
    ));
    fabric
        .wait_connected(client, Duration::from_secs(2))
        .await
        .unwrap();

    for i in 0..32u8 {
        fabric
            .send(
                client,
                Message::new(MessageKind::Notification, vec![i]).with_route("sample"),
            )
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    let order = received.lock().clone();
    assert_eq!(order, (0..32u8).collect::<Vec<u8>>());
}
