//! TCP server runtime tests

use bytes::Bytes;
use portico_engine::{builtin, Endpoint, HandlerCatalog, LifecycleState, ServerInfos, ServerRuntime};
use portico_test_utils::{wait_for, Recorder, TlsMaterial, DEFAULT_CHECK_INTERVAL, DEFAULT_TIMEOUT};
use portico_transport::{
    TcpServer, TcpTransport, TlsFiles, TlsProvider, TransportEvent, TransportReceiver,
    TransportSender,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn catalog_with(recorder: &Arc<Recorder>) -> Arc<HandlerCatalog> {
    let catalog = builtin::catalog();
    catalog.register("recording", recorder.factory(true));
    Arc::new(catalog)
}

async fn expect_frame(receiver: &mut impl TransportReceiver) -> Bytes {
    match timeout(DEFAULT_TIMEOUT, receiver.recv()).await {
        Ok(Some(TransportEvent::Data(data))) => data,
        other => panic!("expected a frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_lifecycle_and_echo() {
    let recorder = Recorder::new();
    let server = ServerRuntime::new(
        "lobby",
        ServerInfos::new("127.0.0.1", 0, vec!["recording".into(), "log".into()]),
        catalog_with(&recorder),
    );

    assert_eq!(server.state(), LifecycleState::Down);
    assert!(server.local_addr().is_none());
    assert_eq!(server.init().await, LifecycleState::Ready);
    let port = server.local_addr().unwrap().port();
    assert_ne!(port, 0);

    assert_eq!(server.run().await, LifecycleState::Running);

    let (sender, mut receiver) = TcpTransport::new().connect("127.0.0.1", port).await.unwrap();
    sender.send(Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(expect_frame(&mut receiver).await, Bytes::from_static(b"hello"));

    let sessions = server.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state(), LifecycleState::Running);

    let handler = sessions[0].handler().unwrap();
    assert_eq!(handler.identity(), "recording");
    assert_eq!(handler.link().offered_protocols(), ["recording", "log"]);

    server.shutdown().await;
    assert!(recorder.wait_for_close(DEFAULT_TIMEOUT).await);
    assert!(server.sessions().is_empty());
}

#[tokio::test]
async fn test_each_connection_gets_its_own_session() {
    let recorder = Recorder::new();
    let server = ServerRuntime::new(
        "lobby",
        ServerInfos::new("127.0.0.1", 0, vec!["recording".into()]),
        catalog_with(&recorder),
    );
    server.run().await;
    let port = server.local_addr().unwrap().port();

    let mut peers = Vec::new();
    for i in 0..3u8 {
        let (sender, mut receiver) = TcpTransport::new().connect("127.0.0.1", port).await.unwrap();
        sender.send(Bytes::from(vec![i])).await.unwrap();
        assert_eq!(expect_frame(&mut receiver).await, Bytes::from(vec![i]));
        peers.push((sender, receiver));
    }

    let sessions = server.sessions();
    assert_eq!(sessions.len(), 3);
    let ids: Vec<u64> = sessions.iter().map(|s| s.id()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(recorder.opened(), 3);

    // Closing one peer finishes only that session
    let (first, _) = peers.remove(0);
    first.close().await.unwrap();
    assert!(
        wait_for(
            || async { server.sessions().len() == 2 },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );

    server.shutdown().await;
}

#[tokio::test]
async fn test_bind_conflict_is_broken() {
    let holder = TcpServer::bind("127.0.0.1", 0, 4).await.unwrap();
    let port = holder.local_addr().unwrap().port();

    let server = ServerRuntime::new(
        "dup",
        ServerInfos::new("127.0.0.1", port, vec![builtin::ECHO.into()]),
        Arc::new(builtin::catalog()),
    );

    assert_eq!(server.run().await, LifecycleState::Broken);
    assert!(server.local_addr().is_none());
}

#[tokio::test]
async fn test_unknown_protocol_is_broken() {
    let server = ServerRuntime::new(
        "typo",
        ServerInfos::new("127.0.0.1", 0, vec![builtin::ECHO.into(), "nope".into()]),
        Arc::new(builtin::catalog()),
    );
    assert_eq!(server.run().await, LifecycleState::Broken);
}

#[tokio::test]
async fn test_tls_server_sessions() {
    let material = TlsMaterial::generate();
    let recorder = Recorder::new();
    let server = ServerRuntime::new(
        "secure",
        ServerInfos::new("127.0.0.1", 0, vec!["recording".into()])
            .with_tls(material.cert.clone(), material.key.clone()),
        catalog_with(&recorder),
    );
    assert_eq!(server.run().await, LifecycleState::Running);
    let port = server.local_addr().unwrap().port();

    let connector = TlsProvider::client(&TlsFiles {
        ca_file: Some(material.cert.clone()),
        ..Default::default()
    })
    .unwrap();
    let transport = TcpTransport::new();
    let stream = transport.open("127.0.0.1", port).await.unwrap();
    let tls = connector
        .connect(TlsProvider::server_name("localhost").unwrap(), stream)
        .await
        .unwrap();
    let (sender, mut receiver) = transport.framed(tls);

    sender.send(Bytes::from_static(b"sealed")).await.unwrap();
    assert_eq!(expect_frame(&mut receiver).await, Bytes::from_static(b"sealed"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_failed_handshake_breaks_only_that_session() {
    let material = TlsMaterial::generate();
    let recorder = Recorder::new();
    let mut infos = ServerInfos::new("127.0.0.1", 0, vec!["recording".into()])
        .with_tls(material.cert.clone(), material.key.clone());
    infos.connect_timeout_ms = 300;
    let server = ServerRuntime::new("secure", infos, catalog_with(&recorder));
    server.run().await;
    let port = server.local_addr().unwrap().port();

    // Plain TCP peer that never starts a handshake
    let _plain = TcpTransport::new().open("127.0.0.1", port).await.unwrap();

    assert!(
        wait_for(
            || async { server.sessions().len() == 1 },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );
    // Handshake timeout breaks the session, which is then pruned
    assert!(
        wait_for(
            || async { server.sessions().is_empty() },
            DEFAULT_CHECK_INTERVAL,
            Duration::from_secs(5)
        )
        .await
    );
    assert_eq!(recorder.opened(), 0);

    // The listener is unaffected
    assert_eq!(server.state(), LifecycleState::Running);
    let connector = TlsProvider::client(&TlsFiles {
        ca_file: Some(material.cert.clone()),
        ..Default::default()
    })
    .unwrap();
    let stream = TcpTransport::new().open("127.0.0.1", port).await.unwrap();
    let tls = connector
        .connect(TlsProvider::server_name("localhost").unwrap(), stream)
        .await
        .unwrap();
    let (sender, mut receiver) = TcpTransport::new().framed(tls);
    sender.send(Bytes::from_static(b"ok")).await.unwrap();
    assert_eq!(expect_frame(&mut receiver).await, Bytes::from_static(b"ok"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_listener() {
    let server = ServerRuntime::new(
        "lobby",
        ServerInfos::new("127.0.0.1", 0, vec![builtin::ECHO.into()]),
        Arc::new(builtin::catalog()),
    );
    server.run().await;
    let port = server.local_addr().unwrap().port();

    server.shutdown().await;

    let transport = TcpTransport::new();
    assert!(
        wait_for(
            || async { transport.open("127.0.0.1", port).await.is_err() },
            DEFAULT_CHECK_INTERVAL,
            DEFAULT_TIMEOUT
        )
        .await
    );
}
