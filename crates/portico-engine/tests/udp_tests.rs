//! UDP runtime tests

use bytes::Bytes;
use portico_engine::{builtin, Endpoint, EngineError, HandlerCatalog, Inbound, LifecycleState, UdpInfos, UdpRuntime};
use portico_test_utils::{find_available_udp_port, Recorder, DEFAULT_TIMEOUT};
use portico_transport::{TransportEvent, UdpTransport};
use std::sync::Arc;
use tokio::time::timeout;

fn catalog_with(recorder: &Arc<Recorder>, echo: bool) -> Arc<HandlerCatalog> {
    let catalog = builtin::catalog();
    catalog.register("recording", recorder.factory(echo));
    Arc::new(catalog)
}

#[tokio::test]
async fn test_bound_handler_receives_datagrams() {
    let recorder = Recorder::new();
    let udp = UdpRuntime::new(
        "beacon",
        UdpInfos::bound("127.0.0.1", 0).with_handler("recording"),
        catalog_with(&recorder, true),
    );

    assert_eq!(udp.init().await, LifecycleState::Ready);
    assert_eq!(udp.run().await, LifecycleState::Running);
    let target = udp.local_addr().unwrap();

    let peer = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let mut replies = peer.start_receiver();
    peer.send_to(b"ping", target).await.unwrap();

    assert!(recorder.wait_for_messages(1, DEFAULT_TIMEOUT).await);
    match &recorder.messages()[0] {
        Inbound::Datagram { payload, from } => {
            assert_eq!(payload.as_ref(), b"ping");
            assert_eq!(*from, peer.local_addr().unwrap());
        }
        other => panic!("expected a datagram, got {:?}", other),
    }

    // Echoed back to the sender
    match timeout(DEFAULT_TIMEOUT, replies.recv_from()).await {
        Ok(Some((TransportEvent::Data(data), from))) => {
            assert_eq!(data.as_ref(), b"ping");
            assert_eq!(from, target);
        }
        other => panic!("expected an echo, got {:?}", other),
    }

    udp.shutdown().await;
    assert!(recorder.wait_for_close(DEFAULT_TIMEOUT).await);
}

#[tokio::test]
async fn test_send_only_targets_configured_peer() {
    let listener = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let mut incoming = listener.start_receiver();

    let udp = UdpRuntime::new(
        "emitter",
        UdpInfos::sender("127.0.0.1", listen_addr.port()),
        Arc::new(builtin::catalog()),
    );
    assert_eq!(udp.run().await, LifecycleState::Running);

    let link = udp.link().unwrap();
    assert_eq!(link.peer(), Some(listen_addr));
    link.send(Bytes::from_static(b"tick")).await.unwrap();

    match timeout(DEFAULT_TIMEOUT, incoming.recv_from()).await {
        Ok(Some((TransportEvent::Data(data), from))) => {
            assert_eq!(data.as_ref(), b"tick");
            assert_eq!(from.port(), udp.local_addr().unwrap().port());
        }
        other => panic!("expected a datagram, got {:?}", other),
    }

    udp.shutdown().await;
    assert!(udp.handler().unwrap().is_finished());
    assert!(link.send(Bytes::from_static(b"late")).await.is_err());
}

#[tokio::test]
async fn test_bound_link_requires_explicit_target() {
    let udp = UdpRuntime::new(
        "sink",
        UdpInfos::bound("127.0.0.1", 0),
        Arc::new(builtin::catalog()),
    );
    udp.run().await;

    let link = udp.link().unwrap();
    assert_eq!(link.kind(), "udp");
    assert!(matches!(
        link.send(Bytes::from_static(b"x")).await,
        Err(EngineError::Unsupported { link: "udp", .. })
    ));
    assert!(matches!(
        link.publish("t", Bytes::new(), None).await,
        Err(EngineError::Unsupported { .. })
    ));

    udp.shutdown().await;
}

#[tokio::test]
async fn test_port_in_use_is_broken() {
    let port = find_available_udp_port();
    let _holder = UdpTransport::bind(&format!("127.0.0.1:{}", port)).await.unwrap();

    let udp = UdpRuntime::new(
        "clash",
        UdpInfos::bound("127.0.0.1", port),
        Arc::new(builtin::catalog()),
    );
    assert_eq!(udp.run().await, LifecycleState::Broken);
    assert!(udp.link().is_none());
}

#[tokio::test]
async fn test_sink_drops_datagrams() {
    let udp = UdpRuntime::new(
        "sink",
        UdpInfos::bound("127.0.0.1", 0),
        Arc::new(builtin::catalog()),
    );
    udp.run().await;
    assert_eq!(udp.handler().unwrap().identity(), "sink");

    let peer = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    peer.send_to(b"ignored", udp.local_addr().unwrap()).await.unwrap();

    udp.shutdown().await;
    assert!(udp.handler().unwrap().is_finished());
}

#[tokio::test]
async fn test_zero_packet_size_is_broken() {
    let udp = UdpRuntime::new(
        "truncating",
        UdpInfos::bound("127.0.0.1", 0)
            .with_handler(builtin::ECHO)
            .with_max_packet_size(0),
        Arc::new(builtin::catalog()),
    );
    assert_eq!(udp.run().await, LifecycleState::Broken);
    assert!(udp.link().is_none());
}
