//! Transport Layer Tests
//!
//! - Framed TCP round trips through `TcpServer` / `TcpTransport`
//! - Local close propagates to the peer
//! - Connect failures and timeouts
//! - Queued frames survive a local close
//! - Oversized frames are refused at send time
//! - UDP send-only sockets

use bytes::Bytes;
use portico_transport::{
    TcpConfig, TcpServer, TcpTransport, TransportError, TransportEvent, TransportReceiver,
    TransportSender, UdpTransport,
};
use std::time::Duration;
use tokio::time::timeout;

async fn next_data(receiver: &mut impl TransportReceiver) -> Option<Bytes> {
    loop {
        match timeout(Duration::from_secs(5), receiver.recv()).await {
            Ok(Some(TransportEvent::Data(data))) => return Some(data),
            Ok(Some(TransportEvent::Error(_))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn test_framed_echo_round_trip() {
    let server = TcpServer::bind("127.0.0.1", 0, 10).await.unwrap();
    let addr = server.local_addr().unwrap();

    let accept_handle = tokio::spawn(async move {
        let (stream, _peer) = server.accept().await.unwrap();
        let (sender, mut receiver) = TcpTransport::new().framed(stream);
        while let Some(data) = next_data(&mut receiver).await {
            sender.send(data).await.unwrap();
        }
    });

    let transport = TcpTransport::new();
    let (sender, mut receiver) = transport
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap();

    for payload in ["first", "second", "third"] {
        sender.send(Bytes::from(payload)).await.unwrap();
        let echoed = next_data(&mut receiver).await.expect("no echo");
        assert_eq!(echoed, Bytes::from(payload));
    }

    sender.close().await.unwrap();
    timeout(Duration::from_secs(5), accept_handle)
        .await
        .expect("server did not observe close")
        .unwrap();
}

#[tokio::test]
async fn test_close_reports_disconnect_to_peer() {
    let server = TcpServer::bind("127.0.0.1", 0, 4).await.unwrap();
    let addr = server.local_addr().unwrap();

    let client = tokio::spawn(async move {
        TcpTransport::new()
            .connect("127.0.0.1", addr.port())
            .await
            .unwrap()
    });

    let (stream, _) = server.accept().await.unwrap();
    let (_server_sender, mut server_receiver) = TcpTransport::new().framed(stream);
    let (client_sender, _client_receiver) = client.await.unwrap();

    client_sender.close().await.unwrap();
    assert!(!client_sender.is_connected());

    let event = timeout(Duration::from_secs(5), server_receiver.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert!(matches!(event, TransportEvent::Disconnected { .. }));

    let err = client_sender.send(Bytes::from("late")).await.unwrap_err();
    assert!(matches!(err, TransportError::NotConnected));
}

#[tokio::test]
async fn test_local_close_reports_disconnect_locally() {
    let server = TcpServer::bind("127.0.0.1", 0, 4).await.unwrap();
    let addr = server.local_addr().unwrap();

    let accept = tokio::spawn(async move { server.accept().await.unwrap() });
    let (sender, mut receiver) = TcpTransport::new()
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap();
    let _peer = accept.await.unwrap();

    sender.close().await.unwrap();
    let event = timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    match event {
        TransportEvent::Disconnected { reason } => {
            assert_eq!(reason.as_deref(), Some("closed locally"));
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connect_refused() {
    // Grab a free port, then release it so nothing is listening
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let result = TcpTransport::new().connect("127.0.0.1", port).await;
    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
}

#[tokio::test]
async fn test_connect_timeout() {
    let transport = TcpTransport::with_config(TcpConfig {
        connect_timeout: Duration::from_millis(1),
        ..Default::default()
    });

    // 10.255.255.1 is non-routable; the connect either times out or fails fast
    let result = transport.connect("10.255.255.1", 9).await;
    assert!(matches!(
        result,
        Err(TransportError::Timeout) | Err(TransportError::ConnectionFailed(_))
    ));
}

#[tokio::test]
async fn test_bind_conflict_is_bind_failed() {
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    // SO_REUSEADDR does not allow two live listeners on the same port
    let result = TcpServer::bind("127.0.0.1", port, 1).await;
    assert!(matches!(result, Err(TransportError::BindFailed(_))));
}

#[tokio::test]
async fn test_udp_ephemeral_send_only() {
    let receiver_socket = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let remote = receiver_socket.local_addr().unwrap();
    let mut incoming = receiver_socket.start_receiver();

    let sender_socket = UdpTransport::ephemeral(remote).await.unwrap();
    assert_ne!(sender_socket.local_addr().unwrap().port(), 0);

    sender_socket.send_to(b"datagram", remote).await.unwrap();

    let (event, from) = timeout(Duration::from_secs(5), incoming.recv_from())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, TransportEvent::Data(ref d) if d.as_ref() == b"datagram"));
    assert_eq!(from.port(), sender_socket.local_addr().unwrap().port());
}

#[tokio::test]
async fn test_send_then_close_delivers_queued_frames() {
    const CONNECTIONS: usize = 100;

    let server = TcpServer::bind("127.0.0.1", 0, 128).await.unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        for _ in 0..CONNECTIONS {
            let (stream, _) = server.accept().await.unwrap();
            let (sender, _receiver) = TcpTransport::new().framed(stream);
            sender.send(Bytes::from_static(b"bye")).await.unwrap();
            sender.close().await.unwrap();
        }
    });

    let mut delivered = 0;
    for _ in 0..CONNECTIONS {
        let (_sender, mut receiver) = TcpTransport::new()
            .connect("127.0.0.1", addr.port())
            .await
            .unwrap();
        if next_data(&mut receiver).await.as_deref() == Some(&b"bye"[..]) {
            delivered += 1;
        }
    }
    assert_eq!(delivered, CONNECTIONS);
}

#[tokio::test]
async fn test_close_flushes_every_queued_frame() {
    let server = TcpServer::bind("127.0.0.1", 0, 4).await.unwrap();
    let addr = server.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = server.accept().await.unwrap();
        let (sender, _receiver) = TcpTransport::new().framed(stream);
        for i in 0..200u32 {
            sender.send(Bytes::from(i.to_be_bytes().to_vec())).await.unwrap();
        }
        sender.close().await.unwrap();
    });

    let (_sender, mut receiver) = TcpTransport::new()
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap();
    for i in 0..200u32 {
        let frame = next_data(&mut receiver).await.expect("frame lost on close");
        assert_eq!(frame.as_ref(), &i.to_be_bytes());
    }
    let event = timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert!(matches!(event, TransportEvent::Disconnected { .. }));
}

#[tokio::test]
async fn test_oversized_frame_is_rejected_before_sending() {
    let server = TcpServer::bind("127.0.0.1", 0, 4).await.unwrap();
    let addr = server.local_addr().unwrap();

    let accept_handle = tokio::spawn(async move {
        let (stream, _) = server.accept().await.unwrap();
        let (sender, mut receiver) = TcpTransport::new().framed(stream);
        let echoed = next_data(&mut receiver).await;
        if let Some(data) = echoed.clone() {
            sender.send(data).await.unwrap();
        }
        echoed
    });

    let (sender, mut receiver) = TcpTransport::new()
        .connect("127.0.0.1", addr.port())
        .await
        .unwrap();

    let oversized = Bytes::from(vec![0u8; 70 * 1024]);
    let err = sender.send(oversized).await.unwrap_err();
    assert!(matches!(err, TransportError::FrameTooLarge(len) if len == 70 * 1024));

    // The connection survives and the exact limit still goes through
    assert!(sender.is_connected());
    let at_limit = Bytes::from(vec![7u8; 64 * 1024]);
    sender.send(at_limit.clone()).await.unwrap();
    assert_eq!(next_data(&mut receiver).await, Some(at_limit.clone()));
    assert_eq!(accept_handle.await.unwrap(), Some(at_limit));
}

#[tokio::test]
async fn test_frame_limit_follows_config() {
    let server = TcpServer::bind("127.0.0.1", 0, 4).await.unwrap();
    let addr = server.local_addr().unwrap();
    let accept = tokio::spawn(async move { server.accept().await.unwrap() });

    let transport = TcpTransport::with_config(TcpConfig {
        max_message_size: 16,
        ..Default::default()
    });
    let (sender, _receiver) = transport.connect("127.0.0.1", addr.port()).await.unwrap();
    let _peer = accept.await.unwrap();

    assert!(sender.send(Bytes::from(vec![1u8; 16])).await.is_ok());
    assert!(matches!(
        sender.send(Bytes::from(vec![1u8; 17])).await,
        Err(TransportError::FrameTooLarge(17))
    ));
}
