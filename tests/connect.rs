//! End-to-end CONNECT scenarios

mod common;

use common::{socks6_handshake, start_server, start_tcp_echo};
use socksix::message::{
    AuthReplyType, CommandCode, ReplyCode, Request, SocksAddr,
};
use socksix::server::ServerWorker;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn connect_with_initial_data_then_echo() {
    // upstream records its first four bytes, then echoes
    let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream.local_addr().unwrap();
    let recorder = tokio::spawn(async move {
        let (mut conn, _) = upstream.accept().await.unwrap();
        let mut first = [0u8; 4];
        conn.read_exact(&mut first).await.unwrap();
        let mut buf = [0u8; 4096];
        loop {
            match conn.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if conn.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        first
    });

    let server = start_server(Arc::new(ServerWorker::new())).await;

    let mut req = Request::new(CommandCode::Connect, SocksAddr::Ip(upstream_addr));
    req.options.add_method_advertisement(4, &[]);

    let mut stream = TcpStream::connect(server).await.unwrap();
    let mut bytes = req.marshal().to_vec();
    bytes.extend_from_slice(&[1, 2, 3, 4]);
    stream.write_all(&bytes).await.unwrap();

    let auth = socksix::message::AuthenticationReply::read_from(&mut stream)
        .await
        .unwrap();
    assert_eq!(auth.reply_type, AuthReplyType::Success);
    let op = socksix::message::OperationReply::read_from(&mut stream)
        .await
        .unwrap();
    assert_eq!(op.code, ReplyCode::Success);
    assert_ne!(op.endpoint.port(), 0);

    // bidirectional relay is intact
    for chunk in [&b"alpha"[..], &b"bravo charlie"[..]] {
        stream.write_all(chunk).await.unwrap();
        let mut echoed = vec![0u8; chunk.len()];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, chunk);
    }

    // initial data reached the upstream before any relayed bytes
    drop(stream);
    assert_eq!(recorder.await.unwrap(), [1, 2, 3, 4]);
}

#[tokio::test]
async fn connect_refused_reports_code_and_closes() {
    let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let closed_port = probe.local_addr().unwrap().port();
    drop(probe);

    let server = start_server(Arc::new(ServerWorker::new())).await;
    let req = Request::new(
        CommandCode::Connect,
        SocksAddr::ipv4("127.0.0.1".parse().unwrap(), closed_port),
    );
    let (mut stream, auth, op) = socks6_handshake(server, &req).await;

    assert_eq!(auth.reply_type, AuthReplyType::Success);
    assert_eq!(op.code, ReplyCode::ConnectionRefused);

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn connect_to_echo_service_many_round_trips() {
    let echo = start_tcp_echo().await;
    let server = start_server(Arc::new(ServerWorker::new())).await;

    let req = Request::new(CommandCode::Connect, SocksAddr::Ip(echo));
    let (mut stream, _auth, op) = socks6_handshake(server, &req).await;
    assert_eq!(op.code, ReplyCode::Success);

    for i in 0..32u32 {
        let payload = i.to_be_bytes();
        stream.write_all(&payload).await.unwrap();
        let mut back = [0u8; 4];
        stream.read_exact(&mut back).await.unwrap();
        assert_eq!(back, payload);
    }
}

#[tokio::test]
async fn http_request_gets_500_page() {
    let server = start_server(Arc::new(ServerWorker::new())).await;

    let mut stream = TcpStream::connect(server).await.unwrap();
    stream.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

    let mut reply = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut reply))
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8(reply).unwrap();

    assert_eq!(
        text.lines().next().unwrap(),
        "HTTP/1.0 500 Internal Server Error"
    );
    assert!(text.contains("Proxy-Status: "));

    let content_length: usize = text
        .lines()
        .find(|l| l.starts_with("Content-Length: "))
        .and_then(|l| l.trim_start_matches("Content-Length: ").parse().ok())
        .unwrap();
    let body = text.split("\r\n\r\n").nth(1).unwrap();
    assert_eq!(body.len(), content_length);
}

#[tokio::test]
async fn socks5_client_gets_no_method_reply() {
    let server = start_server(Arc::new(ServerWorker::new())).await;

    let mut stream = TcpStream::connect(server).await.unwrap();
    stream.write_all(&[5u8, 1, 0]).await.unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, vec![5, 0xFF]);
}
