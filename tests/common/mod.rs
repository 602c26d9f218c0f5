//! Test utilities shared across the integration suite

#![allow(dead_code)]

use bytes::Bytes;
use socksix::message::{AuthenticationReply, OperationReply, Request};
use socksix::server::{InboundDatagram, SendToReply, ServerWorker};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

/// Run a worker behind a real TCP listener; returns the listen address
pub async fn start_server(worker: Arc<ServerWorker>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, peer)) = listener.accept().await else {
                break;
            };
            let worker = worker.clone();
            tokio::spawn(async move {
                worker
                    .serve_stream(CancellationToken::new(), stream, peer)
                    .await
            });
        }
    });
    addr
}

/// Run a worker's datagram front on a real UDP socket; returns its address
pub async fn start_udp_front(worker: Arc<ServerWorker>) -> SocketAddr {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let dgram = InboundDatagram {
                data: Bytes::copy_from_slice(&buf[..n]),
                source: peer,
                reply: Arc::new(SendToReply::new(socket.clone(), peer)),
            };
            worker.serve_datagram(dgram).await;
        }
    });
    addr
}

/// TCP server that echoes everything back, closing with its peer
pub async fn start_tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
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
            });
        }
    });
    addr
}

/// UDP server that echoes every datagram to its sender
pub async fn start_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

/// Connect, send a request, and read the authentication + operation replies
pub async fn socks6_handshake(
    server: SocketAddr,
    request: &Request,
) -> (TcpStream, AuthenticationReply, OperationReply) {
    let mut stream = TcpStream::connect(server).await.unwrap();
    stream.write_all(&request.marshal()).await.unwrap();
    let auth = AuthenticationReply::read_from(&mut stream).await.unwrap();
    let op = OperationReply::read_from(&mut stream).await.unwrap();
    (stream, auth, op)
}
