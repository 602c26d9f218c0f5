//! BIND handler
//!
//! Two modes keyed off the request's backlog stack option. Backlog 0 binds a
//! listener, waits for exactly one upstream connection and relays it. A
//! nonzero backlog registers a [`BacklogBindWorker`] that keeps accepting
//! into a bounded queue; each further BIND call from the same session
//! dequeues one connection.

use super::connect::reply_code_from_io;
use super::{ServerWorker, SocksConn};
use crate::message::{OperationReply, ReplyCode, SocksAddr, StackOptionInfo};
use crate::relay;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Listener shared by successive BIND calls of one client session.
///
/// The accept task pushes upstream connections into a queue bounded by the
/// requested backlog; a full queue blocks the task, which pauses accepting
/// and keeps memory bounded. The `alive` flag is refreshed on every accept
/// and every serve so the reaper only evicts workers idle across a full
/// tick.
pub(crate) struct BacklogBindWorker {
    session: Vec<u8>,
    local_addr: SocketAddr,
    queue: Mutex<mpsc::Receiver<TcpStream>>,
    alive: AtomicBool,
    cancel: CancellationToken,
}

impl BacklogBindWorker {
    pub(crate) fn spawn(
        listener: TcpListener,
        backlog: u16,
        session: Vec<u8>,
    ) -> io::Result<Arc<Self>> {
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(backlog as usize);
        let cancel = CancellationToken::new();
        let worker = Arc::new(BacklogBindWorker {
            session,
            local_addr,
            queue: Mutex::new(rx),
            alive: AtomicBool::new(true),
            cancel: cancel.clone(),
        });

        let accept_side = worker.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => match accepted {
                        Ok((conn, upstream_peer)) => {
                            accept_side.alive.store(true, Ordering::Relaxed);
                            debug!(%upstream_peer, listener = %accept_side.local_addr, "backlog accepted upstream");
                            if tx.send(conn).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(listener = %accept_side.local_addr, error = %e, "backlog accept failed");
                            return;
                        }
                    }
                }
            }
        });

        Ok(worker)
    }

    pub(crate) fn session(&self) -> &[u8] {
        &self.session
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Take one queued upstream connection, waiting when the queue is empty.
    ///
    /// `None` means the listener died or the caller was cancelled.
    pub(crate) async fn dequeue(&self, cancel: &CancellationToken) -> Option<TcpStream> {
        let mut queue = self.queue.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => None,
            conn = queue.recv() => conn,
        }
    }

    pub(crate) fn touch(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Read and reset the alive flag; the reaper's two-phase eviction
    pub(crate) fn check_and_clear_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl ServerWorker {
    pub(super) async fn bind_handler(&self, cancel: CancellationToken, cc: SocksConn) {
        let options = cc.request.options.stack_options();
        let backlog = options.backlog();
        if backlog == 0 {
            self.bind_single(cancel, cc, options).await
        } else {
            self.bind_backlog(cancel, cc, options, backlog).await
        }
    }

    async fn bind_single(
        &self,
        cancel: CancellationToken,
        mut cc: SocksConn,
        options: StackOptionInfo,
    ) {
        let (listener, _negotiated) =
            match self.outbound.listen(options, &cc.request.endpoint).await {
                Ok(bound) => bound,
                Err(e) => {
                    info!(peer = %cc.peer, target = %cc.request.endpoint, error = %e, "bind failed");
                    let reply = OperationReply::with_code(reply_code_from_io(&e));
                    let _ = cc.stream.write_all(&reply.marshal()).await;
                    return;
                }
            };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %cc.peer, error = %e, "listener has no local address");
                let reply = OperationReply::with_code(ReplyCode::ServerFailure);
                let _ = cc.stream.write_all(&reply.marshal()).await;
                return;
            }
        };

        let reply = OperationReply::success(SocksAddr::from(local_addr));
        if let Err(e) = cc.stream.write_all(&reply.marshal()).await {
            warn!(peer = %cc.peer, error = %e, "can't write operation reply");
            return;
        }

        let accepted = tokio::select! {
            // client context is gone, no reply owed
            _ = cancel.cancelled() => return,
            r = tokio::time::timeout(self.bind_accept_timeout, listener.accept()) => r,
        };
        let (upstream, upstream_peer) = match accepted {
            Err(_) => {
                debug!(peer = %cc.peer, listener = %local_addr, "bind accept timed out");
                let reply = OperationReply::with_code(ReplyCode::Timeout);
                let _ = cc.stream.write_all(&reply.marshal()).await;
                return;
            }
            Ok(Err(e)) => {
                warn!(peer = %cc.peer, error = %e, "bind accept failed");
                let reply = OperationReply::with_code(reply_code_from_io(&e));
                let _ = cc.stream.write_all(&reply.marshal()).await;
                return;
            }
            Ok(Ok(conn)) => conn,
        };
        drop(listener);

        debug!(peer = %cc.peer, %upstream_peer, "bind accepted upstream");
        let reply = OperationReply::success(SocksAddr::from(upstream_peer));
        if let Err(e) = cc.stream.write_all(&reply.marshal()).await {
            warn!(peer = %cc.peer, error = %e, "can't write second operation reply");
            return;
        }

        let _ = relay::relay(cc.stream, upstream, self.relay_idle_timeout, cancel).await;
    }

    async fn bind_backlog(
        &self,
        cancel: CancellationToken,
        mut cc: SocksConn,
        options: StackOptionInfo,
        backlog: u16,
    ) {
        let key = cc.request.endpoint.to_string();
        let existing = self.maps.backlog_workers.read().await.get(&key).cloned();

        let worker = match existing {
            Some(worker) => {
                if worker.session() != cc.session {
                    info!(peer = %cc.peer, listener = %key, "bind address reserved by another session");
                    let reply = OperationReply::with_code(ReplyCode::ServerFailure);
                    let _ = cc.stream.write_all(&reply.marshal()).await;
                    return;
                }
                worker.touch();
                worker
            }
            None => {
                let (listener, _negotiated) =
                    match self.outbound.listen(options, &cc.request.endpoint).await {
                        Ok(bound) => bound,
                        Err(e) => {
                            info!(peer = %cc.peer, target = %cc.request.endpoint, error = %e, "backlog bind failed");
                            let reply = OperationReply::with_code(reply_code_from_io(&e));
                            let _ = cc.stream.write_all(&reply.marshal()).await;
                            return;
                        }
                    };
                let worker =
                    match BacklogBindWorker::spawn(listener, backlog, cc.session.clone()) {
                        Ok(worker) => worker,
                        Err(e) => {
                            warn!(peer = %cc.peer, error = %e, "can't start backlog worker");
                            let reply = OperationReply::with_code(ReplyCode::ServerFailure);
                            let _ = cc.stream.write_all(&reply.marshal()).await;
                            return;
                        }
                    };
                debug!(peer = %cc.peer, listener = %worker.local_addr(), backlog, "backlog worker registered");
                self.maps
                    .backlog_workers
                    .write()
                    .await
                    .insert(worker.local_addr().to_string(), worker.clone());
                worker
            }
        };

        let reply = OperationReply::success(SocksAddr::from(worker.local_addr()));
        if let Err(e) = cc.stream.write_all(&reply.marshal()).await {
            warn!(peer = %cc.peer, error = %e, "can't write operation reply");
            return;
        }

        let Some(upstream) = worker.dequeue(&cancel).await else {
            if !cancel.is_cancelled() {
                let reply = OperationReply::with_code(ReplyCode::ServerFailure);
                let _ = cc.stream.write_all(&reply.marshal()).await;
            }
            return;
        };
        worker.touch();

        let upstream_peer = match upstream.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %cc.peer, error = %e, "queued upstream lost its peer");
                let reply = OperationReply::with_code(ReplyCode::ServerFailure);
                let _ = cc.stream.write_all(&reply.marshal()).await;
                return;
            }
        };
        debug!(peer = %cc.peer, %upstream_peer, "backlog served upstream");
        let reply = OperationReply::success(SocksAddr::from(upstream_peer));
        if let Err(e) = cc.stream.write_all(&reply.marshal()).await {
            warn!(peer = %cc.peer, error = %e, "can't write second operation reply");
            return;
        }

        let _ = relay::relay(cc.stream, upstream, self.relay_idle_timeout, cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn bound_listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_worker_queues_and_serves() {
        let (listener, addr) = bound_listener().await;
        let worker = BacklogBindWorker::spawn(listener, 2, vec![1]).unwrap();

        let dialer = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let cancel = CancellationToken::new();
        let queued = worker.dequeue(&cancel).await.unwrap();
        assert_eq!(queued.local_addr().unwrap(), addr);
        dialer.await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_over_backlog_connections_all_arrive_eventually() {
        let (listener, addr) = bound_listener().await;
        let worker = BacklogBindWorker::spawn(listener, 1, vec![1]).unwrap();

        let mut dialers = Vec::new();
        for _ in 0..3 {
            dialers.push(tokio::spawn(async move {
                TcpStream::connect(addr).await.unwrap()
            }));
        }

        // backlog 1: at most one connection sits in the queue, yet every
        // dialer is served once consumers keep draining
        let cancel = CancellationToken::new();
        for _ in 0..3 {
            assert!(worker.dequeue(&cancel).await.is_some());
        }
        for dialer in dialers {
            dialer.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_worker_dequeue_cancellation() {
        let (listener, _addr) = bound_listener().await;
        let worker = BacklogBindWorker::spawn(listener, 1, vec![1]).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(worker.dequeue(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_worker_shutdown_closes_queue() {
        let (listener, addr) = bound_listener().await;
        let worker = BacklogBindWorker::spawn(listener, 1, vec![1]).unwrap();

        worker.shutdown();
        // give the accept task a moment to observe cancellation
        tokio::time::sleep(Duration::from_millis(20)).await;

        // the listener is gone; dialing fails or dequeue yields nothing
        let cancel = CancellationToken::new();
        let dial = TcpStream::connect(addr).await;
        if dial.is_ok() {
            // connection may land in the kernel backlog; the queue stays shut
            assert!(worker.dequeue(&cancel).await.is_none());
        }
    }

    #[tokio::test]
    async fn test_alive_flag_two_phase() {
        let (listener, _addr) = bound_listener().await;
        let worker = BacklogBindWorker::spawn(listener, 1, vec![1]).unwrap();

        assert!(worker.check_and_clear_alive());
        assert!(!worker.check_and_clear_alive());
        worker.touch();
        assert!(worker.check_and_clear_alive());
    }
}
