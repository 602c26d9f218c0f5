//! CONNECT handler
//!
//! Dials the requested endpoint through the outbound provider, reports the
//! outcome as an operation reply, flushes any initial data, then hands both
//! streams to the relay engine.

use super::{ServerWorker, SocksConn};
use crate::message::{OperationReply, ReplyCode, SocksAddr};
use crate::relay;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

impl ServerWorker {
    pub(super) async fn connect_handler(&self, cancel: CancellationToken, mut cc: SocksConn) {
        let options = cc.request.options.stack_options();

        let (conn, _negotiated) = match self.outbound.dial(options, &cc.request.endpoint).await {
            Ok(established) => established,
            Err(e) => {
                let code = reply_code_from_io(&e);
                info!(peer = %cc.peer, target = %cc.request.endpoint, error = %e, "connect failed");
                let reply = OperationReply::with_code(code);
                let _ = cc.stream.write_all(&reply.marshal()).await;
                return;
            }
        };

        let mut upstream = conn.stream;
        let reply = OperationReply::success(SocksAddr::from(conn.local_addr));
        if let Err(e) = cc.stream.write_all(&reply.marshal()).await {
            warn!(peer = %cc.peer, error = %e, "can't write operation reply");
            return;
        }

        // Initial data reaches the upstream before any relayed bytes.
        if !cc.initial_data.is_empty() {
            if let Err(e) = upstream.write_all(&cc.initial_data).await {
                warn!(peer = %cc.peer, error = %e, "can't flush initial data");
                return;
            }
        }

        debug!(peer = %cc.peer, target = %cc.request.endpoint, "connect relay start");
        match relay::relay(cc.stream, upstream, self.relay_idle_timeout, cancel).await {
            Ok(()) => debug!(peer = %cc.peer, "connect relay done"),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                debug!(peer = %cc.peer, "connect relay cancelled")
            }
            Err(e) => debug!(peer = %cc.peer, error = %e, "connect relay ended"),
        }
    }
}

/// Map a dial/listen error to the operation reply code reported to the client
pub(crate) fn reply_code_from_io(err: &io::Error) -> ReplyCode {
    match err.kind() {
        io::ErrorKind::TimedOut => ReplyCode::Timeout,
        io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
        io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        // a name that resolved to nothing is as unreachable as it gets
        io::ErrorKind::NotFound => ReplyCode::HostUnreachable,
        io::ErrorKind::Unsupported => ReplyCode::AddressNotSupported,
        _ => ReplyCode::ServerFailure,
    }
}
