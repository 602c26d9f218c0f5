//! UDP ASSOCIATE handler
//!
//! Each association ties a client control stream to a server-side UDP
//! socket. Uplink datagrams (routed here by association id) are unwrapped
//! and forwarded to their target; downlink datagrams are wrapped in SOCKS 6
//! UDP messages and pushed back along the client's reply path. Filtering is
//! optionally address dependent; mapping is always endpoint independent,
//! one socket per association.

use super::connect::reply_code_from_io;
use super::{DatagramReply, IcmpFeedback, ServerWorker, SocksConn};
use crate::helper::MAX_UDP_PACKET;
use crate::message::{OperationReply, ReplyCode, SocksAddr, UdpMessage, UdpMessageType};
use crate::outbound;
use bytes::Bytes;
use rand::Rng;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
struct DownlinkPath {
    reply: Arc<dyn DatagramReply>,
    client_source: SocketAddr,
}

/// One live UDP association
pub(crate) struct UdpAssociation {
    id: u64,
    udp: Arc<UdpSocket>,
    pair: String,
    icmp_on: bool,
    adf: bool,
    alive: AtomicBool,
    cancel: CancellationToken,
    downlink: RwLock<Option<DownlinkPath>>,
    remote_peers: RwLock<HashSet<SocketAddr>>,
}

impl UdpAssociation {
    pub(crate) fn new(
        id: u64,
        udp: UdpSocket,
        pair: String,
        icmp_on: bool,
        adf: bool,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(UdpAssociation {
            id,
            udp: Arc::new(udp),
            pair,
            icmp_on,
            adf,
            alive: AtomicBool::new(true),
            cancel,
            downlink: RwLock::new(None),
            remote_peers: RwLock::new(HashSet::new()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn pair(&self) -> &str {
        &self.pair
    }

    pub(crate) fn icmp_enabled(&self) -> bool {
        self.icmp_on
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.udp.local_addr().ok()
    }

    /// Read and reset the alive flag; the reaper's two-phase eviction
    pub(crate) fn check_and_clear_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }

    /// Stop the pumps; the UDP socket closes when the last handle drops
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Process one uplink message from the client
    pub(crate) async fn handle_udp_up(
        &self,
        msg: UdpMessage,
        source: SocketAddr,
        reply: Arc<dyn DatagramReply>,
    ) {
        if msg.association_id != self.id {
            warn!(id = self.id, got = msg.association_id, "association id mismatch");
            return;
        }
        self.alive.store(true, Ordering::Relaxed);

        // First valid datagram pins the client source and the reply path;
        // later datagrams from elsewhere are spoofed and dropped.
        {
            let mut downlink = self.downlink.write().await;
            match downlink.as_ref() {
                None => {
                    *downlink = Some(DownlinkPath {
                        reply,
                        client_source: source,
                    });
                }
                Some(path) if path.client_source != source => {
                    debug!(id = self.id, %source, "uplink datagram from foreign source");
                    return;
                }
                Some(_) => {}
            }
        }

        match msg.message_type {
            UdpMessageType::Datagram => {}
            UdpMessageType::AssociationAck => {
                trace!(id = self.id, "association acknowledged");
                return;
            }
            other => {
                debug!(id = self.id, ?other, "unexpected uplink message type");
                return;
            }
        }

        let target = match msg.endpoint.to_socket_addr() {
            Some(addr) => addr,
            None => match outbound::resolve(&msg.endpoint).await {
                Ok(addr) => addr,
                Err(e) => {
                    debug!(id = self.id, endpoint = %msg.endpoint, error = %e, "can't resolve datagram target");
                    return;
                }
            },
        };

        self.remote_peers.write().await.insert(target);
        if let Err(e) = self.udp.send_to(&msg.payload, target).await {
            debug!(id = self.id, %target, error = %e, "uplink send failed");
        } else {
            trace!(id = self.id, %target, bytes = msg.payload.len(), "uplink forwarded");
        }
    }

    /// Pump datagrams from the association socket back to the client
    pub(crate) async fn run_downlink(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            let (n, from) = tokio::select! {
                _ = self.cancel.cancelled() => return,
                received = self.udp.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        debug!(id = self.id, error = %e, "downlink socket error");
                        return;
                    }
                }
            };
            self.alive.store(true, Ordering::Relaxed);

            if self.adf && !self.remote_peers.read().await.contains(&from) {
                debug!(id = self.id, %from, "downlink datagram filtered");
                continue;
            }

            let path = match self.downlink.read().await.clone() {
                Some(path) => path,
                // client has not sent anything yet, nowhere to deliver
                None => continue,
            };
            let msg = UdpMessage::datagram(
                self.id,
                SocksAddr::from(from),
                Bytes::copy_from_slice(&buf[..n]),
            );
            if let Err(e) = path.reply.reply(msg.marshal()).await {
                debug!(id = self.id, error = %e, "downlink reply failed");
            }
        }
    }

    /// Push an ICMP-derived error message to the client
    pub(crate) async fn handle_icmp_down(&self, feedback: &IcmpFeedback) {
        let path = match self.downlink.read().await.clone() {
            Some(path) => path,
            None => return,
        };
        let msg = UdpMessage::error(
            self.id,
            SocksAddr::from(feedback.destination),
            feedback.code,
            feedback.reporter.clone(),
        );
        debug!(id = self.id, code = ?feedback.code, "icmp error delivered");
        if let Err(e) = path.reply.reply(msg.marshal()).await {
            debug!(id = self.id, error = %e, "icmp reply failed");
        }
    }
}

impl ServerWorker {
    pub(super) async fn udp_associate_handler(&self, cancel: CancellationToken, mut cc: SocksConn) {
        // fresh 64-bit id, re-rolled on collision
        let id = loop {
            let candidate: u64 = rand::thread_rng().gen();
            if !self
                .maps
                .udp_associations
                .read()
                .await
                .contains_key(&candidate)
            {
                break candidate;
            }
        };

        let options = cc.request.options.stack_options();
        let (socket, _negotiated) = match self
            .outbound
            .listen_packet(options, &cc.request.endpoint)
            .await
        {
            Ok(bound) => bound,
            Err(e) => {
                info!(peer = %cc.peer, target = %cc.request.endpoint, error = %e, "udp bind failed");
                let reply = OperationReply::with_code(reply_code_from_io(&e));
                let _ = cc.stream.write_all(&reply.marshal()).await;
                return;
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(peer = %cc.peer, error = %e, "udp socket has no local address");
                let reply = OperationReply::with_code(ReplyCode::ServerFailure);
                let _ = cc.stream.write_all(&reply.marshal()).await;
                return;
            }
        };

        let pair = format!("{}|{}", local_addr, cc.peer);
        let assoc = UdpAssociation::new(
            id,
            socket,
            pair,
            self.enable_icmp,
            self.address_dependent_filtering,
            cancel.child_token(),
        );
        self.maps.insert_association(assoc.clone()).await;
        tokio::spawn(assoc.clone().run_downlink());

        let mut reply = OperationReply::success(SocksAddr::from(local_addr));
        reply.options.add_association_id(id);
        let init = UdpMessage::association_init(id);
        let announce = async {
            cc.stream.write_all(&reply.marshal()).await?;
            cc.stream.write_all(&init.marshal()).await
        };
        if let Err(e) = announce.await {
            warn!(peer = %cc.peer, error = %e, "can't announce association");
            assoc.shutdown();
            self.maps.remove_association(id).await;
            return;
        }

        info!(peer = %cc.peer, id, bound = %local_addr, "udp association established");

        // Control stream watcher: the association lives exactly as long as
        // the control stream.
        let mut probe = [0u8; 64];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = cc.stream.read(&mut probe) => match read {
                    Ok(0) => {
                        debug!(id, "control stream closed");
                        break;
                    }
                    Ok(_) => trace!(id, "data on control stream ignored"),
                    Err(e) => {
                        debug!(id, error = %e, "control stream error");
                        break;
                    }
                }
            }
        }

        assoc.shutdown();
        self.maps.remove_association(id).await;
        debug!(id, "udp association torn down");
    }
}
