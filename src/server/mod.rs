//! SOCKS 6 server worker
//!
//! [`ServerWorker`] owns the per-connection handshake (request parse,
//! authentication, rule check) and dispatches to the command handlers in the
//! submodules. It also routes datagrams into UDP associations, fans ICMP
//! errors out to them, and reaps idle state.

mod bind;
mod connect;
mod icmp;
mod udp;

pub use icmp::IcmpFeedback;

use crate::auth::{AuthResult, Authenticator, ServerAuthenticator};
use crate::error::MessageError;
use crate::helper::{
    AsyncStream, BoxedStream, BufferedStream, DEFAULT_BIND_ACCEPT_TIMEOUT_SECS,
    DEFAULT_RELAY_IDLE_TIMEOUT_SECS,
};
use crate::message::{
    AuthReplyType, AuthenticationReply, CommandCode, OperationReply, ReplyCode, Request, SocksAddr,
    UdpMessage,
};
use crate::outbound::{InternetOutbound, ServerOutbound};
use async_trait::async_trait;
use bind::BacklogBindWorker;
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use udp::UdpAssociation;

/// Predicate deciding whether a parsed, authenticated request may proceed
pub type RuleFn = Box<dyn Fn(&SocksConn) -> bool + Send + Sync>;

/// How many bytes of the first packet are considered when the fragment
/// policy is active
const FIRST_PACKET_LIMIT: usize = 4096;

/// Per-connection state handed to exactly one command handler.
///
/// The handler owns the stream from the moment the handshake driver returns
/// it; dropping the `SocksConn` closes the connection.
pub struct SocksConn {
    /// Client stream, positioned after the request and initial data
    pub stream: BoxedStream,
    /// The parsed request
    pub request: Request,
    /// Authenticated client name, empty for anonymous sessions
    pub client_id: String,
    /// Session the connection belongs to
    pub session: Vec<u8>,
    /// Application bytes piggybacked on the request
    pub initial_data: Vec<u8>,
    /// Stream id when the connection is a multiplexed channel
    pub stream_id: Option<u32>,
    /// Remote address, for logging
    pub peer: SocketAddr,
}

/// Reply path for a datagram source: plain UDP sendto, or a write on a
/// multiplexed session
#[async_trait]
pub trait DatagramReply: Send + Sync {
    /// Deliver `data` back to the datagram's origin
    async fn reply(&self, data: Bytes) -> io::Result<()>;
}

/// A datagram received from a client along with its reply path
pub struct InboundDatagram {
    /// Raw datagram bytes
    pub data: Bytes,
    /// Source address of the datagram
    pub source: SocketAddr,
    /// How to answer the sender
    pub reply: Arc<dyn DatagramReply>,
}

/// Ordered datagram source, e.g. the datagram half of a multiplexed session
#[async_trait]
pub trait SeqPacketSource: Send {
    /// Next datagram, or the error that ended the source
    async fn next_datagram(&mut self) -> io::Result<InboundDatagram>;
}

/// A connection carrying multiple SOCKS 6 streams over one transport
#[async_trait]
pub trait MultiplexedConn: Send + Sync {
    /// Accept the next stream on the session
    async fn accept_stream(&self) -> io::Result<(BoxedStream, SocketAddr)>;
}

/// Handler for streams that turned out not to be SOCKS 6.
///
/// The handler owns the stream and is expected to close it.
#[async_trait]
pub trait StreamVersionMismatchHandler: Send + Sync {
    /// Answer the foreign protocol identified by its first byte
    async fn handle(&self, version: u8, consumed: &[u8], stream: BoxedStream);
}

/// Handler for datagrams that turned out not to be SOCKS 6
#[async_trait]
pub trait DatagramVersionMismatchHandler: Send + Sync {
    /// Answer or drop the foreign datagram
    async fn handle(&self, version: u8, dgram: InboundDatagram);
}

/// [`DatagramReply`] that answers with `send_to` on a shared UDP socket
pub struct SendToReply {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl SendToReply {
    /// Reply path answering `peer` through `socket`
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr) -> Self {
        SendToReply { socket, peer }
    }
}

#[async_trait]
impl DatagramReply for SendToReply {
    async fn reply(&self, data: Bytes) -> io::Result<()> {
        self.socket.send_to(&data, self.peer).await.map(|_| ())
    }
}

const NOT_HTTP_PROXY_MSG: &str = "This is a SOCKS 6 proxy, not a HTTP proxy";

fn http_document() -> String {
    [
        "<!DOCTYPE html>",
        "<html><head>",
        "<title>500 Internal Server Error</title>",
        "</head><body>",
        "<h1>500 Internal Server Error</h1>",
        &format!("<p>{}</p>", NOT_HTTP_PROXY_MSG),
        "</body></html>",
    ]
    .join("\r\n")
}

/// Full HTTP/1.0 500 reply served to clients that speak HTTP at us
pub fn http_reply() -> String {
    let doc = http_document();
    [
        "HTTP/1.0 500 Internal Server Error".to_string(),
        format!(
            "Proxy-Status: socksix; error=proxy_configuration_error; details=\"{}\"",
            NOT_HTTP_PROXY_MSG
        ),
        "Content-Type: text/html".to_string(),
        format!("Content-Length: {}", doc.len()),
        "Connection: close".to_string(),
        String::new(),
        doc,
    ]
    .join("\r\n")
}

/// Default stream version-mismatch handler.
///
/// Guesses which protocol the client is speaking from the first byte and
/// replies with that protocol's idea of "no": a SOCKS4 reject, a SOCKS5
/// no-acceptable-method, an HTTP 500 page for anything that looks like an
/// HTTP verb, or a bare version echo otherwise. Closes the stream.
pub struct VersionReplier;

#[async_trait]
impl StreamVersionMismatchHandler for VersionReplier {
    async fn handle(&self, version: u8, _consumed: &[u8], mut stream: BoxedStream) {
        let reply: Vec<u8> = match version {
            // header v0, reply 91
            4 => vec![0, 91],
            // no method allowed
            5 => vec![5, 0xFF],
            6 => vec![6],
            b'c' | b'C' | b'd' | b'D' | b'g' | b'G' | b'h' | b'H' | b'o' | b'O' | b'p' | b'P'
            | b't' | b'T' => http_reply().into_bytes(),
            _ => vec![6],
        };
        let _ = stream.write_all(&reply).await;
        let _ = stream.flush().await;
        let _ = stream.shutdown().await;
    }
}

/// The three concurrent maps shared between handlers, datagram routing and
/// the reaper. Associations and their reservations are always mutated as a
/// pair, under both locks, in a fixed order.
pub(crate) struct SharedMaps {
    pub(crate) backlog_workers: RwLock<HashMap<String, Arc<BacklogBindWorker>>>,
    pub(crate) reserved_udp_addrs: RwLock<HashMap<String, u64>>,
    pub(crate) udp_associations: RwLock<HashMap<u64, Arc<UdpAssociation>>>,
}

impl SharedMaps {
    fn new() -> Self {
        SharedMaps {
            backlog_workers: RwLock::new(HashMap::new()),
            reserved_udp_addrs: RwLock::new(HashMap::new()),
            udp_associations: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn insert_association(&self, assoc: Arc<UdpAssociation>) {
        let mut assocs = self.udp_associations.write().await;
        let mut reserved = self.reserved_udp_addrs.write().await;
        reserved.insert(assoc.pair().to_string(), assoc.id());
        assocs.insert(assoc.id(), assoc);
    }

    pub(crate) async fn remove_association(&self, id: u64) -> Option<Arc<UdpAssociation>> {
        let mut assocs = self.udp_associations.write().await;
        let mut reserved = self.reserved_udp_addrs.write().await;
        let assoc = assocs.remove(&id)?;
        reserved.remove(assoc.pair());
        Some(assoc)
    }
}

/// A customizable SOCKS 6 server worker
pub struct ServerWorker {
    /// Authenticator driving the first handshake stage
    pub authenticator: Arc<dyn ServerAuthenticator>,
    /// Optional request admission rule
    pub rule: Option<RuleFn>,
    /// Network provider used by the command handlers
    pub outbound: Arc<dyn ServerOutbound>,
    /// Handler for non-SOCKS6 streams
    pub version_mismatch_handler: Arc<dyn StreamVersionMismatchHandler>,
    /// Handler for non-SOCKS6 datagrams
    pub datagram_version_mismatch_handler: Option<Arc<dyn DatagramVersionMismatchHandler>>,
    /// Drop inbound datagrams from peers the client has not sent to
    /// (Restricted Cone). Mapping is always endpoint independent.
    pub address_dependent_filtering: bool,
    /// Reject requests that do not arrive whole in the first packet of a
    /// secondary multiplexed stream
    pub ignore_fragmented_request: bool,
    /// Relay ICMP errors into UDP associations
    pub enable_icmp: bool,
    /// Idle deadline applied to every relay direction
    pub relay_idle_timeout: Duration,
    /// How long a single-accept BIND waits for its upstream connection
    pub bind_accept_timeout: Duration,

    maps: Arc<SharedMaps>,
}

impl ServerWorker {
    /// A standard worker: anonymous authentication, internet outbound,
    /// protocol-guessing version replies
    pub fn new() -> Self {
        ServerWorker {
            authenticator: Arc::new(Authenticator::new()),
            rule: None,
            outbound: Arc::new(InternetOutbound::default()),
            version_mismatch_handler: Arc::new(VersionReplier),
            datagram_version_mismatch_handler: None,
            address_dependent_filtering: false,
            ignore_fragmented_request: false,
            enable_icmp: false,
            relay_idle_timeout: Duration::from_secs(DEFAULT_RELAY_IDLE_TIMEOUT_SECS),
            bind_accept_timeout: Duration::from_secs(DEFAULT_BIND_ACCEPT_TIMEOUT_SECS),
            maps: Arc::new(SharedMaps::new()),
        }
    }

    /// Process one accepted stream to completion.
    ///
    /// Returns when the connection is done: handshake failure, command
    /// handler completion, or cancellation.
    pub async fn serve_stream<S>(&self, cancel: CancellationToken, stream: S, peer: SocketAddr)
    where
        S: AsyncStream + 'static,
    {
        let (cc, cmd, auth) = self.handshake_stream(stream, peer, None).await;
        let Some(auth) = auth else { return };
        if let Some(cc) = cc {
            self.dispatch(cancel, cmd, cc).await;
        }
        self.authenticator.session_conn_close(&auth.session_id).await;
    }

    /// Run the handshake: parse the request, read initial data,
    /// authenticate, apply the rule, check command support.
    ///
    /// On success the returned [`SocksConn`] owns the stream and must be
    /// consumed by a command handler. Every early exit closes the stream by
    /// dropping it. `prev_auth` short-circuits authentication for secondary
    /// streams of an already-authenticated multiplexed session.
    pub async fn handshake_stream<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        prev_auth: Option<AuthResult>,
    ) -> (Option<SocksConn>, CommandCode, Option<AuthResult>)
    where
        S: AsyncStream + 'static,
    {
        let mut stream = stream;
        trace!(%peer, "start processing");

        // Fragment policy only applies to secondary mux streams; the
        // request must parse out of one network packet.
        let strict = self.ignore_fragmented_request && prev_auth.is_some();
        let (req, leftover) = if strict {
            debug!(%peer, "ignore fragmented request");
            let mut first = vec![0u8; FIRST_PACKET_LIMIT];
            let n = match stream.read(&mut first).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(%peer, error = %e, "can't read request");
                    return (None, CommandCode::Other(0), None);
                }
            };
            first.truncate(n);
            let mut cursor = std::io::Cursor::new(first.as_slice());
            match Request::read_from(&mut cursor).await {
                Ok(req) => {
                    let consumed = cursor.position() as usize;
                    (req, Bytes::copy_from_slice(&first[consumed..]))
                }
                Err(e) => {
                    self.handle_request_error(Box::new(stream), peer, e).await;
                    return (None, CommandCode::Other(0), None);
                }
            }
        } else {
            match Request::read_from(&mut stream).await {
                Ok(req) => (req, Bytes::new()),
                Err(e) => {
                    self.handle_request_error(Box::new(stream), peer, e).await;
                    return (None, CommandCode::Other(0), None);
                }
            }
        };

        trace!(%peer, command = %req.command, endpoint = %req.endpoint, "requested");
        let cmd = req.command;
        let mut stream: BoxedStream = Box::new(BufferedStream::new(leftover, stream));

        let mut initial_data = Vec::new();
        if let Some(adv) = req.options.method_advertisement() {
            let len = adv.initial_data_length as usize;
            if len > 0 {
                initial_data = vec![0u8; len];
                if let Err(e) = stream.read_exact(&mut initial_data).await {
                    warn!(%peer, bytes = len, error = %e, "can't read initial data");
                    return (None, cmd, None);
                }
            }
        }

        let auth = match prev_auth {
            Some(prev) => {
                debug!(%peer, "authn skipped");
                prev
            }
            None => match self.authn(&mut stream, &req, peer).await {
                None => return (None, cmd, None),
                Some(result) if !result.success => {
                    info!(%peer, "authenticate fail");
                    return (None, cmd, None);
                }
                Some(result) => {
                    trace!(%peer, "authenticate success");
                    result
                }
            },
        };

        let stream_id = req.options.stream_id();
        let cc = SocksConn {
            stream,
            request: req,
            client_id: auth.client_name.clone(),
            session: auth.session_id.clone(),
            initial_data,
            stream_id,
            peer,
        };

        if let Some(rule) = &self.rule {
            if !rule(&cc) {
                info!(%peer, "not allowed by rule");
                let mut cc = cc;
                let reply = OperationReply::with_code(ReplyCode::NotAllowedByRule);
                let _ = cc.stream.write_all(&reply.marshal()).await;
                return (None, cmd, Some(auth));
            }
        }

        if let CommandCode::Other(code) = cmd {
            warn!(%peer, command = code, "command not supported");
            let mut cc = cc;
            let reply = OperationReply::with_code(ReplyCode::CommandNotSupported);
            let _ = cc.stream.write_all(&reply.marshal()).await;
            return (None, cmd, Some(auth));
        }

        trace!(%peer, command = %cmd, "start command specific process");
        // From here the command handler owns the stream.
        (Some(cc), cmd, Some(auth))
    }

    async fn handle_request_error(&self, stream: BoxedStream, peer: SocketAddr, err: MessageError) {
        match err {
            MessageError::VersionMismatch { version, consumed } => {
                self.version_mismatch_handler
                    .handle(version, &consumed, stream)
                    .await;
            }
            // Without a parsable address there is no message boundary left
            // to authenticate on; fire both replies and give up.
            MessageError::AddressNotSupported(atyp) => {
                debug!(%peer, atyp, "address type not supported, fire and forget error reply");
                let mut stream = stream;
                let fail = AuthenticationReply::new(AuthReplyType::Fail);
                let _ = stream.write_all(&fail.marshal()).await;
                let reply = OperationReply::with_code(ReplyCode::AddressNotSupported);
                let _ = stream.write_all(&reply.marshal()).await;
            }
            other => {
                warn!(%peer, error = %other, "can't parse request");
            }
        }
    }

    async fn authn(
        &self,
        stream: &mut BoxedStream,
        req: &Request,
        peer: SocketAddr,
    ) -> Option<AuthResult> {
        let (result1, continuation) = self.authenticator.authenticate(stream.as_mut(), req).await;

        if result1.success {
            // one stage auth, success
            let mut reply = AuthenticationReply::new(AuthReplyType::Success);
            set_auth_method_info(&mut reply, &result1);
            debug!(%peer, method = result1.selected_method, "authenticate ok");
            if let Err(e) = stream.write_all(&reply.marshal()).await {
                warn!(%peer, error = %e, "can't write auth reply");
                return None;
            }
            Some(result1)
        } else if !result1.continue_required {
            // one stage auth, can't continue
            let reply = AuthenticationReply::new(AuthReplyType::Fail);
            if let Err(e) = stream.write_all(&reply.marshal()).await {
                warn!(%peer, error = %e, "can't write reply");
                return None;
            }
            Some(result1)
        } else {
            // two stage auth
            let mut reply1 = AuthenticationReply::new(AuthReplyType::Fail);
            set_auth_method_info(&mut reply1, &result1);
            if let Err(e) = stream.write_all(&reply1.marshal()).await {
                warn!(%peer, error = %e, "can't write auth reply 1");
                return None;
            }
            debug!(%peer, "auth stage 2");

            let Some(continuation) = continuation else {
                warn!(%peer, "two stage result without continuation");
                return None;
            };
            match self
                .authenticator
                .continue_authenticate(continuation, req)
                .await
            {
                Err(e) => {
                    warn!(%peer, error = %e, "auth stage 2 error");
                    let reply = AuthenticationReply::new(AuthReplyType::Fail);
                    let _ = stream.write_all(&reply.marshal()).await;
                    None
                }
                Ok(result2) => {
                    let mut reply = AuthenticationReply::new(if result2.success {
                        AuthReplyType::Success
                    } else {
                        AuthReplyType::Fail
                    });
                    set_auth_method_info(&mut reply, &result2);
                    debug!(%peer, success = result2.success, "auth stage 2 done");
                    if let Err(e) = stream.write_all(&reply.marshal()).await {
                        warn!(%peer, error = %e, "can't write auth reply 2");
                        return None;
                    }
                    Some(result2)
                }
            }
        }
    }

    async fn dispatch(&self, cancel: CancellationToken, cmd: CommandCode, cc: SocksConn) {
        match cmd {
            CommandCode::Noop => self.noop_handler(cc).await,
            CommandCode::Connect => self.connect_handler(cancel, cc).await,
            CommandCode::Bind => self.bind_handler(cancel, cc).await,
            CommandCode::UdpAssociate => self.udp_associate_handler(cancel, cc).await,
            // filtered out by the handshake
            CommandCode::Other(_) => {}
        }
    }

    async fn noop_handler(&self, mut cc: SocksConn) {
        let reply = OperationReply::success(SocksAddr::unspecified());
        let _ = cc.stream.write_all(&reply.marshal()).await;
        debug!(peer = %cc.peer, "noop served");
    }

    /// Route one datagram into its association
    pub async fn serve_datagram(&self, dgram: InboundDatagram) {
        let source = dgram.source;
        let reply = dgram.reply.clone();

        let msg = match UdpMessage::parse(&dgram.data) {
            Ok(msg) => msg,
            Err(MessageError::VersionMismatch { version, .. }) => {
                if let Some(handler) = &self.datagram_version_mismatch_handler {
                    handler.handle(version, dgram).await;
                }
                return;
            }
            Err(e) => {
                warn!(%source, error = %e, "can't parse UDP message");
                return;
            }
        };

        let assoc = {
            let assocs = self.maps.udp_associations.read().await;
            assocs.get(&msg.association_id).cloned()
        };
        match assoc {
            Some(assoc) => assoc.handle_udp_up(msg, source, reply).await,
            None => debug!(%source, id = msg.association_id, "datagram for unknown association"),
        }
    }

    /// Drain a sequential datagram source, routing every datagram
    pub async fn serve_seq_packet<P: SeqPacketSource>(&self, mut source: P) {
        loop {
            match source.next_datagram().await {
                Ok(dgram) => self.serve_datagram(dgram).await,
                Err(e) => {
                    debug!(error = %e, "seq packet source ended");
                    return;
                }
            }
        }
    }

    /// Serve every stream of a multiplexed session.
    ///
    /// The first stream authenticates normally; its result is reused for
    /// every later stream, which is also where the fragment policy applies.
    pub async fn serve_mux(
        self: Arc<Self>,
        cancel: CancellationToken,
        mux: Arc<dyn MultiplexedConn>,
    ) {
        let Ok((first, peer)) = mux.accept_stream().await else {
            return;
        };
        let (cc0, cmd0, auth0) = self.handshake_stream(first, peer, None).await;
        let Some(auth0) = auth0 else { return };
        if let Some(cc0) = cc0 {
            let worker = self.clone();
            let child = cancel.child_token();
            tokio::spawn(async move { worker.dispatch(child, cmd0, cc0).await });
        }

        loop {
            let Ok((stream, peer)) = mux.accept_stream().await else {
                break;
            };
            let worker = self.clone();
            let child = cancel.child_token();
            let prev = auth0.clone();
            tokio::spawn(async move {
                let (cc, cmd, _) = worker.handshake_stream(stream, peer, Some(prev)).await;
                if let Some(cc) = cc {
                    worker.dispatch(child, cmd, cc).await;
                }
            });
        }

        self.authenticator
            .session_conn_close(&auth0.session_id)
            .await;
    }

    /// Fan an observed ICMP error out to the matching associations
    pub async fn forward_icmp(&self, packet: &[u8], reporter_ip: IpAddr, ip_version: u8) {
        let Some(feedback) = icmp::parse_icmp_feedback(packet, reporter_ip, ip_version) else {
            return;
        };

        let assocs: Vec<Arc<UdpAssociation>> = {
            let map = self.maps.udp_associations.read().await;
            map.values().cloned().collect()
        };
        for assoc in assocs {
            if !assoc.icmp_enabled() {
                continue;
            }
            if assoc.local_addr() != Some(feedback.source) {
                continue;
            }
            assoc.handle_icmp_down(&feedback).await;
        }
    }

    /// Evict dead backlog workers and UDP associations once a minute until
    /// cancelled. Call once per worker.
    pub async fn clear_unused_resource(&self, cancel: CancellationToken) {
        self.clear_unused_resource_with_tick(cancel, Duration::from_secs(60))
            .await
    }

    /// Reaper loop with an explicit tick, for tests
    pub async fn clear_unused_resource_with_tick(&self, cancel: CancellationToken, tick: Duration) {
        let mut timer = tokio::time::interval(tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the immediate first tick would evict fresh entries
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {}
                _ = cancel.cancelled() => return,
            }

            let dead_workers: Vec<String> = {
                let workers = self.maps.backlog_workers.read().await;
                workers
                    .iter()
                    .filter(|(_, w)| !w.check_and_clear_alive())
                    .map(|(key, _)| key.clone())
                    .collect()
            };
            for key in dead_workers {
                if let Some(worker) = self.maps.backlog_workers.write().await.remove(&key) {
                    worker.shutdown();
                    debug!(listener = %key, "evicted idle backlog worker");
                }
            }

            let dead_assocs: Vec<u64> = {
                let assocs = self.maps.udp_associations.read().await;
                assocs
                    .iter()
                    .filter(|(_, a)| !a.check_and_clear_alive())
                    .map(|(id, _)| *id)
                    .collect()
            };
            for id in dead_assocs {
                if let Some(assoc) = self.maps.remove_association(id).await {
                    assoc.shutdown();
                    debug!(id, "evicted idle UDP association");
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn maps(&self) -> &Arc<SharedMaps> {
        &self.maps
    }
}

impl Default for ServerWorker {
    fn default() -> Self {
        ServerWorker::new()
    }
}

fn set_auth_method_info(reply: &mut AuthenticationReply, result: &AuthResult) {
    if result.selected_method != 0 && result.selected_method != 0xFF {
        reply.options.add_method_selection(result.selected_method);
    }
    if let Some(data) = &result.method_data {
        reply
            .options
            .add_auth_data(result.selected_method, data);
    }
}
