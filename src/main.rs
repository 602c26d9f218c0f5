//! socksix server binary
//!
//! Binds the TCP and UDP listeners, wires signals into the cancellation
//! token, and hands every accepted connection to the server worker.

use anyhow::Result;
use bytes::Bytes;
use clap::Parser;
use socksix::auth::{Authenticator, PasswordMethod};
use socksix::config::{load_config, ServerConfig};
use socksix::server::{InboundDatagram, SendToReply, ServerWorker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

/// socksix - SOCKS 6 proxy server
#[derive(Parser, Debug)]
#[command(name = "socksix")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level, args.json_log);

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    config.validate()?;

    info!("socksix v{}", socksix::VERSION);
    if let Some(path) = &args.config {
        info!("Configuration loaded from: {:?}", path);
    }

    let worker = Arc::new(build_worker(&config));
    let cancel = CancellationToken::new();

    // Ctrl+C and SIGTERM cancel the root token (cross-platform)
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm =
                    signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down...");
            }
            cancel.cancel();
        });
    }

    // resource reaper
    {
        let worker = worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { worker.clear_unused_resource(cancel).await });
    }

    // UDP datagram loop
    if let Some(udp_listen) = &config.udp_listen {
        let socket = Arc::new(UdpSocket::bind(udp_listen).await?);
        info!(listen = %socket.local_addr()?, "socksix UDP listening");
        let worker = worker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { udp_loop(worker, socket, cancel).await });
    }

    // TCP accept loop
    let listener = TcpListener::bind(&config.listen).await?;
    info!(listen = %listener.local_addr()?, "socksix listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let worker = worker.clone();
                    let child = cancel.child_token();
                    tokio::spawn(async move { worker.serve_stream(child, stream, peer).await });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    info!("socksix stopped");
    Ok(())
}

fn build_worker(config: &ServerConfig) -> ServerWorker {
    let mut worker = ServerWorker::new();

    if let (Some(username), Some(password)) = (&config.auth.username, &config.auth.password) {
        let mut auth = if config.auth.required {
            Authenticator::empty()
        } else {
            Authenticator::new()
        };
        auth.add_method(Arc::new(PasswordMethod::new(
            username.clone(),
            password.clone(),
        )));
        worker.authenticator = Arc::new(auth);
    }

    worker.address_dependent_filtering = config.address_dependent_filtering;
    worker.ignore_fragmented_request = config.ignore_fragmented_request;
    worker.enable_icmp = config.enable_icmp;
    worker.relay_idle_timeout = Duration::from_secs(config.relay_idle_timeout_secs);
    worker.bind_accept_timeout = Duration::from_secs(config.bind_accept_timeout_secs);
    worker
}

async fn udp_loop(worker: Arc<ServerWorker>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 65535];
    loop {
        let (n, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "UDP receive failed");
                    continue;
                }
            }
        };
        let dgram = InboundDatagram {
            data: Bytes::copy_from_slice(&buf[..n]),
            source: peer,
            reply: Arc::new(SendToReply::new(socket.clone(), peer)),
        };
        worker.serve_datagram(dgram).await;
    }
}

fn setup_logging(log_level: &str, json_log: bool) {
    let level: Level = log_level.parse().unwrap_or(Level::INFO);
    if json_log {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}
