//! # socksix - SOCKS 6 proxy server
//!
//! socksix implements the server side of SOCKS version 6: the binary wire
//! protocol with nested options and two-stage authentication, the CONNECT,
//! BIND, UDP ASSOCIATE and NOOP commands, a deadline-driven byte relay, and
//! UDP associations with NAT-filter control and ICMP error feedback.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksix::server::ServerWorker;
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let worker = Arc::new(ServerWorker::new());
//!     let cancel = CancellationToken::new();
//!     let listener = TcpListener::bind("0.0.0.0:1080").await?;
//!     loop {
//!         let (stream, peer) = listener.accept().await?;
//!         let worker = worker.clone();
//!         let child = cancel.child_token();
//!         tokio::spawn(async move { worker.serve_stream(child, stream, peer).await });
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! An accepted stream passes through the handshake driver (request parse,
//! authentication, rule check) and is then owned by exactly one command
//! handler. Datagrams are routed into UDP associations by association id;
//! ICMP errors observed out of band are fanned out to the matching
//! associations. A reaper task evicts idle state.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod auth;
pub mod config;
pub mod error;
pub mod helper;
pub mod message;
pub mod outbound;
pub mod relay;
pub mod server;

// Re-export commonly used items
pub use config::{load_config, ServerConfig};
pub use error::{MessageError, SocksixError};
pub use server::ServerWorker;

/// Version of the socksix library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
