//! Ingest side: TCP receiver for PBX CDR streams.
//!
//! - [`Receiver`] binds the ingest port and spawns one [`Connection`]
//!   handler per PBX
//! - [`CdrLineCodec`] frames the byte stream into lines
//! - every line is published to inputQ as a [`LineMessage`]

mod codec;
mod connection;
mod receiver;

pub use codec::{CdrLineCodec, CodecError};
pub use connection::{Connection, ConnectionId};
pub use receiver::{Receiver, ReceiverState};

use std::io;

use tokio::net::TcpListener;
use tracing::debug;

/// Wildcard prefix the `:port` shorthand expands to.
const ANY_V6: &str = "[::]:";

/// Bind a TCP listener. The dual-stack wildcard falls back to `0.0.0.0`
/// on hosts without IPv6.
pub async fn bind_tcp(address: &str) -> io::Result<TcpListener> {
    match TcpListener::bind(address).await {
        Ok(listener) => Ok(listener),
        Err(e) => match address.strip_prefix(ANY_V6) {
            Some(port) => {
                debug!(address, error = %e, "IPv6 wildcard unavailable, binding IPv4");
                TcpListener::bind(format!("0.0.0.0:{port}")).await
            }
            None => Err(e),
        },
    }
}

/// One line bound to the PBX that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMessage {
    /// Host part of the peer address
    pub source: String,
    pub payload: String,
}

impl LineMessage {
    pub fn new(source: &str, payload: String) -> Self {
        Self {
            source: source.to_string(),
            payload,
        }
    }
}
