use std::{io, net::SocketAddr};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("connection queue is full")]
    QueueFull,
    #[error("dial backend {addr} failed: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(io::Error),
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("transporter closed")]
    TransporterClosed,
}
