use std::net::SocketAddr;

/// Errors that can occur in the network layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Binding the listening socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The I/O runtime could not be built.
    #[error("failed to start network runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The connection was closed.
    #[error("connection to {0} closed")]
    ConnectionClosed(SocketAddr),

    /// Nothing arrived before the deadline.
    #[error("timed out waiting for data")]
    Timeout,
}
