use thiserror::Error;

/// Startup-fatal errors (spec §7): bad URL scheme, bind failure. These are
/// the only errors with variants a caller might want to match on; every
/// other failure path in this crate (transient upstream errors, parse
/// errors, session errors) is logged and handled in place, never
/// propagated.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid WebSocket URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    #[error("failed to bind broadcast server on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
