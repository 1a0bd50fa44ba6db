//! Setup-time errors.
//!
//! Only connection setup can fail. Once a connection runs, its loops log anomalies and
//! carry on, so nothing past [`Connection::setup`](crate::Connection::setup) returns these.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("cannot resolve peer address {host}:{port}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("no free UDP port among the {range} ports starting at {base}")]
    Bind {
        base: u16,
        range: u16,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("cannot spawn a receiver thread")]
    Spawn(#[source] std::io::Error),
}
