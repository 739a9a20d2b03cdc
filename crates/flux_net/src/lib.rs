pub mod pipe;
pub mod proxy;
pub mod transport;

use std::io;
use thiserror::Error;

pub use pipe::{DirectionalPipe, PipeEnd, PipeSummary, CHUNK_SIZE};
pub use proxy::{ProxyServer, ServerState};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("could not resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no usable address for {addr}")]
    NoAddress { addr: String },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
}
