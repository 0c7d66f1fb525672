use std::net::IpAddr;

#[derive(thiserror::Error, Debug)]
pub enum PortError {
    #[error("portNumber is required")]
    MissingPortNumber,
    #[error("invalid port number: {0}")]
    InvalidPortNumber(String),
    #[error("forwarding to {0} is forbidden")]
    ForwardingForbidden(IpAddr),
    #[error("failed to resolve {host}: {source}")]
    ResolveFailed {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to connect to {target}: {source}")]
    DialFailed {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid session properties: {0}")]
    InvalidProperties(#[from] serde_json::Error),
    #[error("multiplexer: {0}")]
    Mux(#[from] crate::mux::MuxError),
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
}
