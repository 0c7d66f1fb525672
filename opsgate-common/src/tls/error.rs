#[derive(thiserror::Error, Debug)]
pub enum RustlsSetupError {
    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("no certificates found in certificate file")]
    NoCertificates,
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    InsecureBundle(#[from] crate::OpsgateError),
}
