mod error;
mod rustls_helpers;
mod rustls_root_certs;

pub use error::RustlsSetupError;
pub use rustls_helpers::configure_tls_connector;
pub use rustls_root_certs::ROOT_CERT_STORE;
