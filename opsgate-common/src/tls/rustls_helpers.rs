use std::path::Path;
use std::sync::Arc;

use rustls::ClientConfig;

use super::{RustlsSetupError, ROOT_CERT_STORE};
use crate::helpers::fs::validate_trust_anchor;

/// Builds a TLS client config trusting the system roots plus an optional
/// custom PEM bundle. The bundle file must pass the trust-anchor
/// permission checks before it is read.
pub fn configure_tls_connector(
    custom_bundle: Option<&Path>,
) -> Result<Arc<ClientConfig>, RustlsSetupError> {
    let mut cert_store = ROOT_CERT_STORE.clone();

    if let Some(path) = custom_bundle {
        validate_trust_anchor(path)?;

        let data = std::fs::read(path)?;
        let mut cursor = std::io::Cursor::new(data);
        let mut added = 0;
        for cert in rustls_pemfile::certs(&mut cursor) {
            cert_store.add(cert?)?;
            added += 1;
        }
        if added == 0 {
            return Err(RustlsSetupError::NoCertificates);
        }
    }

    let config = ClientConfig::builder()
        .with_root_certificates(cert_store)
        .with_no_client_auth();

    Ok(Arc::new(config))
}
