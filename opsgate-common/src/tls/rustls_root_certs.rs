use once_cell::sync::Lazy;
use rustls::RootCertStore;
use tracing::*;

pub static ROOT_CERT_STORE: Lazy<RootCertStore> = Lazy::new(|| {
    let mut store = RootCertStore::empty();
    let result = rustls_native_certs::load_native_certs();
    for error in result.errors {
        warn!(?error, "Failed to load a native certificate");
    }
    for cert in result.certs {
        if let Err(error) = store.add(cert) {
            warn!(?error, "Failed to add a native certificate to the store");
        }
    }
    store
});
