use std::net::IpAddr;

use ipnet::IpNet;
use tracing::*;

use crate::error::PortError;

/// Checks a forwarding destination before anything is dialed. An unset
/// host means the local loopback default and is always allowed; an
/// explicit host must not resolve to a denied address (configured
/// deny-list, resolver addresses, loopback).
pub async fn validate_destination(
    host: &str,
    port: &str,
    denied_networks: &[IpNet],
    denied_addresses: &[IpAddr],
) -> Result<(), PortError> {
    if port.is_empty() {
        return Err(PortError::MissingPortNumber);
    }
    let port: u16 = port
        .parse()
        .map_err(|_| PortError::InvalidPortNumber(port.to_owned()))?;

    if host.is_empty() {
        return Ok(());
    }

    let resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| PortError::ResolveFailed {
            host: host.to_owned(),
            source,
        })?;

    for addr in resolved {
        let ip = addr.ip();
        let denied = ip.is_loopback()
            || denied_addresses.contains(&ip)
            || denied_networks.iter().any(|net| net.contains(&ip));
        if denied {
            warn!(%host, %ip, "Destination is deny-listed");
            return Err(PortError::ForwardingForbidden(ip));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_port_is_rejected() {
        assert!(matches!(
            validate_destination("", "", &[], &[]).await,
            Err(PortError::MissingPortNumber)
        ));
    }

    #[tokio::test]
    async fn test_default_host_skips_resolution() {
        assert!(validate_destination("", "22", &[], &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_metadata_endpoint_is_forbidden() {
        let denied: IpNet = "169.254.169.254/32".parse().unwrap();
        let result = validate_destination("169.254.169.254", "80", &[denied], &[]).await;
        assert!(matches!(result, Err(PortError::ForwardingForbidden(_))));
    }

    #[tokio::test]
    async fn test_explicit_loopback_host_is_forbidden() {
        let result = validate_destination("127.0.0.1", "8080", &[], &[]).await;
        assert!(matches!(result, Err(PortError::ForwardingForbidden(_))));
    }

    #[tokio::test]
    async fn test_resolver_addresses_are_forbidden() {
        let resolver: IpAddr = "10.0.0.2".parse().unwrap();
        let result = validate_destination("10.0.0.2", "53", &[], &[resolver]).await;
        assert!(matches!(result, Err(PortError::ForwardingForbidden(_))));
    }

    #[tokio::test]
    async fn test_garbage_port_is_rejected() {
        assert!(matches!(
            validate_destination("example.com", "http", &[], &[]).await,
            Err(PortError::InvalidPortNumber(_))
        ));
    }
}
