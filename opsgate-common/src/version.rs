use std::fmt;
use std::str::FromStr;

pub fn opsgate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Dotted numeric version reported by the remote client during the
/// handshake, e.g. `1.2.331.0`. Comparison is component-wise; missing
/// trailing components count as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientVersion([u32; 4]);

/// First client version that understands multiplexed port forwarding.
pub const MUX_SUPPORTED_SINCE: ClientVersion = ClientVersion([1, 1, 70, 0]);

/// Clients newer than this drive the multiplexer keep-alive themselves.
pub const CLIENT_OWNS_KEEPALIVE_AFTER: ClientVersion = ClientVersion([1, 2, 331, 0]);

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
#[error("invalid client version: {0}")]
pub struct ClientVersionParseError(pub String);

impl FromStr for ClientVersion {
    type Err = ClientVersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut components = [0u32; 4];
        let parts: Vec<&str> = s.split('.').collect();
        if parts.is_empty() || parts.len() > 4 {
            return Err(ClientVersionParseError(s.to_owned()));
        }
        for (slot, part) in components.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| ClientVersionParseError(s.to_owned()))?;
        }
        Ok(ClientVersion(components))
    }
}

impl fmt::Display for ClientVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}
