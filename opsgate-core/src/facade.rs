//! Capability interfaces for the collaborators the session core consumes
//! but does not implement.

use std::net::IpAddr;

use async_trait::async_trait;
use opsgate_common::Secret;

use crate::transport::TransportError;

/// Control-plane operations needed by the data plane: minting a fresh
/// channel token for connect and reconnect.
#[async_trait]
pub trait ControlPlaneFacade: Send + Sync {
    async fn create_data_channel(
        &self,
        session_id: &str,
        request_id: &str,
        client_id: &str,
    ) -> Result<Secret<String>, TransportError>;
}

/// Host identity as known to the control plane.
pub trait IdentityFacade: Send + Sync {
    fn instance_id(&self) -> String;
    fn region(&self) -> String;

    /// Resolver addresses that port sessions must never forward to.
    fn denied_resolver_addresses(&self) -> Vec<IpAddr> {
        vec![]
    }
}
