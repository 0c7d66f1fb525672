//! Default facade wiring for a standalone worker. The embedding agent
//! replaces these with its real control-plane and KMS clients.

use async_trait::async_trait;
use opsgate_common::Secret;
use opsgate_core::{ControlPlaneFacade, IdentityFacade, TransportError};

/// Hands back the token from the session descriptor. Without a real
/// control-plane client, reconnects reuse the original token.
pub struct StaticControlPlane {
    token: Secret<String>,
}

impl StaticControlPlane {
    pub fn new(token: Secret<String>) -> Self {
        StaticControlPlane { token }
    }
}

#[async_trait]
impl ControlPlaneFacade for StaticControlPlane {
    async fn create_data_channel(
        &self,
        _session_id: &str,
        _request_id: &str,
        _client_id: &str,
    ) -> Result<Secret<String>, TransportError> {
        Ok(self.token.clone())
    }
}

pub struct StaticIdentity {
    pub instance_id: String,
    pub region: String,
}

impl IdentityFacade for StaticIdentity {
    fn instance_id(&self) -> String {
        self.instance_id.clone()
    }

    fn region(&self) -> String {
        self.region.clone()
    }
}
