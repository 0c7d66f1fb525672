use std::path::Path;

use anyhow::{Context, Result};
use opsgate_common::Secret;
use serde::Deserialize;

/// Session handover from the supervising agent process: everything the
/// worker needs to attach to one session's channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub client_id: String,
    pub stream_url: String,
    pub token_value: Secret<String>,
    pub session_type: String,
    #[serde(default)]
    pub kms_key_id: Option<String>,
    #[serde(default)]
    pub properties: serde_json::Value,
}

impl SessionDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading session descriptor {path:?}"))?;
        serde_json::from_slice(&raw).context("parsing session descriptor")
    }
}
