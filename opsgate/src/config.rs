use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use opsgate_common::OpsgateConfig;
use tracing::*;

pub fn load_config(path: &Path) -> Result<OpsgateConfig> {
    if path.exists() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting permissions on {path:?}"))?;
    }

    let mut builder = Config::builder();
    if path.exists() {
        builder = builder.add_source(File::from(path));
    } else {
        warn!(?path, "Config file not found, using defaults");
    }
    let config: OpsgateConfig = builder
        .add_source(Environment::with_prefix("OPSGATE").separator("__"))
        .build()?
        .try_deserialize()
        .context("parsing configuration")?;

    info!(?path, "Configuration loaded");
    Ok(config)
}
