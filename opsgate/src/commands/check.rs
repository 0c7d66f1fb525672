use anyhow::Result;
use opsgate_common::helpers::fs::validate_trust_anchor;
use tracing::*;

use crate::config::load_config;
use crate::Cli;

pub(crate) async fn command(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)?;

    if let Some(path) = &config.tls.custom_ca_path {
        validate_trust_anchor(path)?;
        info!(?path, "Custom trust anchor is valid");
    }

    println!("No problems found");
    Ok(())
}
