//! Notary server binary

use anyhow::Context;
use notary_server::{spawn_notary_actor, Notary, NotaryConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting notary server");

    // Load configuration: file named by NOTARY_CONFIG, else environment
    let config = match std::env::var("NOTARY_CONFIG") {
        Ok(path) => NotaryConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => NotaryConfig::from_env().context("reading environment")?,
    };
    let mailbox_size = config.mailbox_size;

    let notary = Arc::new(Notary::open(config).context("opening notary")?);
    tracing::info!(
        notary_id = %notary.notary_id(),
        public_key = %hex::encode(notary.public_key()),
        "Notary opened"
    );

    let handle = spawn_notary_actor(notary.clone(), mailbox_size);

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down notary server");
    handle.shutdown().await?;
    Ok(())
}
