#![forbid(unsafe_code)]

use anyhow::Result;
use cirrus_relay::{Args, RelayConfig, RelayServer};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    cirrus_common::init_tracing_with_default(&format!(
        "{},hyper=warn,tokio=warn",
        args.log_level
    ));

    info!("Starting cirrus-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_args(&args)?;
    let server = RelayServer::bind(config).await?;
    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("cirrus-relay stopped");
    Ok(())
}
