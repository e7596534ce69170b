use clap::Parser;
use ostor_server::config::Cli;
use ostor_server::{logging, server};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Cli::parse().into_config()?;
    logging::init_logging(config.debug);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting ostord");

    if let Err(e) = server::run(config).await {
        tracing::error!(error = %e, "ostord stopped");
        return Err(e.into());
    }
    tracing::info!("ostord stopped cleanly");
    Ok(())
}
