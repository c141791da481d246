use std::error::Error;

use harvest_core::config::Settings;
use tracing::{error, info};

mod cmdline;
mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    // Setup the CryptoProvider (controls core cryptography used by rustls) for the process
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| "Installing default CryptoProvider")?;

    if let Err(e) = run().await {
        error!("{e:?}");
        return Err(e);
    }
    info!("Exiting...");

    Ok(())
}

async fn run() -> Result<(), Box<dyn Error>> {
    let matches = cmdline::root_cli().get_matches();
    let settings = Settings::load()?;

    match matches.subcommand() {
        Some((cmdline::VALIDATE, _)) => {
            harvest_core::check(&settings)?;
            info!(?settings, "Configuration is valid");
        }
        Some((cmdline::RUN, _)) => {
            info!(?settings, "Starting with settings");
            harvest_core::harvest(settings).await?;
        }
        other => return Err(format!("unknown subcommand {other:?}").into()),
    }
    Ok(())
}
