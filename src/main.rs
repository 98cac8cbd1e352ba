type Result<T> = color_eyre::eyre::Result<T>;

mod cli;
mod error;
mod signals;
mod supervisor;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::Cli;
use supervisor::Supervisor;

fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.into_config()?;

    info!(
        "fixinit starting, fixture: {} {:?}",
        config.command.display(),
        config.args
    );

    match Supervisor::new(config).run() {
        Ok(status) => {
            info!("fixture torn down cleanly: {}", status);
            Ok(())
        }
        Err(e) => {
            // The signal mask has already been restored by this point; the
            // report on stderr names the failing step, exit code is non-zero.
            error!("supervision failed: {}", e);
            Err(e.into())
        }
    }
}
