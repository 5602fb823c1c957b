mod cli;
mod cmd;
mod command;
mod config;
mod error;
mod lifecycle;
mod lock;
mod logger;
mod port;
mod probe;
mod registry;
mod spinner;
mod toolchain;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    logger::init()?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "pgsandbox start");

    match cli::run() {
        Ok(result) => {
            info!("pgsandbox finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "pgsandbox failed");
            Err(err)
        }
    }
}
