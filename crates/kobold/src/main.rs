use std::process::ExitCode;
use std::sync::Arc;

use crossbeam_channel::bounded;
use log::{error, info, warn};

use kobold::{Config, Service};

fn main() -> ExitCode {
    // A missing .env is normal; the environment may already be set.
    let _ = dotenvy::dotenv();

    if let Err(e) = kobold::logging::init() {
        eprintln!("kobold: could not install logging: {}", e);
    }

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            eprintln!("kobold: {}", e);
            return ExitCode::from(1);
        }
    };

    info!("Starting Kobold v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Watching {} director{}; library root {}",
        config.watch_dirs.len(),
        if config.watch_dirs.len() == 1 { "y" } else { "ies" },
        config.library_root().display()
    );

    let (stop_tx, stop_rx) = bounded::<()>(1);
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    }) {
        error!("Failed to install signal handler: {}", e);
        return ExitCode::from(1);
    }

    let service = match Service::start(Arc::clone(&config)) {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to start: {}", e);
            return ExitCode::from(1);
        }
    };

    let _ = stop_rx.recv();
    info!("Shutdown requested");
    if !service.shutdown() {
        warn!("Some work was abandoned; leases will expire and be reclaimed");
    }
    ExitCode::SUCCESS
}
