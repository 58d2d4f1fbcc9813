mod args;
mod config;
mod dnw;
mod framer;
mod images;
mod message;
mod registry;
mod session;
mod transport;

use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Pause between enumeration passes while no device is present.
const SCAN_PAUSE: Duration = Duration::from_millis(250);

fn main() -> ExitCode {
    let args = args::CliArgs::parse();

    match EnvFilter::builder()
        .with_env_var("TENSORDL_TRACE")
        .try_from_env()
    {
        Ok(filter) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_max_level(
                    args.log_level
                        .map(tracing::Level::from)
                        .unwrap_or(tracing::Level::INFO),
                )
                .init();
        }
    };

    let config = match config::Config::from_args(&args) {
        Ok(config) => config,
        Err(why) => {
            eprintln!("{why}");
            return ExitCode::FAILURE;
        }
    };

    if args.detect {
        return detect(&config);
    }

    let catalog = match load_catalog(&config) {
        Ok(catalog) => catalog,
        Err(why) => {
            eprintln!("{why:#}");
            return ExitCode::FAILURE;
        }
    };

    // Sessions come and go with the device; the driver never exits on its
    // own. `last_sent` deliberately survives reconnects so a failure trace
    // right after one still names the offending stage.
    let mut last_sent: Option<String> = None;
    loop {
        tracing::info!("Scanning for device...");
        let claimed = loop {
            match registry::acquire(&config) {
                Ok(claimed) => break claimed,
                Err(registry::AcquireError::NoDevice) => std::thread::sleep(SCAN_PAUSE),
                Err(err) => {
                    tracing::debug!("{err}");
                    std::thread::sleep(SCAN_PAUSE);
                }
            }
        };

        tracing::info!("Connected to {}!", claimed.transport.describe());
        let started = Instant::now();

        if let Err(why) = session::serve(claimed.transport, &config, &catalog, &mut last_sent) {
            tracing::error!("Session ended: {why}");
        }

        tracing::trace!("Connection lasted {:.2}s", started.elapsed().as_secs_f64());
    }
}

fn load_catalog(config: &config::Config) -> anyhow::Result<images::Catalog> {
    images::Catalog::load(config).with_context(|| {
        format!(
            "loading bootloader images from '{}'",
            config.src.display()
        )
    })
}

fn detect(config: &config::Config) -> ExitCode {
    let found = registry::scan(config);
    println!("Found {} device(s):", found.len());
    for device in found {
        println!("{} ({})", device.detail, device.id);
    }
    ExitCode::SUCCESS
}
