use std::path::PathBuf;
use clap::Parser;
use log::{error, info, LevelFilter};
use ao_remote::cli::application::ApplicationOptions;
use ao_remote::error::AppRunError;
use ao_remote::{init_logging, run};

/// Control an AO massager over Bluetooth LE.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the JSON config file (defaults to the platform config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long)]
    verbose: bool,

    /// Start scanning right away
    #[arg(long)]
    scan: bool,
}

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let args = Args::parse();

    init_logging(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    info!(concat!("AO Remote ", env!("CARGO_PKG_VERSION")));

    let options = ApplicationOptions {
        config_path: args.config,
        scan_on_start: args.scan,
    };

    if let Err(err) = run(options).await {
        error!("Unexpected error: {}", err);
        return Err(err);
    }

    Ok(())
}
