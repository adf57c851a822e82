use clap::Parser;

use tandem::cli::{self, Cli, Commands};
use tandem::telemetry::{self, LogConfig};

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_config = LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    };
    if let Err(err) = telemetry::init(&log_config) {
        eprintln!("⚠️  logging disabled: {err}");
    }

    let result = match cli.command {
        Commands::Join(args) => cli::run_join(args).await,
    };
    if let Err(err) = result {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}
