use anyhow::Context;
use clap::Parser;
use orderproof_auditor::config::Config;
use orderproof_auditor::logging::init_logging;

#[derive(Parser)]
#[command(name = "orderproof-api")]
#[command(version, about = "OrderProof public verification API", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "orderproof.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_file(&cli.config).context("Failed to load configuration")?;
    init_logging(cli.debug, &config.logging)?;

    orderproof_api::server::run_with_config(config).await
}
