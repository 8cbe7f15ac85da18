use clap::Parser;
use tracing_subscriber::EnvFilter;

use multiasset_wallet::cli::{self, Cli};
use multiasset_wallet::config::WalletConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = WalletConfig::load_or_default(&cli.config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    if let Err(e) = cli::wallet::run(cli.command, config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
