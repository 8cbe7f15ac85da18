pub mod wallet;

use clap::{Parser, Subcommand};

use crate::derivation::AssetType;

#[derive(Parser)]
#[command(name = "multiasset-wallet")]
#[command(about = "Multi-asset HD wallet CLI", long_about = None)]
pub struct Cli {
    /// Path of the TOML config file
    #[arg(long, default_value = "wallet.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a wallet with a fresh recovery phrase
    New {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// Restore a wallet from its recovery phrase
    Recover {
        #[arg(long)]
        mnemonic: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// List stored wallets
    List,
    /// Show accounts and imported addresses of a wallet
    Show {
        #[arg(long)]
        guid: String,
        #[arg(long)]
        password: Option<String>,
    },
    /// Print the recovery phrase
    Mnemonic {
        #[arg(long)]
        guid: String,
        #[arg(long)]
        password: Option<String>,
        #[arg(long)]
        second_password: Option<String>,
        /// Record that the phrase has been written down
        #[arg(long)]
        confirm: bool,
    },
    /// Account operations on a stored wallet
    Account {
        #[arg(long)]
        guid: String,
        #[arg(long)]
        password: Option<String>,
        #[command(subcommand)]
        cmd: wallet::AccountCommands,
    },
    /// Next receive address of an account
    Derive {
        #[arg(long)]
        guid: String,
        #[arg(long)]
        password: Option<String>,
        /// btc, bch, eth or xlm
        #[arg(long)]
        asset: AssetType,
        #[arg(long, default_value_t = 0)]
        account: u32,
    },
    /// Score a password between 0 and 1
    Strength { password: String },
    /// Convert between legacy and CashAddr Bitcoin Cash addresses
    ConvertBch { address: String },
}
