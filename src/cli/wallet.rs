use clap::Subcommand;
use std::io::{self, Write};
use std::sync::Arc;
use tracing::info;
use zeroize::Zeroizing;

use super::Commands;
use crate::config::WalletConfig;
use crate::derivation::AssetType;
use crate::external::StaticHistoryProvider;
use crate::secret::strength_of;
use crate::session::WalletSession;
use crate::storage::{PayloadStore, Storage};

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Derive a new HD account
    Create {
        #[arg(long)]
        asset: AssetType,
        #[arg(long)]
        label: String,
        #[arg(long)]
        second_password: Option<String>,
    },
    /// Make an account the default for its asset
    Default {
        #[arg(long)]
        asset: AssetType,
        #[arg(long)]
        index: u32,
    },
    /// Archive or unarchive an account
    Archive {
        #[arg(long)]
        asset: AssetType,
        #[arg(long)]
        index: u32,
    },
    Label {
        #[arg(long)]
        asset: AssetType,
        #[arg(long)]
        index: u32,
        #[arg(long)]
        label: String,
    },
    /// Import a standalone address
    Import {
        #[arg(long)]
        asset: AssetType,
        #[arg(long)]
        address: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        watch_only: bool,
    },
}

fn password_or_prompt(given: Option<String>, prompt: &str) -> io::Result<Zeroizing<String>> {
    if let Some(password) = given {
        return Ok(Zeroizing::new(password));
    }
    print!("{}: ", prompt);
    io::stdout().flush()?;
    let mut line = Zeroizing::new(String::new());
    io::stdin().read_line(&mut line)?;
    Ok(Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn check_label(label: &str) -> Result<(), String> {
    if WalletSession::is_account_name_valid(label) {
        Ok(())
    } else {
        Err(format!("Invalid label '{}': must be 1 to 17 characters", label))
    }
}

fn open_session(config: &WalletConfig, storage: &Storage) -> WalletSession {
    // No indexer is configured for the CLI; every address reads as unused
    WalletSession::builder(config.clone())
        .payload_store(Arc::new(storage.clone()))
        .metadata_store(Arc::new(storage.clone()))
        .history_provider(Arc::new(StaticHistoryProvider::new()))
        .build()
}

fn open_wallet(
    config: &WalletConfig,
    storage: &Storage,
    guid: &str,
    password: Option<String>,
) -> Result<WalletSession, Box<dyn std::error::Error>> {
    let session = open_session(config, storage);
    let password = password_or_prompt(password, "Password")?;
    session.load_wallet_with_guid(guid, None, &password)?;
    Ok(session)
}

fn print_words(words: &[String]) {
    for (i, word) in words.iter().enumerate() {
        println!("  {:>2}. {}", i + 1, word);
    }
}

fn print_wallet(session: &WalletSession) -> CliResult {
    for asset in session.config().assets.iter().copied() {
        println!("\n[{}]", asset);
        for account in session.all_accounts(asset)? {
            let mut flags = Vec::new();
            if account.is_default {
                flags.push("default");
            }
            if account.is_archived {
                flags.push("archived");
            }
            println!(
                "  #{} {:<18} {} {}",
                account.index,
                account.label,
                account.xpub,
                if flags.is_empty() {
                    String::new()
                } else {
                    format!("({})", flags.join(", "))
                }
            );
        }
        for legacy in session.all_legacy_addresses(asset)? {
            println!(
                "  legacy {} {}{}{}",
                legacy.address,
                legacy.label.as_deref().unwrap_or(""),
                if legacy.is_watch_only { " (watch-only)" } else { "" },
                if legacy.is_archived { " (archived)" } else { "" },
            );
        }
    }
    Ok(())
}

pub async fn run(command: Commands, config: WalletConfig) -> CliResult {
    match command {
        Commands::Strength { password } => {
            println!("{:.2}", strength_of(&password));
            return Ok(());
        }
        Commands::ConvertBch { address } => {
            let converted = WalletSession::from_bitcoin_cash(&address)
                .or_else(|| WalletSession::to_bitcoin_cash(&address))
                .ok_or_else(|| format!("'{}' is not a Bitcoin Cash address", address))?;
            println!("{}", converted);
            return Ok(());
        }
        _ => {}
    }

    let storage = Storage::open(&config.storage.db_path)?;
    info!(path = %config.storage.db_path, "Storage opened");

    match command {
        Commands::New { email, password } => {
            let session = open_session(&config, &storage);
            let password = password_or_prompt(password, "New password")?;
            let identity = session.new_account(&password, email)?;
            session.wait_for_background_tasks().await;

            println!("Wallet created.");
            println!("GUID:       {}", identity.guid);
            println!("Shared key: {}", identity.shared_key);
            println!("Recovery phrase:");
            print_words(&session.get_mnemonic(None)?);
            println!("KEEP THIS SAFE!");
        }
        Commands::Recover {
            mnemonic,
            email,
            password,
        } => {
            let session = open_session(&config, &storage);
            let identity = match session
                .recover_from_metadata_with_mnemonic_passphrase(&mnemonic)
                .await
            {
                Ok(identity) => {
                    println!("Existing wallet found in backup.");
                    identity
                }
                Err(crate::WalletError::Recovery(crate::error::RecoveryError::NoMetadata)) => {
                    let password = password_or_prompt(password, "New password")?;
                    session.recover_with_email(email, &password, &mnemonic).await?
                }
                Err(e) => return Err(e.into()),
            };
            println!("GUID: {}", identity.guid);
            print_wallet(&session)?;
        }
        Commands::List => {
            for guid in storage.guids()? {
                println!("{}", guid);
            }
        }
        Commands::Show { guid, password } => {
            let session = open_wallet(&config, &storage, &guid, password)?;
            print_wallet(&session)?;
        }
        Commands::Mnemonic {
            guid,
            password,
            second_password,
            confirm,
        } => {
            let session = open_wallet(&config, &storage, &guid, password)?;
            let second = if session.needs_second_password() {
                Some(password_or_prompt(second_password, "Second password")?)
            } else {
                None
            };
            print_words(&session.get_mnemonic(second.as_deref().map(String::as_str))?);
            if confirm {
                session.mark_recovery_phrase_verified()?;
                println!("Recovery phrase marked as verified.");
            }
        }
        Commands::Account { guid, password, cmd } => {
            let session = open_wallet(&config, &storage, &guid, password)?;
            handle_account_command(&session, cmd)?;
        }
        Commands::Derive {
            guid,
            password,
            asset,
            account,
        } => {
            let session = open_wallet(&config, &storage, &guid, password)?;
            let address = session.receive_address(asset, account)?;
            println!("{}", address.value);
        }
        Commands::Strength { .. } | Commands::ConvertBch { .. } => {}
    }
    Ok(())
}

fn handle_account_command(session: &WalletSession, cmd: AccountCommands) -> CliResult {
    match cmd {
        AccountCommands::Create {
            asset,
            label,
            second_password,
        } => {
            check_label(&label)?;
            let second = if session.needs_second_password() {
                Some(password_or_prompt(second_password, "Second password")?)
            } else {
                None
            };
            let account =
                session.create_account(asset, &label, second.as_deref().map(String::as_str))?;
            println!("Account #{} created: {}", account.index, account.xpub);
        }
        AccountCommands::Default { asset, index } => {
            session.set_default_account(asset, index)?;
            println!("Account #{} is now the default {} account", index, asset);
        }
        AccountCommands::Archive { asset, index } => {
            let archived = session.toggle_archive_account(asset, index)?;
            println!(
                "Account #{} {}",
                index,
                if archived { "archived" } else { "unarchived" }
            );
        }
        AccountCommands::Label {
            asset,
            index,
            label,
        } => {
            check_label(&label)?;
            session.set_label(asset, index, &label)?;
        }
        AccountCommands::Import {
            asset,
            address,
            label,
            watch_only,
        } => {
            if let Some(label) = &label {
                check_label(label)?;
            }
            let imported = session.import_legacy_address(asset, &address, label, watch_only)?;
            println!("Imported {}", imported.address);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_label() {
        assert!(check_label("Savings").is_ok());
        assert!(check_label("").is_err());
        assert!(check_label("a label that is far too long").is_err());
    }

    #[test]
    fn test_password_given_skips_prompt() {
        let password = password_or_prompt(Some("Tr0ub4dor&3".to_string()), "Password").unwrap();
        assert_eq!(password.as_str(), "Tr0ub4dor&3");
    }
}
