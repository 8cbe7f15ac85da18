//! Wallet recovery from a BIP39 recovery phrase
//!
//! Fresh recovery probes account indices per asset until `gap_limit` consecutive
//! accounts show no activity. Each probe covers the first `address_window`
//! receive and change addresses of the account. Metadata-assisted recovery looks up a credentials
//! backup stored under an identifier derived from the seed, so an existing GUID
//! can be reopened.

use bip39::{Language, Mnemonic};
use futures::future::try_join_all;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::{Zeroize, Zeroizing};

use super::types::{Account, Address};
use crate::derivation::{AssetType, Chain, DerivationEngine};
use crate::error::{AuthError, DerivationError, RecoveryError, WalletError};
use crate::external::{HistoryProvider, MetadataError, MetadataStore};
use crate::secret::crypto;

pub const DEFAULT_GAP_LIMIT: u32 = 5;
/// Addresses checked per chain when probing an account
pub const DEFAULT_ADDRESS_WINDOW: u32 = 20;

const METADATA_ID_TAG: &[u8] = b"multiasset-wallet/metadata-identifier";
const METADATA_KEY_TAG: &[u8] = b"multiasset-wallet/metadata-encryption";

type HmacSha256 = Hmac<Sha256>;

fn tagged_hmac(tag: &[u8], seed: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut out = Zeroizing::new([0u8; 32]);
    // HMAC accepts keys of any length
    if let Ok(mut mac) = HmacSha256::new_from_slice(tag) {
        mac.update(seed);
        out.copy_from_slice(&mac.finalize().into_bytes());
    }
    out
}

/// Validate a recovery phrase (words and checksum)
pub fn parse_mnemonic(phrase: &str) -> Result<Mnemonic, RecoveryError> {
    let normalized = phrase.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    Mnemonic::parse_in(Language::English, normalized.as_str())
        .map_err(|_| RecoveryError::InvalidMnemonic)
}

/// Inputs of one recovery attempt; wiped when dropped
pub struct RecoveryState {
    pub mnemonic_passphrase: Zeroizing<String>,
    pub target_guid: Option<String>,
    pub has_metadata_backup: bool,
}

impl RecoveryState {
    pub fn new(mnemonic_passphrase: &str, target_guid: Option<String>) -> Self {
        Self {
            mnemonic_passphrase: Zeroizing::new(mnemonic_passphrase.to_string()),
            target_guid,
            has_metadata_backup: false,
        }
    }

    pub fn entropy(&self) -> Result<Zeroizing<Vec<u8>>, RecoveryError> {
        Ok(Zeroizing::new(parse_mnemonic(&self.mnemonic_passphrase)?.to_entropy()))
    }

    pub fn seed(&self) -> Result<Zeroizing<[u8; 64]>, RecoveryError> {
        Ok(Zeroizing::new(parse_mnemonic(&self.mnemonic_passphrase)?.to_seed("")))
    }
}

/// Login material kept in the metadata backup
#[derive(Serialize, Deserialize, Clone, PartialEq)]
pub struct WalletCredentials {
    pub guid: String,
    pub shared_key: String,
    pub password: String,
}

impl Drop for WalletCredentials {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl std::fmt::Debug for WalletCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletCredentials")
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

/// Result of probing one asset
#[derive(Debug, Clone, PartialEq)]
pub struct AssetScan {
    pub asset: AssetType,
    pub accounts: Vec<Account>,
    /// Highest index with observed activity
    pub recovered_account_index: Option<u32>,
}

pub struct RecoveryCoordinator {
    engine: Arc<DerivationEngine>,
    provider: Arc<dyn HistoryProvider>,
    metadata: Arc<dyn MetadataStore>,
    gap_limit: u32,
    address_window: u32,
}

/// Add the window addresses up to the last used one on each chain, so the
/// account keeps watching them and hands out fresh addresses past them.
fn keep_used_addresses(account: &mut Account, window: &[Address], used: &HashSet<&str>) {
    for chain in [Chain::Receive, Chain::Change] {
        let last_used = window
            .iter()
            .filter(|a| a.chain == chain && used.contains(a.value.as_str()))
            .map(|a| a.index)
            .max();
        let Some(last_used) = last_used else {
            continue;
        };
        for address in window.iter().filter(|a| a.chain == chain && a.index <= last_used) {
            if !account.derived_addresses.contains(address) {
                account.derived_addresses.push(address.clone());
            }
        }
    }
}

impl RecoveryCoordinator {
    pub fn new(
        engine: Arc<DerivationEngine>,
        provider: Arc<dyn HistoryProvider>,
        metadata: Arc<dyn MetadataStore>,
        gap_limit: u32,
    ) -> Self {
        Self {
            engine,
            provider,
            metadata,
            gap_limit: gap_limit.max(1),
            address_window: DEFAULT_ADDRESS_WINDOW,
        }
    }

    pub fn with_address_window(mut self, window: u32) -> Self {
        self.address_window = window.max(1);
        self
    }

    /// Addresses probed for one account: what it already holds plus the first
    /// `address_window` of each chain the ledger supports.
    fn probe_window(&self, account: &Account) -> Result<Vec<Address>, WalletError> {
        let mut window = account.derived_addresses.clone();
        for chain in [Chain::Receive, Chain::Change] {
            for index in 0..self.address_window {
                match self.engine.derive_address(account, chain, index) {
                    Ok(address) => {
                        if !window.contains(&address) {
                            window.push(address);
                        }
                    }
                    Err(DerivationError::UnsupportedPath { .. }) => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(window)
    }

    /// Deterministic backup identifier for a seed, hex encoded
    pub fn metadata_identifier(seed: &[u8]) -> String {
        hex::encode(*tagged_hmac(METADATA_ID_TAG, seed))
    }

    /// Probe one asset. Requests are strictly sequential.
    pub async fn scan_asset(&self, seed: &[u8], asset: AssetType) -> Result<AssetScan, WalletError> {
        let mut probed: Vec<Account> = Vec::new();
        let mut highest: Option<u32> = None;
        let mut empty_run = 0u32;
        let mut index = 0u32;

        while empty_run < self.gap_limit {
            let mut account = match self.engine.derive_account(seed, asset, index) {
                Ok(account) => account,
                Err(DerivationError::IndexOverflow { .. }) => break,
                Err(e) => return Err(e.into()),
            };
            let window = self.probe_window(&account)?;
            let values: Vec<String> = window.iter().map(|a| a.value.clone()).collect();
            let records = self.provider.fetch_history(asset, &values).await?;
            let used: HashSet<&str> = records
                .iter()
                .filter(|r| r.tx_count > 0)
                .map(|r| r.address.as_str())
                .collect();

            if used.is_empty() {
                empty_run += 1;
            } else {
                keep_used_addresses(&mut account, &window, &used);
                highest = Some(index);
                empty_run = 0;
            }
            probed.push(account);
            index = match index.checked_add(1) {
                Some(next) => next,
                None => break,
            };
        }

        let keep = highest.map(|h| h as usize + 1).unwrap_or(1);
        probed.truncate(keep);
        for account in probed.iter_mut() {
            account.label = if account.index == 0 {
                asset.default_label().to_string()
            } else {
                format!("{} {}", asset.default_label(), account.index + 1)
            };
        }

        debug!(asset = %asset, probed = index, kept = probed.len(), "Gap scan finished");
        Ok(AssetScan {
            asset,
            accounts: probed,
            recovered_account_index: highest,
        })
    }

    /// Probe every asset, one sequential scan per asset running side by side
    pub async fn scan(&self, seed: &[u8], assets: &[AssetType]) -> Result<Vec<AssetScan>, WalletError> {
        let scans = try_join_all(assets.iter().map(|asset| self.scan_asset(seed, *asset))).await?;
        info!(assets = scans.len(), "Account discovery complete");
        Ok(scans)
    }

    pub async fn save_credentials(
        &self,
        seed: &[u8],
        credentials: &WalletCredentials,
    ) -> Result<(), WalletError> {
        let key = tagged_hmac(METADATA_KEY_TAG, seed);
        let plain = Zeroizing::new(
            serde_json::to_vec(credentials).map_err(|e| WalletError::Metadata(e.to_string()))?,
        );
        let blob = crypto::encrypt_with_key(&key, &plain)?;
        self.metadata
            .save(&Self::metadata_identifier(seed), &blob)
            .await?;
        debug!(guid = %credentials.guid, "Credentials backup saved");
        Ok(())
    }

    /// Fetch the credentials backup for a seed. A missing backup is `NoMetadata`.
    pub async fn load_credentials(&self, seed: &[u8]) -> Result<WalletCredentials, WalletError> {
        let blob = match self.metadata.fetch(&Self::metadata_identifier(seed)).await {
            Ok(blob) => blob,
            Err(MetadataError::NotFound) => return Err(RecoveryError::NoMetadata.into()),
            Err(e) => {
                warn!(error = %e, "Metadata fetch failed");
                return Err(e.into());
            }
        };
        let key = tagged_hmac(METADATA_KEY_TAG, seed);
        let plain = crypto::decrypt_with_key(&key, &blob)?;
        serde_json::from_slice(&plain).map_err(|_| AuthError::Corrupt.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::tests::abandon_seed;
    use crate::external::{MemoryMetadataStore, StaticHistoryProvider};

    fn coordinator(provider: Arc<StaticHistoryProvider>) -> RecoveryCoordinator {
        RecoveryCoordinator::new(
            Arc::new(DerivationEngine::new()),
            provider,
            Arc::new(MemoryMetadataStore::new()),
            DEFAULT_GAP_LIMIT,
        )
    }

    #[test]
    fn test_parse_mnemonic() {
        let phrase = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
        assert!(parse_mnemonic(phrase).is_ok());
        assert!(parse_mnemonic(&format!("  {}  ", phrase.to_uppercase())).is_ok());

        let bad_checksum = vec!["abandon"; 12].join(" ");
        assert_eq!(parse_mnemonic(&bad_checksum).unwrap_err(), RecoveryError::InvalidMnemonic);
        assert_eq!(parse_mnemonic("not a phrase").unwrap_err(), RecoveryError::InvalidMnemonic);
    }

    #[tokio::test]
    async fn test_gap_limit_scan() {
        let seed = abandon_seed();
        let engine = DerivationEngine::new();
        let provider = Arc::new(StaticHistoryProvider::new());
        for index in [0, 2] {
            let account = engine.derive_account(&seed, AssetType::Bitcoin, index).unwrap();
            provider.set_activity(&account.derived_addresses[0].value, 1, 1_000);
        }

        let scan = coordinator(provider.clone())
            .scan_asset(&seed, AssetType::Bitcoin)
            .await
            .unwrap();

        assert_eq!(scan.recovered_account_index, Some(2));
        let indices: Vec<u32> = scan.accounts.iter().map(|a| a.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        // Indices 0..=2 plus five empty probes
        assert_eq!(provider.history_calls(), 8);
    }

    #[tokio::test]
    async fn test_scan_without_activity_keeps_first_account() {
        let provider = Arc::new(StaticHistoryProvider::new());
        let scans = coordinator(provider)
            .scan(&abandon_seed(), &AssetType::ALL)
            .await
            .unwrap();

        assert_eq!(scans.len(), AssetType::ALL.len());
        for scan in scans {
            assert_eq!(scan.accounts.len(), 1);
            assert_eq!(scan.accounts[0].index, 0);
            assert_eq!(scan.recovered_account_index, None);
        }
    }

    #[tokio::test]
    async fn test_scan_is_repeatable() {
        let seed = abandon_seed();
        let provider = Arc::new(StaticHistoryProvider::new());
        let account = DerivationEngine::new()
            .derive_account(&seed, AssetType::Ethereum, 1)
            .unwrap();
        provider.set_activity(&account.derived_addresses[0].value, 3, 0);

        let coordinator = coordinator(provider);
        let first = coordinator.scan(&seed, &[AssetType::Ethereum]).await.unwrap();
        let second = coordinator.scan(&seed, &[AssetType::Ethereum]).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first[0].accounts.len(), 2);
    }

    #[tokio::test]
    async fn test_credentials_backup() {
        let seed = abandon_seed();
        let coordinator = coordinator(Arc::new(StaticHistoryProvider::new()));

        assert_eq!(
            coordinator.load_credentials(&seed).await.unwrap_err(),
            WalletError::Recovery(RecoveryError::NoMetadata)
        );

        let credentials = WalletCredentials {
            guid: "guid".to_string(),
            shared_key: "key".to_string(),
            password: "Tr0ub4dor&3".to_string(),
        };
        coordinator.save_credentials(&seed, &credentials).await.unwrap();
        assert_eq!(coordinator.load_credentials(&seed).await.unwrap(), credentials);

        let mut other = [1u8; 64];
        other[0] = 2;
        assert!(coordinator.load_credentials(&other).await.is_err());
    }

    #[test]
    fn test_metadata_identifier_is_deterministic() {
        let seed = abandon_seed();
        let id = RecoveryCoordinator::metadata_identifier(&seed);
        assert_eq!(id, RecoveryCoordinator::metadata_identifier(&seed));
        assert_eq!(id.len(), 64);
        assert_ne!(id, hex::encode(*tagged_hmac(METADATA_KEY_TAG, &seed)));
    }

    #[tokio::test]
    async fn test_scan_finds_activity_past_first_address() {
        let seed = abandon_seed();
        let engine = DerivationEngine::new();
        let provider = Arc::new(StaticHistoryProvider::new());
        let account = engine.derive_account(&seed, AssetType::Bitcoin, 1).unwrap();
        let receive = engine.derive_address(&account, Chain::Receive, 3).unwrap();
        let change = engine.derive_address(&account, Chain::Change, 1).unwrap();
        provider.set_activity(&receive.value, 1, 5_000);
        provider.set_activity(&change.value, 1, 700);

        let scan = coordinator(provider)
            .scan_asset(&seed, AssetType::Bitcoin)
            .await
            .unwrap();

        assert_eq!(scan.recovered_account_index, Some(1));
        let recovered = &scan.accounts[1];
        assert_eq!(recovered.next_address_index(Chain::Receive), 4);
        assert_eq!(recovered.next_address_index(Chain::Change), 2);
        assert!(recovered.addresses().contains(&receive.value));
        assert!(recovered.addresses().contains(&change.value));
        assert_eq!(scan.accounts[0].derived_addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_window_respects_single_address_ledgers() {
        let seed = abandon_seed();
        let coordinator = coordinator(Arc::new(StaticHistoryProvider::new())).with_address_window(3);
        let engine = DerivationEngine::new();

        let stellar = engine.derive_account(&seed, AssetType::Stellar, 0).unwrap();
        assert_eq!(coordinator.probe_window(&stellar).unwrap().len(), 1);

        let bitcoin = engine.derive_account(&seed, AssetType::Bitcoin, 0).unwrap();
        assert_eq!(coordinator.probe_window(&bitcoin).unwrap().len(), 6);
    }
}
