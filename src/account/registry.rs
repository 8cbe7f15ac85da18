//! Per-asset account and legacy-address bookkeeping
//!
//! The whole table sits behind one `RwLock`: writers serialize, readers see the
//! last committed snapshot. Multi-field updates (default swap, upgrade) happen
//! inside a single write guard so no reader observes them half-applied.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::types::{Account, Address, LegacyAddress};
use crate::derivation::{AssetType, Chain, DerivationEngine};
use crate::error::{StateError, ValidationError, WalletResult};

/// Longest label accepted by [`AccountRegistry::is_account_name_valid`]
pub const MAX_ACCOUNT_NAME_LEN: usize = 17;

/// Accounts and imported addresses for one asset
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct AssetBook {
    pub accounts: Vec<Account>,
    pub legacy_addresses: Vec<LegacyAddress>,
    /// Next index `create_account` will derive
    pub empty_account_index: u32,
}

impl AssetBook {
    fn account(&self, asset: AssetType, index: u32) -> Result<&Account, StateError> {
        self.accounts
            .iter()
            .find(|a| a.index == index)
            .ok_or(StateError::UnknownAccount { asset, index })
    }

    fn account_mut(&mut self, asset: AssetType, index: u32) -> Result<&mut Account, StateError> {
        self.accounts
            .iter_mut()
            .find(|a| a.index == index)
            .ok_or(StateError::UnknownAccount { asset, index })
    }

    fn legacy(&self, asset: AssetType, address: &str) -> Result<&LegacyAddress, StateError> {
        self.legacy_addresses
            .iter()
            .find(|a| a.address == address)
            .ok_or_else(|| StateError::UnknownAddress {
                asset,
                address: address.to_string(),
            })
    }

    fn legacy_mut(&mut self, asset: AssetType, address: &str) -> Result<&mut LegacyAddress, StateError> {
        self.legacy_addresses
            .iter_mut()
            .find(|a| a.address == address)
            .ok_or_else(|| StateError::UnknownAddress {
                asset,
                address: address.to_string(),
            })
    }

    fn push_account(&mut self, mut account: Account) -> Account {
        account.is_default = self.accounts.is_empty();
        self.empty_account_index = self.empty_account_index.max(account.index + 1);
        self.accounts.push(account.clone());
        account
    }
}

/// Versioned account-index table, the persisted half of the registry
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RegistryTable {
    pub hd: bool,
    pub books: BTreeMap<AssetType, AssetBook>,
}

/// What an archive toggle applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveTarget {
    Account(u32),
    Address(String),
}

pub struct AccountRegistry {
    engine: Arc<DerivationEngine>,
    table: RwLock<RegistryTable>,
}

impl AccountRegistry {
    pub fn new(engine: Arc<DerivationEngine>) -> Self {
        Self {
            engine,
            table: RwLock::new(RegistryTable::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryTable> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn engine(&self) -> &Arc<DerivationEngine> {
        &self.engine
    }

    /// Snapshot for persistence
    pub fn table(&self) -> RegistryTable {
        self.read().clone()
    }

    pub fn replace(&self, table: RegistryTable) {
        *self.write() = table;
    }

    pub fn clear(&self) {
        self.replace(RegistryTable::default());
    }

    // --- HD lifecycle ---

    pub fn did_upgrade_to_hd(&self) -> bool {
        self.read().hd
    }

    /// One-way: give every asset a default account 0 derived from `seed`.
    pub fn upgrade_to_hd(&self, seed: &[u8], assets: &[AssetType]) -> WalletResult<()> {
        let mut table = self.write();
        if table.hd {
            return Err(StateError::AlreadyUpgraded.into());
        }

        // Derive everything first so a failure leaves the table untouched
        let mut derived = Vec::with_capacity(assets.len());
        for asset in assets {
            let mut account = self.engine.derive_account(seed, *asset, 0)?;
            account.label = asset.default_label().to_string();
            derived.push(account);
        }

        for account in derived {
            let book = table.books.entry(account.asset_type).or_default();
            if book.accounts.is_empty() {
                book.push_account(account);
            }
        }
        table.hd = true;

        info!(assets = assets.len(), "Wallet upgraded to HD");
        Ok(())
    }

    /// Derive the next account for `asset`. Index assignment happens under the
    /// write lock, so concurrent callers never derive the same index.
    pub fn create_account(&self, seed: &[u8], asset: AssetType, label: &str) -> WalletResult<Account> {
        let mut table = self.write();
        if !table.hd {
            return Err(StateError::NotUpgraded.into());
        }
        let book = table.books.entry(asset).or_default();
        let index = book.empty_account_index;

        let mut account = self.engine.derive_account(seed, asset, index)?;
        account.label = label.to_string();
        let account = book.push_account(account);

        debug!(asset = %asset, index, "Account created");
        Ok(account)
    }

    /// Insert an account reconstructed elsewhere (recovery). Existing indices are kept.
    pub fn restore_accounts(&self, asset: AssetType, accounts: Vec<Account>) {
        let mut table = self.write();
        table.hd = true;
        let book = table.books.entry(asset).or_default();
        for account in accounts {
            if book.accounts.iter().any(|a| a.index == account.index) {
                continue;
            }
            book.push_account(account);
        }
        book.accounts.sort_by_key(|a| a.index);
    }

    pub fn has_account(&self, asset: AssetType) -> bool {
        self.read()
            .books
            .get(&asset)
            .map(|b| !b.accounts.is_empty())
            .unwrap_or(false)
    }

    pub fn empty_account_index(&self, asset: AssetType) -> u32 {
        self.read()
            .books
            .get(&asset)
            .map(|b| b.empty_account_index)
            .unwrap_or(0)
    }

    // --- Queries ---

    pub fn all_accounts(&self, asset: AssetType) -> Vec<Account> {
        self.read()
            .books
            .get(&asset)
            .map(|b| b.accounts.clone())
            .unwrap_or_default()
    }

    pub fn active_accounts(&self, asset: AssetType) -> Vec<Account> {
        self.read()
            .books
            .get(&asset)
            .map(|b| b.accounts.iter().filter(|a| !a.is_archived).cloned().collect())
            .unwrap_or_default()
    }

    pub fn all_accounts_count(&self, asset: AssetType) -> usize {
        self.read().books.get(&asset).map(|b| b.accounts.len()).unwrap_or(0)
    }

    pub fn active_accounts_count(&self, asset: AssetType) -> usize {
        self.read()
            .books
            .get(&asset)
            .map(|b| b.accounts.iter().filter(|a| !a.is_archived).count())
            .unwrap_or(0)
    }

    pub fn account(&self, asset: AssetType, index: u32) -> WalletResult<Account> {
        let table = self.read();
        let book = table
            .books
            .get(&asset)
            .ok_or(StateError::UnknownAccount { asset, index })?;
        Ok(book.account(asset, index)?.clone())
    }

    /// Position of account `index` among the active accounts
    pub fn index_of_active_account(&self, asset: AssetType, index: u32) -> WalletResult<usize> {
        self.active_accounts(asset)
            .iter()
            .position(|a| a.index == index)
            .ok_or_else(|| StateError::UnknownAccount { asset, index }.into())
    }

    pub fn is_account_archived(&self, asset: AssetType, index: u32) -> WalletResult<bool> {
        Ok(self.account(asset, index)?.is_archived)
    }

    pub fn label_for(&self, asset: AssetType, index: u32) -> WalletResult<String> {
        Ok(self.account(asset, index)?.label)
    }

    pub fn xpub_for(&self, asset: AssetType, index: u32) -> WalletResult<String> {
        Ok(self.account(asset, index)?.xpub)
    }

    pub fn default_account_index(&self, asset: AssetType) -> Option<u32> {
        self.read()
            .books
            .get(&asset)
            .and_then(|b| b.accounts.iter().find(|a| a.is_default))
            .map(|a| a.index)
    }

    // --- Mutations ---

    pub fn set_label(&self, asset: AssetType, index: u32, label: &str) -> WalletResult<()> {
        let mut table = self.write();
        let book = table
            .books
            .get_mut(&asset)
            .ok_or(StateError::UnknownAccount { asset, index })?;
        book.account_mut(asset, index)?.label = label.to_string();
        Ok(())
    }

    pub fn set_default(&self, asset: AssetType, index: u32) -> WalletResult<()> {
        let mut table = self.write();
        let book = table
            .books
            .get_mut(&asset)
            .ok_or(StateError::UnknownAccount { asset, index })?;
        if book.account(asset, index)?.is_archived {
            return Err(StateError::ArchivedDefault { asset, index }.into());
        }
        for account in book.accounts.iter_mut() {
            account.is_default = account.index == index;
        }
        debug!(asset = %asset, index, "Default account changed");
        Ok(())
    }

    pub fn archive(&self, asset: AssetType, target: ArchiveTarget, archived: bool) -> WalletResult<()> {
        let mut table = self.write();
        let Some(book) = table.books.get_mut(&asset) else {
            return Err(match target {
                ArchiveTarget::Account(index) => StateError::UnknownAccount { asset, index },
                ArchiveTarget::Address(address) => StateError::UnknownAddress { asset, address },
            }
            .into());
        };
        match target {
            ArchiveTarget::Account(index) => {
                let account = book.account_mut(asset, index)?;
                if archived && account.is_default {
                    return Err(StateError::DefaultAccountArchive { asset }.into());
                }
                account.is_archived = archived;
            }
            ArchiveTarget::Address(address) => {
                book.legacy_mut(asset, &address)?.is_archived = archived;
            }
        }
        Ok(())
    }

    /// Flip an account's archive flag, returning the new value
    pub fn toggle_archive_account(&self, asset: AssetType, index: u32) -> WalletResult<bool> {
        let archived = !self.is_account_archived(asset, index)?;
        self.archive(asset, ArchiveTarget::Account(index), archived)?;
        Ok(archived)
    }

    pub fn toggle_archive_legacy_address(&self, asset: AssetType, address: &str) -> WalletResult<bool> {
        let archived = !self.is_address_archived(asset, address)?;
        self.archive(asset, ArchiveTarget::Address(address.to_string()), archived)?;
        Ok(archived)
    }

    /// Next unused receive address on an account, recorded on the account
    pub fn receive_address(&self, asset: AssetType, index: u32) -> WalletResult<Address> {
        let mut table = self.write();
        let book = table
            .books
            .get_mut(&asset)
            .ok_or(StateError::UnknownAccount { asset, index })?;
        let account = book.account_mut(asset, index)?;

        let next = account.next_address_index(Chain::Receive);
        let address = match self.engine.derive_address(account, Chain::Receive, next) {
            Ok(address) => address,
            // Single-address ledgers keep handing out the one they have
            Err(crate::error::DerivationError::UnsupportedPath { .. }) if next > 0 => {
                return account
                    .derived_addresses
                    .iter()
                    .find(|a| a.chain == Chain::Receive)
                    .cloned()
                    .ok_or_else(|| StateError::UnknownAccount { asset, index }.into());
            }
            Err(e) => return Err(e.into()),
        };
        account.derived_addresses.push(address.clone());
        Ok(address)
    }

    // --- Legacy addresses ---

    pub fn import_legacy_address(
        &self,
        asset: AssetType,
        address: &str,
        label: Option<String>,
        watch_only: bool,
    ) -> WalletResult<LegacyAddress> {
        if !self.engine.validate_address(asset, address)? {
            return Err(ValidationError::InvalidAddress {
                asset,
                address: address.to_string(),
            }
            .into());
        }

        let mut table = self.write();
        let book = table.books.entry(asset).or_default();
        if book.legacy_addresses.iter().any(|a| a.address == address) {
            return Err(StateError::DuplicateAddress {
                asset,
                address: address.to_string(),
            }
            .into());
        }
        let legacy = LegacyAddress::new(address.to_string(), label, watch_only);
        book.legacy_addresses.push(legacy.clone());

        info!(asset = %asset, watch_only, "Legacy address imported");
        Ok(legacy)
    }

    pub fn all_legacy_addresses(&self, asset: AssetType) -> Vec<LegacyAddress> {
        self.read()
            .books
            .get(&asset)
            .map(|b| b.legacy_addresses.clone())
            .unwrap_or_default()
    }

    pub fn active_legacy_addresses(&self, asset: AssetType) -> Vec<LegacyAddress> {
        self.read()
            .books
            .get(&asset)
            .map(|b| {
                b.legacy_addresses
                    .iter()
                    .filter(|a| !a.is_archived)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_legacy_addresses(&self, asset: AssetType) -> bool {
        self.read()
            .books
            .get(&asset)
            .map(|b| !b.legacy_addresses.is_empty())
            .unwrap_or(false)
    }

    fn with_legacy<R>(
        &self,
        asset: AssetType,
        address: &str,
        f: impl FnOnce(&LegacyAddress) -> R,
    ) -> WalletResult<R> {
        let table = self.read();
        let missing = || StateError::UnknownAddress {
            asset,
            address: address.to_string(),
        };
        let book = table.books.get(&asset).ok_or_else(missing)?;
        Ok(f(book.legacy(asset, address)?))
    }

    pub fn label_for_legacy(&self, asset: AssetType, address: &str) -> WalletResult<Option<String>> {
        self.with_legacy(asset, address, |a| a.label.clone())
    }

    pub fn is_address_archived(&self, asset: AssetType, address: &str) -> WalletResult<bool> {
        self.with_legacy(asset, address, |a| a.is_archived)
    }

    pub fn is_watch_only(&self, asset: AssetType, address: &str) -> WalletResult<bool> {
        self.with_legacy(asset, address, |a| a.is_watch_only)
    }

    fn with_legacy_mut<R>(
        &self,
        asset: AssetType,
        address: &str,
        f: impl FnOnce(&mut LegacyAddress) -> R,
    ) -> WalletResult<R> {
        let mut table = self.write();
        let book = table
            .books
            .get_mut(&asset)
            .ok_or_else(|| StateError::UnknownAddress {
                asset,
                address: address.to_string(),
            })?;
        Ok(f(book.legacy_mut(asset, address)?))
    }

    pub fn set_legacy_label(&self, asset: AssetType, address: &str, label: Option<String>) -> WalletResult<()> {
        self.with_legacy_mut(asset, address, |a| a.label = label)
    }

    /// Record scanned balances on imported addresses
    pub fn set_legacy_balance(&self, asset: AssetType, address: &str, balance: u128) -> WalletResult<()> {
        self.with_legacy_mut(asset, address, |a| a.balance = balance)
    }

    /// Every address the registry knows for `asset`, HD and imported
    pub fn watched_addresses(&self, asset: AssetType) -> Vec<String> {
        let table = self.read();
        let Some(book) = table.books.get(&asset) else {
            return Vec::new();
        };
        book.accounts
            .iter()
            .flat_map(|a| a.addresses())
            .chain(book.legacy_addresses.iter().map(|a| a.address.clone()))
            .collect()
    }

    /// Names shown for accounts: non-blank, at most [`MAX_ACCOUNT_NAME_LEN`] characters
    pub fn is_account_name_valid(name: &str) -> bool {
        !name.trim().is_empty() && name.chars().count() <= MAX_ACCOUNT_NAME_LEN
    }
}
