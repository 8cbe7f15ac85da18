//! Balance and activity cache for every asset ledger
//!
//! Reads never wait on a refresh: they return whatever the last completed
//! refresh committed. Concurrent refreshes of one asset share a single
//! in-flight request; fetched batches only become visible once committed.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};
use tracing::debug;

use super::registry::AccountRegistry;
use crate::derivation::AssetType;
use crate::error::WalletError;
use crate::external::{ActivityRecord, HistoryProvider};

/// What a cached balance belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BalanceKey {
    Account(u32),
    Address(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Smallest unit of the asset
    pub balance: u128,
    pub tx_count: u64,
}

/// Addresses to query for one asset, grouped by owner
#[derive(Debug, Clone, Default)]
pub struct RefreshTargets {
    pub accounts: Vec<(u32, Vec<String>)>,
    pub legacy: Vec<String>,
}

impl RefreshTargets {
    pub fn from_registry(registry: &AccountRegistry, asset: AssetType) -> Self {
        Self {
            accounts: registry
                .all_accounts(asset)
                .into_iter()
                .map(|a| (a.index, a.addresses()))
                .collect(),
            legacy: registry
                .all_legacy_addresses(asset)
                .into_iter()
                .map(|a| a.address)
                .collect(),
        }
    }

    fn addresses(&self) -> Vec<String> {
        self.accounts
            .iter()
            .flat_map(|(_, addresses)| addresses.iter().cloned())
            .chain(self.legacy.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSummary {
    pub asset: AssetType,
    pub entries: usize,
    pub total_balance: u128,
    pub tx_count: u64,
}

/// Balances fetched for one asset, not yet visible to readers
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshBatch {
    pub summary: RefreshSummary,
    generation: u64,
    entries: Vec<(BalanceKey, LedgerEntry)>,
}

impl RefreshBatch {
    pub fn balance(&self, key: &BalanceKey) -> u128 {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, e)| e.balance)
            .unwrap_or(0)
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<RefreshBatch, WalletError>>>;

#[derive(Default)]
struct LedgerTable {
    entries: HashMap<(AssetType, BalanceKey), LedgerEntry>,
    /// Generation of the batch each asset's entries came from
    committed: HashMap<AssetType, u64>,
}

pub struct BalanceLedger {
    provider: Arc<dyn HistoryProvider>,
    table: RwLock<LedgerTable>,
    in_flight: Mutex<HashMap<AssetType, RefreshFuture>>,
    next_generation: AtomicU64,
}

impl BalanceLedger {
    pub fn new(provider: Arc<dyn HistoryProvider>) -> Self {
        Self {
            provider,
            table: RwLock::new(LedgerTable::default()),
            in_flight: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn provider(&self) -> &Arc<dyn HistoryProvider> {
        &self.provider
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerTable> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, asset: AssetType, key: &BalanceKey) -> LedgerEntry {
        self.read()
            .entries
            .get(&(asset, key.clone()))
            .copied()
            .unwrap_or_default()
    }

    pub fn balance(&self, asset: AssetType, key: &BalanceKey) -> u128 {
        self.entry(asset, key).balance
    }

    pub fn activity(&self, asset: AssetType, key: &BalanceKey) -> u64 {
        self.entry(asset, key).tx_count
    }

    pub fn total_active_legacy_balance(&self, asset: AssetType, registry: &AccountRegistry) -> u128 {
        let table = self.read();
        registry
            .active_legacy_addresses(asset)
            .into_iter()
            .filter_map(|a| table.entries.get(&(asset, BalanceKey::Address(a.address))))
            .map(|e| e.balance)
            .fold(0, u128::saturating_add)
    }

    /// Sum over active accounts and active legacy addresses
    pub fn total_active_balance(&self, asset: AssetType, registry: &AccountRegistry) -> u128 {
        let accounts = {
            let table = self.read();
            registry
                .active_accounts(asset)
                .into_iter()
                .filter_map(|a| table.entries.get(&(asset, BalanceKey::Account(a.index))))
                .map(|e| e.balance)
                .fold(0, u128::saturating_add)
        };
        accounts.saturating_add(self.total_active_legacy_balance(asset, registry))
    }

    pub fn is_refreshing(&self, asset: AssetType) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&asset)
    }

    /// Fetch activity for `asset` without touching the cache. Joins the
    /// in-flight fetch if one is already running.
    pub async fn fetch(
        self: &Arc<Self>,
        asset: AssetType,
        targets: RefreshTargets,
    ) -> Result<RefreshBatch, WalletError> {
        let shared = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&asset) {
                Some(pending) => {
                    debug!(asset = %asset, "Joining in-flight refresh");
                    pending.clone()
                }
                None => {
                    let ledger = Arc::clone(self);
                    let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
                    let fut = async move {
                        let result = ledger.collect_batch(asset, generation, targets).await;
                        ledger
                            .in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .remove(&asset);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(asset, fut.clone());
                    fut
                }
            }
        };
        shared.await
    }

    /// Replace the asset's entries with `batch` in one step. Every waiter on a
    /// shared fetch may commit; a batch older than what is cached is ignored.
    pub fn commit(&self, batch: &RefreshBatch) -> bool {
        let asset = batch.summary.asset;
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.committed.get(&asset).is_some_and(|g| *g >= batch.generation) {
            return false;
        }
        table.entries.retain(|(a, _), _| *a != asset);
        table.entries.extend(
            batch
                .entries
                .iter()
                .map(|(key, entry)| ((asset, key.clone()), *entry)),
        );
        table.committed.insert(asset, batch.generation);
        debug!(asset = %asset, entries = batch.summary.entries, "Balances refreshed");
        true
    }

    /// Fetch and commit in one call
    pub async fn refresh(
        self: &Arc<Self>,
        asset: AssetType,
        targets: RefreshTargets,
    ) -> Result<RefreshSummary, WalletError> {
        let batch = self.fetch(asset, targets).await?;
        self.commit(&batch);
        Ok(batch.summary)
    }

    async fn collect_batch(
        &self,
        asset: AssetType,
        generation: u64,
        targets: RefreshTargets,
    ) -> Result<RefreshBatch, WalletError> {
        let records = self
            .provider
            .fetch_history(asset, &targets.addresses())
            .await?;
        let by_address: HashMap<&str, &ActivityRecord> =
            records.iter().map(|r| (r.address.as_str(), r)).collect();

        let sum = |addresses: &[String]| {
            addresses
                .iter()
                .filter_map(|a| by_address.get(a.as_str()))
                .fold(LedgerEntry::default(), |acc, r| LedgerEntry {
                    balance: acc.balance.saturating_add(r.balance),
                    tx_count: acc.tx_count.saturating_add(r.tx_count),
                })
        };

        let mut entries: Vec<(BalanceKey, LedgerEntry)> = targets
            .accounts
            .iter()
            .map(|(index, addresses)| (BalanceKey::Account(*index), sum(addresses)))
            .collect();
        entries.extend(
            targets
                .legacy
                .iter()
                .map(|a| (BalanceKey::Address(a.clone()), sum(std::slice::from_ref(a)))),
        );

        let summary = RefreshSummary {
            asset,
            entries: entries.len(),
            total_balance: entries.iter().map(|(_, e)| e.balance).fold(0, u128::saturating_add),
            tx_count: entries.iter().map(|(_, e)| e.tx_count).fold(0, u64::saturating_add),
        };
        Ok(RefreshBatch {
            summary,
            generation,
            entries,
        })
    }

    pub fn clear(&self) {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.entries.clear();
        table.committed.clear();
    }
}
