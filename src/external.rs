//! Collaborators the wallet core talks to but does not own
//!
//! - [`ScriptBridge`]: synchronous evaluator for hosted legacy routines
//! - [`MetadataStore`]: remote/local backup blobs keyed by an identifier
//! - [`HistoryProvider`]: balances, activity and exchange rates
//! - [`WalletDelegate`]: fire-and-forget lifecycle notifications
//!
//! In-process implementations live here too; the CLI and tests run on them.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, warn};

use crate::derivation::AssetType;
use crate::error::{BridgeError, WalletError};

// --- Scripting bridge ---

pub trait ScriptBridge: Send + Sync {
    /// (Re)create the evaluation context
    fn load(&self) -> Result<(), BridgeError>;

    fn is_loaded(&self) -> bool;

    fn evaluate(&self, script: &str) -> Result<serde_json::Value, BridgeError>;
}

/// Bridge answering from a fixed table of scripts. Useful offline and in tests.
#[derive(Default)]
pub struct StaticScriptBridge {
    responses: HashMap<String, serde_json::Value>,
    loaded: Mutex<bool>,
    /// Evaluations left to fail before answering normally
    failures: AtomicUsize,
    load_failures: AtomicUsize,
    loads: AtomicUsize,
}

impl StaticScriptBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, script: &str, value: serde_json::Value) -> Self {
        self.responses.insert(script.to_string(), value);
        self
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_load(&self, count: usize) {
        self.load_failures.store(count, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ScriptBridge for StaticScriptBridge {
    fn load(&self) -> Result<(), BridgeError> {
        let pending = self.load_failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.load_failures.store(pending - 1, Ordering::SeqCst);
            return Err(BridgeError::LoadFailed("injected load failure".to_string()));
        }
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evaluate(&self, script: &str) -> Result<serde_json::Value, BridgeError> {
        if !self.is_loaded() {
            return Err(BridgeError::NotLoaded);
        }
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            // A failed evaluation leaves the context unusable
            *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) = false;
            return Err(BridgeError::EvaluationFailed(format!("injected failure in {}", script)));
        }
        self.responses
            .get(script)
            .cloned()
            .ok_or_else(|| BridgeError::EvaluationFailed(format!("undefined: {}", script)))
    }
}

// --- Metadata store ---

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    #[error("no metadata stored under this identifier")]
    NotFound,
    #[error("metadata transport error: {0}")]
    Transport(String),
}

impl From<MetadataError> for WalletError {
    fn from(err: MetadataError) -> Self {
        WalletError::Metadata(err.to_string())
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn fetch(&self, identifier: &str) -> Result<Vec<u8>, MetadataError>;

    async fn save(&self, identifier: &str, blob: &[u8]) -> Result<(), MetadataError>;
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn fetch(&self, identifier: &str) -> Result<Vec<u8>, MetadataError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identifier)
            .cloned()
            .ok_or(MetadataError::NotFound)
    }

    async fn save(&self, identifier: &str, blob: &[u8]) -> Result<(), MetadataError> {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier.to_string(), blob.to_vec());
        Ok(())
    }
}

// --- History provider ---

/// Observed on-chain activity for one address
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ActivityRecord {
    pub address: String,
    pub tx_count: u64,
    /// Smallest unit of the asset
    pub balance: u128,
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn fetch_history(
        &self,
        asset: AssetType,
        addresses: &[String],
    ) -> Result<Vec<ActivityRecord>, WalletError>;

    async fn fetch_exchange_rates(&self) -> Result<HashMap<AssetType, Decimal>, WalletError>;
}

/// Provider serving canned activity per address
#[derive(Default)]
pub struct StaticHistoryProvider {
    activity: Mutex<HashMap<String, ActivityRecord>>,
    rates: Mutex<HashMap<AssetType, Decimal>>,
    history_calls: AtomicUsize,
    /// Artificial latency so concurrent callers overlap
    delay: Option<std::time::Duration>,
}

impl StaticHistoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_activity(&self, address: &str, tx_count: u64, balance: u128) {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner).insert(
            address.to_string(),
            ActivityRecord {
                address: address.to_string(),
                tx_count,
                balance,
            },
        );
    }

    pub fn set_rate(&self, asset: AssetType, rate: Decimal) {
        self.rates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(asset, rate);
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HistoryProvider for StaticHistoryProvider {
    async fn fetch_history(
        &self,
        _asset: AssetType,
        addresses: &[String],
    ) -> Result<Vec<ActivityRecord>, WalletError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let activity = self.activity.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(addresses
            .iter()
            .map(|address| {
                activity.get(address).cloned().unwrap_or_else(|| ActivityRecord {
                    address: address.clone(),
                    ..Default::default()
                })
            })
            .collect())
    }

    async fn fetch_exchange_rates(&self) -> Result<HashMap<AssetType, Decimal>, WalletError> {
        Ok(self.rates.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

/// Provider for running without a network: every call fails as a network error
pub struct OfflineHistoryProvider;

#[async_trait]
impl HistoryProvider for OfflineHistoryProvider {
    async fn fetch_history(
        &self,
        asset: AssetType,
        _addresses: &[String],
    ) -> Result<Vec<ActivityRecord>, WalletError> {
        Err(WalletError::Network(format!("offline: no {} history", asset)))
    }

    async fn fetch_exchange_rates(&self) -> Result<HashMap<AssetType, Decimal>, WalletError> {
        Err(WalletError::Network("offline: no exchange rates".to_string()))
    }
}

// --- Delegate ---

#[derive(Debug, Clone, PartialEq)]
pub enum WalletEvent {
    Loaded { guid: String },
    SyncStarted { asset: Option<AssetType> },
    SyncFinished { asset: Option<AssetType> },
    Upgraded,
    Recovered { guid: String },
    Reloaded,
    Error(WalletError),
}

pub trait WalletDelegate: Send + Sync {
    fn on_event(&self, event: WalletEvent);
}

/// Sends lifecycle events to the log
pub struct LoggingDelegate;

impl WalletDelegate for LoggingDelegate {
    fn on_event(&self, event: WalletEvent) {
        match event {
            WalletEvent::Error(err) => warn!(error = %err, "Wallet error"),
            other => info!(event = ?other, "Wallet event"),
        }
    }
}

/// Keeps every event it receives
#[derive(Default)]
pub struct RecordingDelegate {
    events: Mutex<Vec<WalletEvent>>,
}

impl RecordingDelegate {
    pub fn events(&self) -> Vec<WalletEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl WalletDelegate for RecordingDelegate {
    fn on_event(&self, event: WalletEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_bridge() {
        let bridge = StaticScriptBridge::new().with_response("1 + 1", serde_json::json!(2));
        assert_eq!(bridge.evaluate("1 + 1"), Err(BridgeError::NotLoaded));

        bridge.load().unwrap();
        assert_eq!(bridge.evaluate("1 + 1").unwrap(), serde_json::json!(2));

        bridge.fail_next(1);
        assert!(matches!(
            bridge.evaluate("1 + 1"),
            Err(BridgeError::EvaluationFailed(_))
        ));
        assert!(!bridge.is_loaded());
    }

    #[tokio::test]
    async fn test_memory_metadata_store() {
        let store = MemoryMetadataStore::new();
        assert_eq!(store.fetch("id").await, Err(MetadataError::NotFound));

        store.save("id", b"blob").await.unwrap();
        assert_eq!(store.fetch("id").await.unwrap(), b"blob".to_vec());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_static_history_defaults_to_empty() {
        let provider = StaticHistoryProvider::new();
        provider.set_activity("a", 3, 500);

        let records = provider
            .fetch_history(AssetType::Bitcoin, &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(records[0].tx_count, 3);
        assert_eq!(records[1], ActivityRecord { address: "b".to_string(), tx_count: 0, balance: 0 });
        assert_eq!(provider.history_calls(), 1);
    }
}
