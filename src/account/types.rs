//! Account type definitions

use serde::{Deserialize, Serialize};

use crate::derivation::{AssetType, Chain};

/// Wallet identity, fixed once loaded
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Identity {
    pub guid: String,
    pub shared_key: String,
    pub email: Option<String>,
    /// Cleared after the first successful sync
    pub is_new: bool,
    /// Only ever set from an explicit user confirmation
    pub recovery_phrase_verified: bool,
}

impl Identity {
    /// Fresh identity with random GUID and shared key
    pub fn generate(email: Option<String>) -> Self {
        Self {
            guid: uuid::Uuid::new_v4().to_string(),
            shared_key: uuid::Uuid::new_v4().to_string(),
            email,
            is_new: true,
            recovery_phrase_verified: false,
        }
    }
}

/// A derived address on one account chain
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Address {
    pub asset_type: AssetType,
    pub chain: Chain,
    pub index: u32,
    pub value: String,
}

/// HD account, one per (asset, index)
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub asset_type: AssetType,
    pub index: u32,
    pub label: String,
    pub is_archived: bool,
    pub is_default: bool,
    pub xpub: String,
    pub derived_addresses: Vec<Address>,
}

impl Account {
    /// Account as produced by derivation: unlabelled, active, not default.
    pub fn derived(asset_type: AssetType, index: u32, xpub: String) -> Self {
        Self {
            asset_type,
            index,
            label: String::new(),
            is_archived: false,
            is_default: false,
            xpub,
            derived_addresses: Vec::new(),
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        self.derived_addresses.iter().map(|a| a.value.clone()).collect()
    }

    /// Next unused index on the given chain
    pub fn next_address_index(&self, chain: Chain) -> u32 {
        self.derived_addresses
            .iter()
            .filter(|a| a.chain == chain)
            .map(|a| a.index + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Imported (non-HD) address
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LegacyAddress {
    pub address: String,
    pub label: Option<String>,
    pub is_archived: bool,
    pub is_watch_only: bool,
    /// Balance in the asset's smallest unit as of import/scan
    pub balance: u128,
}

impl LegacyAddress {
    pub fn new(address: String, label: Option<String>, is_watch_only: bool) -> Self {
        Self {
            address,
            label,
            is_archived: false,
            is_watch_only,
            balance: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_generation() {
        let a = Identity::generate(Some("alice@example.com".to_string()));
        let b = Identity::generate(None);

        assert!(a.is_new);
        assert!(!a.recovery_phrase_verified);
        assert_ne!(a.guid, b.guid);
        assert_ne!(a.guid, a.shared_key);
    }

    #[test]
    fn test_next_address_index() {
        let mut account = Account::derived(AssetType::Bitcoin, 0, "xpub".to_string());
        assert_eq!(account.next_address_index(Chain::Receive), 0);

        account.derived_addresses.push(Address {
            asset_type: AssetType::Bitcoin,
            chain: Chain::Receive,
            index: 0,
            value: "1abc".to_string(),
        });
        assert_eq!(account.next_address_index(Chain::Receive), 1);
        assert_eq!(account.next_address_index(Chain::Change), 0);
    }
}
