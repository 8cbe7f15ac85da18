//! Deterministic HD derivation, one implementation per asset ledger.
//!
//! Every deriver is a pure function of `(seed, asset, index)`. Output for a fixed
//! seed must never change between releases: accounts recovered from a mnemonic are
//! only reachable if they derive to the same keys they were funded under.

pub mod btc;
pub mod cashaddr;
pub mod ethereum;
pub mod stellar;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::account::types::{Account, Address};
use crate::error::DerivationError;

pub use self::btc::{BitcoinCashDeriver, BitcoinDeriver};
pub use self::ethereum::EthereumDeriver;
pub use self::stellar::StellarDeriver;

/// Highest index usable at a hardened path level.
pub const HARDENED_MAX: u32 = 0x7FFF_FFFF;

/// Asset ledgers managed under one master seed
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetType {
    Bitcoin,
    BitcoinCash,
    Ethereum,
    Stellar,
}

impl AssetType {
    pub const ALL: [AssetType; 4] = [
        AssetType::Bitcoin,
        AssetType::BitcoinCash,
        AssetType::Ethereum,
        AssetType::Stellar,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            AssetType::Bitcoin => "BTC",
            AssetType::BitcoinCash => "BCH",
            AssetType::Ethereum => "ETH",
            AssetType::Stellar => "XLM",
        }
    }

    /// Decimal places of the smallest unit (satoshi, wei, stroop).
    pub fn decimals(&self) -> u32 {
        match self {
            AssetType::Bitcoin | AssetType::BitcoinCash => 8,
            AssetType::Ethereum => 18,
            AssetType::Stellar => 7,
        }
    }

    pub fn default_label(&self) -> &'static str {
        match self {
            AssetType::Bitcoin => "My Bitcoin Wallet",
            AssetType::BitcoinCash => "My Bitcoin Cash Wallet",
            AssetType::Ethereum => "My Ether Wallet",
            AssetType::Stellar => "My Stellar Wallet",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for AssetType {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "btc" | "bitcoin" => Ok(AssetType::Bitcoin),
            "bch" | "bitcoincash" | "bitcoin-cash" => Ok(AssetType::BitcoinCash),
            "eth" | "ethereum" => Ok(AssetType::Ethereum),
            "xlm" | "stellar" => Ok(AssetType::Stellar),
            _ => Err(format!("Invalid asset: {}. Allowed: btc, bch, eth, xlm", s)),
        }
    }
}

/// Address chain within an account (BIP44 `change` level)
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Chain {
    Receive,
    Change,
}

impl Chain {
    pub fn index(&self) -> u32 {
        match self {
            Chain::Receive => 0,
            Chain::Change => 1,
        }
    }
}

/// Capability set every asset ledger implements
pub trait AssetDeriver: Send + Sync {
    fn asset_type(&self) -> AssetType;

    fn max_account_index(&self) -> u32 {
        HARDENED_MAX
    }

    /// Derive the account at `index`, with its first receive address populated.
    fn derive_account(&self, seed: &[u8], index: u32) -> Result<Account, DerivationError>;

    fn derive_address(
        &self,
        account: &Account,
        chain: Chain,
        index: u32,
    ) -> Result<Address, DerivationError>;

    fn validate_address(&self, address: &str) -> bool;

    fn check_index(&self, index: u32) -> Result<(), DerivationError> {
        let max = self.max_account_index();
        if index > max {
            return Err(DerivationError::IndexOverflow { index, max });
        }
        Ok(())
    }
}

/// Dispatches derivation to the deriver registered for each asset
pub struct DerivationEngine {
    derivers: BTreeMap<AssetType, Box<dyn AssetDeriver>>,
}

impl DerivationEngine {
    /// Engine with every supported asset registered
    pub fn new() -> Self {
        Self::with_assets(&AssetType::ALL)
    }

    pub fn with_assets(assets: &[AssetType]) -> Self {
        let mut derivers: BTreeMap<AssetType, Box<dyn AssetDeriver>> = BTreeMap::new();
        for asset in assets {
            let deriver: Box<dyn AssetDeriver> = match asset {
                AssetType::Bitcoin => Box::new(BitcoinDeriver),
                AssetType::BitcoinCash => Box::new(BitcoinCashDeriver),
                AssetType::Ethereum => Box::new(EthereumDeriver),
                AssetType::Stellar => Box::new(StellarDeriver),
            };
            derivers.insert(*asset, deriver);
        }
        Self { derivers }
    }

    pub fn assets(&self) -> Vec<AssetType> {
        self.derivers.keys().copied().collect()
    }

    pub fn supports(&self, asset: AssetType) -> bool {
        self.derivers.contains_key(&asset)
    }

    fn deriver(&self, asset: AssetType) -> Result<&dyn AssetDeriver, DerivationError> {
        self.derivers
            .get(&asset)
            .map(|d| d.as_ref())
            .ok_or(DerivationError::UnsupportedAssetType(asset))
    }

    pub fn derive_account(
        &self,
        seed: &[u8],
        asset: AssetType,
        index: u32,
    ) -> Result<Account, DerivationError> {
        let deriver = self.deriver(asset)?;
        deriver.check_index(index)?;
        deriver.derive_account(seed, index)
    }

    pub fn derive_address(
        &self,
        account: &Account,
        chain: Chain,
        index: u32,
    ) -> Result<Address, DerivationError> {
        let deriver = self.deriver(account.asset_type)?;
        if index > HARDENED_MAX {
            return Err(DerivationError::IndexOverflow { index, max: HARDENED_MAX });
        }
        deriver.derive_address(account, chain, index)
    }

    pub fn validate_address(&self, asset: AssetType, address: &str) -> Result<bool, DerivationError> {
        Ok(self.deriver(asset)?.validate_address(address))
    }
}

impl Default for DerivationEngine {
    fn default() -> Self {
        Self::new()
    }
}
