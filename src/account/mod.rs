//! Account model for the multi-asset wallet
//!
//! This module holds:
//! - Account, address and identity types
//! - The per-asset account registry (HD accounts + imported legacy addresses)
//! - The balance/activity ledger
//! - Recovery from a recovery phrase

pub mod types;
pub mod registry;
pub mod balance;
pub mod recovery;

pub use types::{Account, Address, Identity, LegacyAddress};
pub use registry::{AccountRegistry, ArchiveTarget, AssetBook, RegistryTable};
pub use balance::{BalanceKey, BalanceLedger, RefreshBatch, RefreshSummary, RefreshTargets};
pub use recovery::{RecoveryCoordinator, RecoveryState, WalletCredentials};
