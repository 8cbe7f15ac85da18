use thiserror::Error;

use crate::derivation::AssetType;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("wrong password")]
    WrongPassword,
    #[error("second password required")]
    SecondPasswordRequired,
    #[error("secret material failed its integrity check")]
    Corrupt,
    #[error("shared key does not match wallet")]
    InvalidSharedKey,
    #[error("retained seed guard has expired")]
    GuardExpired,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("password is too weak (score {score:.2}, minimum {minimum:.2})")]
    WeakPassword { score: f32, minimum: f32 },
    #[error("invalid label: {0:?}")]
    InvalidLabel(String),
    #[error("second password must differ from the main password")]
    SameAsMainPassword,
    #[error("invalid {asset} address: {address}")]
    InvalidAddress { asset: AssetType, address: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("wallet already upgraded to HD")]
    AlreadyUpgraded,
    #[error("wallet not initialized")]
    NotInitialized,
    #[error("unknown {asset} account {index}")]
    UnknownAccount { asset: AssetType, index: u32 },
    #[error("unknown {asset} address {address}")]
    UnknownAddress { asset: AssetType, address: String },
    #[error("{asset} address {address} already imported")]
    DuplicateAddress { asset: AssetType, address: String },
    #[error("wallet has not been upgraded to HD")]
    NotUpgraded,
    #[error("the default {asset} account cannot be archived")]
    DefaultAccountArchive { asset: AssetType },
    #[error("archived {asset} account {index} cannot become the default")]
    ArchivedDefault { asset: AssetType, index: u32 },
    #[error("second password already set")]
    SecondPasswordAlreadySet,
    #[error("no second password set")]
    SecondPasswordNotSet,
    #[error("cannot {operation} while {state}")]
    InvalidTransition { operation: &'static str, state: String },
    #[error("no stored wallet for guid {0}")]
    UnknownWallet(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("mnemonic failed checksum validation")]
    InvalidMnemonic,
    #[error("no metadata backup found for this mnemonic")]
    NoMetadata,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("script evaluation failed: {0}")]
    EvaluationFailed(String),
    #[error("scripting bridge not loaded")]
    NotLoaded,
    #[error("scripting bridge failed to load: {0}")]
    LoadFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DerivationError {
    #[error("unsupported asset type {0}")]
    UnsupportedAssetType(AssetType),
    #[error("index {index} exceeds maximum {max}")]
    IndexOverflow { index: u32, max: u32 },
    #[error("{asset} does not derive {chain:?}/{index}")]
    UnsupportedPath { asset: AssetType, chain: crate::derivation::Chain, index: u32 },
    #[error("derivation backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WalletError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("metadata error: {0}")]
    Metadata(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl WalletError {
    /// Transient failures worth another attempt after a reset.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Bridge(BridgeError::EvaluationFailed(_))
        )
    }
}

pub type WalletResult<T> = Result<T, WalletError>;
