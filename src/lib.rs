pub mod error;
pub mod config;
pub mod derivation;
pub mod secret;
pub mod account;
pub mod rates;
pub mod external;
pub mod storage;
pub mod session;
pub mod cli;

pub use error::{WalletError, WalletResult};
pub use session::{PendingOperation, ReloadOutcome, SessionState, WalletSession};
