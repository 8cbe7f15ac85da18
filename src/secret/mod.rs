//! Master secret custody
//!
//! The store owns the wallet's BIP39 entropy once unlocked. Persisted form is
//! [`SealedSecrets`]: an argon2 verifier for the main password plus an AES-GCM
//! envelope keyed from it. When a second password is set, the entropy inside the
//! envelope is itself encrypted under the second password and every read of
//! seed material has to present it.

pub mod crypto;
pub mod strength;

use bip39::Mnemonic;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::{Zeroize, Zeroizing};

use crate::error::{AuthError, StateError, ValidationError, WalletError, WalletResult};

pub use crypto::KdfParams;
pub use strength::strength_of;

/// Encrypted secret material as persisted with the wallet payload
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SealedSecrets {
    pub password_hash: String,
    pub salt: Vec<u8>,
    pub pbkdf2_iterations: u32,
    pub ciphertext: Vec<u8>,
    pub second_password_hash: Option<String>,
    pub second_password_salt: Option<Vec<u8>>,
}

/// Plaintext of `SealedSecrets::ciphertext`
#[derive(Serialize, Deserialize, Default, Clone)]
struct Envelope {
    entropy: Option<Vec<u8>>,
    double_encrypted_entropy: Option<Vec<u8>>,
}

impl Drop for Envelope {
    fn drop(&mut self) {
        self.entropy.zeroize();
    }
}

#[derive(Clone)]
struct SecondPassword {
    hash: String,
    salt: Vec<u8>,
}

#[derive(Clone)]
struct Unlocked {
    password_hash: String,
    salt: Vec<u8>,
    iterations: u32,
    key: Zeroizing<[u8; 32]>,
    envelope: Envelope,
    ciphertext: Vec<u8>,
    second: Option<SecondPassword>,
}

fn seal_envelope(key: &[u8; 32], envelope: &Envelope) -> Result<Vec<u8>, AuthError> {
    let plain = Zeroizing::new(serde_json::to_vec(envelope).map_err(|_| AuthError::Corrupt)?);
    crypto::encrypt_with_key(key, &plain)
}

impl Unlocked {
    fn sealed(&self) -> SealedSecrets {
        SealedSecrets {
            password_hash: self.password_hash.clone(),
            salt: self.salt.clone(),
            pbkdf2_iterations: self.iterations,
            ciphertext: self.ciphertext.clone(),
            second_password_hash: self.second.as_ref().map(|s| s.hash.clone()),
            second_password_salt: self.second.as_ref().map(|s| s.salt.clone()),
        }
    }

    fn has_entropy(&self) -> bool {
        self.envelope.entropy.is_some() || self.envelope.double_encrypted_entropy.is_some()
    }

    /// Second-password gate. Missing and wrong candidates fail the same way.
    fn check_second(&self, candidate: Option<&str>) -> Result<(), AuthError> {
        if let Some(second) = &self.second {
            let candidate = candidate.ok_or(AuthError::SecondPasswordRequired)?;
            crypto::verify_password(candidate, &second.hash)
                .map_err(|_| AuthError::SecondPasswordRequired)?;
        }
        Ok(())
    }

    fn entropy(&self, second_password: Option<&str>) -> WalletResult<Zeroizing<Vec<u8>>> {
        self.check_second(second_password)?;
        match (&self.second, second_password) {
            (Some(second), Some(candidate)) => {
                let double = self
                    .envelope
                    .double_encrypted_entropy
                    .as_ref()
                    .ok_or(StateError::NotUpgraded)?;
                let entropy = crypto::decrypt_data(double, candidate, &second.salt, self.iterations)
                    .map_err(|_| AuthError::Corrupt)?;
                Ok(entropy)
            }
            _ => self
                .envelope
                .entropy
                .as_ref()
                .map(|e| Zeroizing::new(e.clone()))
                .ok_or_else(|| WalletError::from(StateError::NotUpgraded)),
        }
    }

    fn commit(&mut self, envelope: Envelope) -> Result<(), AuthError> {
        self.ciphertext = seal_envelope(&self.key, &envelope)?;
        self.envelope = envelope;
        Ok(())
    }
}

/// Copy of the store's unlocked state, put back with [`SecretStore::restore`]
pub struct SecretSnapshot(Option<Unlocked>);

/// Seed bytes retained past a single call, unusable once `expires_at` passes
pub struct SeedGuard {
    seed: Zeroizing<[u8; 64]>,
    expires_at: Instant,
}

impl SeedGuard {
    pub fn seed(&self) -> Result<&[u8; 64], AuthError> {
        if self.is_expired() {
            return Err(AuthError::GuardExpired);
        }
        Ok(&self.seed)
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub struct SecretStore {
    params: KdfParams,
    min_password_strength: f32,
    state: RwLock<Option<Unlocked>>,
}

impl SecretStore {
    pub fn new(params: KdfParams, min_password_strength: f32) -> Self {
        Self {
            params,
            min_password_strength,
            state: RwLock::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Unlocked>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Unlocked>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn min_password_strength(&self) -> f32 {
        self.min_password_strength
    }

    pub fn check_strength(&self, password: &str) -> Result<(), ValidationError> {
        let score = strength_of(password);
        if score < self.min_password_strength {
            return Err(ValidationError::WeakPassword {
                score,
                minimum: self.min_password_strength,
            });
        }
        Ok(())
    }

    /// Create fresh secret material. `None` entropy produces a legacy (pre-HD) wallet.
    pub fn initialize(&self, password: &str, entropy: Option<&[u8]>) -> WalletResult<SealedSecrets> {
        self.check_strength(password)?;

        let salt = crypto::random_salt();
        let key = crypto::derive_encryption_key(password, &salt, self.params.pbkdf2_iterations);
        let envelope = Envelope {
            entropy: entropy.map(<[u8]>::to_vec),
            double_encrypted_entropy: None,
        };
        let ciphertext = seal_envelope(&key, &envelope)?;

        let unlocked = Unlocked {
            password_hash: crypto::hash_password(password, &self.params)?,
            salt,
            iterations: self.params.pbkdf2_iterations,
            key,
            envelope,
            ciphertext,
            second: None,
        };
        let sealed = unlocked.sealed();
        *self.write() = Some(unlocked);

        info!(hd = entropy.is_some(), "Secret store initialized");
        Ok(sealed)
    }

    /// Decrypt persisted material into the store.
    pub fn unlock(&self, sealed: &SealedSecrets, password: &str) -> Result<(), AuthError> {
        crypto::verify_password(password, &sealed.password_hash)?;

        let key = crypto::derive_encryption_key(password, &sealed.salt, sealed.pbkdf2_iterations);
        let plain = crypto::decrypt_with_key(&key, &sealed.ciphertext)?;
        let envelope: Envelope = serde_json::from_slice(&plain).map_err(|_| AuthError::Corrupt)?;

        let second = match (&sealed.second_password_hash, &sealed.second_password_salt) {
            (Some(hash), Some(salt)) => Some(SecondPassword {
                hash: hash.clone(),
                salt: salt.clone(),
            }),
            (None, None) => None,
            _ => return Err(AuthError::Corrupt),
        };
        let consistent = match second {
            Some(_) => envelope.entropy.is_none(),
            None => envelope.double_encrypted_entropy.is_none(),
        };
        if !consistent {
            return Err(AuthError::Corrupt);
        }

        *self.write() = Some(Unlocked {
            password_hash: sealed.password_hash.clone(),
            salt: sealed.salt.clone(),
            iterations: sealed.pbkdf2_iterations,
            key,
            envelope,
            ciphertext: sealed.ciphertext.clone(),
            second,
        });
        debug!("Secret store unlocked");
        Ok(())
    }

    pub fn seal(&self) -> WalletResult<SealedSecrets> {
        let guard = self.read();
        let unlocked = guard.as_ref().ok_or(StateError::NotInitialized)?;
        Ok(unlocked.sealed())
    }

    pub fn snapshot(&self) -> SecretSnapshot {
        SecretSnapshot(self.read().clone())
    }

    /// Return to the state captured by `snapshot`
    pub fn restore(&self, snapshot: SecretSnapshot) {
        *self.write() = snapshot.0;
    }

    /// Drop all decrypted material
    pub fn clear(&self) {
        *self.write() = None;
    }

    pub fn is_initialized(&self) -> bool {
        self.read().is_some()
    }

    pub fn has_entropy(&self) -> bool {
        self.read().as_ref().map(Unlocked::has_entropy).unwrap_or(false)
    }

    pub fn needs_second_password(&self) -> bool {
        self.read()
            .as_ref()
            .map(|u| u.second.is_some())
            .unwrap_or(false)
    }

    pub fn validate_second_password(&self, candidate: &str) -> bool {
        match self.read().as_ref().and_then(|u| u.second.as_ref()) {
            Some(second) => crypto::verify_password(candidate, &second.hash).is_ok(),
            None => false,
        }
    }

    pub fn set_second_password(&self, candidate: &str) -> WalletResult<()> {
        let mut guard = self.write();
        let unlocked = guard.as_mut().ok_or(StateError::NotInitialized)?;
        if unlocked.second.is_some() {
            return Err(StateError::SecondPasswordAlreadySet.into());
        }
        self.check_strength(candidate)?;
        if crypto::verify_password(candidate, &unlocked.password_hash).is_ok() {
            return Err(ValidationError::SameAsMainPassword.into());
        }

        let salt = crypto::random_salt();
        let double_encrypted_entropy = match unlocked.envelope.entropy.as_deref() {
            Some(entropy) => Some(crypto::encrypt_data(
                entropy,
                candidate,
                &salt,
                unlocked.iterations,
            )?),
            None => None,
        };
        let hash = crypto::hash_password(candidate, &self.params)?;

        unlocked.commit(Envelope {
            entropy: None,
            double_encrypted_entropy,
        })?;
        unlocked.second = Some(SecondPassword { hash, salt });

        info!("Second password enabled");
        Ok(())
    }

    pub fn remove_second_password(&self, current: &str) -> WalletResult<()> {
        let mut guard = self.write();
        let unlocked = guard.as_mut().ok_or(StateError::NotInitialized)?;
        if unlocked.second.is_none() {
            return Err(StateError::SecondPasswordNotSet.into());
        }
        unlocked.check_second(Some(current))?;

        let entropy = if unlocked.envelope.double_encrypted_entropy.is_some() {
            Some(unlocked.entropy(Some(current))?.to_vec())
        } else {
            None
        };
        unlocked.commit(Envelope {
            entropy,
            double_encrypted_entropy: None,
        })?;
        unlocked.second = None;

        info!("Second password removed");
        Ok(())
    }

    /// Give a legacy wallet its HD entropy. One-way.
    pub fn install_entropy(&self, entropy: &[u8], second_password: Option<&str>) -> WalletResult<()> {
        let mut guard = self.write();
        let unlocked = guard.as_mut().ok_or(StateError::NotInitialized)?;
        if unlocked.has_entropy() {
            return Err(StateError::AlreadyUpgraded.into());
        }
        unlocked.check_second(second_password)?;

        let envelope = match (&unlocked.second, second_password) {
            (Some(second), Some(candidate)) => Envelope {
                entropy: None,
                double_encrypted_entropy: Some(crypto::encrypt_data(
                    entropy,
                    candidate,
                    &second.salt,
                    unlocked.iterations,
                )?),
            },
            _ => Envelope {
                entropy: Some(entropy.to_vec()),
                double_encrypted_entropy: None,
            },
        };
        unlocked.commit(envelope)?;
        Ok(())
    }

    /// Recovery phrase words, in order
    pub fn mnemonic(&self, second_password: Option<&str>) -> WalletResult<Vec<String>> {
        let entropy = {
            let guard = self.read();
            let unlocked = guard.as_ref().ok_or(StateError::NotInitialized)?;
            unlocked.entropy(second_password)?
        };
        let mnemonic = Mnemonic::from_entropy(&entropy).map_err(|_| AuthError::Corrupt)?;
        Ok(mnemonic.words().map(str::to_string).collect())
    }

    fn seed(&self, second_password: Option<&str>) -> WalletResult<Zeroizing<[u8; 64]>> {
        let entropy = {
            let guard = self.read();
            let unlocked = guard.as_ref().ok_or(StateError::NotInitialized)?;
            unlocked.entropy(second_password)?
        };
        let mnemonic = Mnemonic::from_entropy(&entropy).map_err(|_| AuthError::Corrupt)?;
        Ok(Zeroizing::new(mnemonic.to_seed("")))
    }

    /// Run `f` with the BIP39 seed; the seed is wiped when `f` returns.
    pub fn with_seed<R>(
        &self,
        second_password: Option<&str>,
        f: impl FnOnce(&[u8; 64]) -> R,
    ) -> WalletResult<R> {
        let seed = self.seed(second_password)?;
        Ok(f(&seed))
    }

    pub fn retain_seed(&self, second_password: Option<&str>, ttl: Duration) -> WalletResult<SeedGuard> {
        Ok(SeedGuard {
            seed: self.seed(second_password)?,
            expires_at: Instant::now() + ttl,
        })
    }
}
