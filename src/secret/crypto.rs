//! Password hashing and symmetric encryption for wallet secrets

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use hmac::Hmac;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::AuthError;

const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 16;

/// Work factors for password hashing and key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub pbkdf2_iterations: u32,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: 100_000,
            argon2_memory_kib: Params::DEFAULT_M_COST,
            argon2_iterations: Params::DEFAULT_T_COST,
        }
    }
}

impl KdfParams {
    fn argon2(&self) -> Result<Argon2<'static>, AuthError> {
        let params = Params::new(self.argon2_memory_kib, self.argon2_iterations, 1, None)
            .map_err(|_| AuthError::Corrupt)?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

pub fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Hash a password using Argon2id, PHC string output
pub fn hash_password(password: &str, params: &KdfParams) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = params
        .argon2()?
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| AuthError::Corrupt)?
        .to_string();
    Ok(hash)
}

/// Verify a password against a PHC hash; parameters come from the hash itself
pub fn verify_password(password: &str, password_hash: &str) -> Result<(), AuthError> {
    let parsed = PasswordHash::new(password_hash).map_err(|_| AuthError::Corrupt)?;
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .map_err(|_| AuthError::WrongPassword)
}

/// Derive a 256-bit encryption key from a password and salt
pub fn derive_encryption_key(password: &str, salt: &[u8], iterations: u32) -> Zeroizing<[u8; 32]> {
    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, iterations, key.as_mut());
    key
}

/// AES-256-GCM, output is `nonce || ciphertext`
pub fn encrypt_with_key(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AuthError::Corrupt)?;

    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, data).map_err(|_| AuthError::Corrupt)?;

    let mut result = nonce_bytes.to_vec();
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

pub fn decrypt_with_key(key: &[u8; 32], encrypted: &[u8]) -> Result<Zeroizing<Vec<u8>>, AuthError> {
    if encrypted.len() < NONCE_LEN {
        return Err(AuthError::Corrupt);
    }
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AuthError::Corrupt)?;

    let nonce = Nonce::from_slice(&encrypted[..NONCE_LEN]);
    let ciphertext = &encrypted[NONCE_LEN..];

    cipher
        .decrypt(nonce, ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| AuthError::Corrupt)
}

/// Password-keyed encryption
pub fn encrypt_data(
    data: &[u8],
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Vec<u8>, AuthError> {
    let key = derive_encryption_key(password, salt, iterations);
    encrypt_with_key(&key, data)
}

/// Password-keyed decryption; an authentication failure reads as a wrong password
pub fn decrypt_data(
    encrypted: &[u8],
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<Zeroizing<Vec<u8>>, AuthError> {
    let key = derive_encryption_key(password, salt, iterations);
    decrypt_with_key(&key, encrypted).map_err(|_| AuthError::WrongPassword)
}
