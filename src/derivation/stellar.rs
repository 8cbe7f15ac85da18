//! Stellar accounts: SLIP-10 ed25519 at `m/44'/148'/n'`
//!
//! Every level is hardened, so there is no extended public key. Each account owns a
//! single keypair and its StrKey (`G…`) doubles as the account's xpub.

use crc::{Crc, CRC_16_XMODEM};
use ed25519_dalek::SigningKey;
use hmac::{Hmac, Mac};
use sha2::Sha512;
use zeroize::Zeroizing;

use super::{AssetDeriver, AssetType, Chain};
use crate::account::types::{Account, Address};
use crate::error::DerivationError;

const HARDENED_OFFSET: u32 = 0x8000_0000;
const STELLAR_COIN_TYPE: u32 = 148;
/// StrKey version byte for ed25519 public keys ('G')
const VERSION_ACCOUNT_ID: u8 = 6 << 3;
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

type HmacSha512 = Hmac<Sha512>;

struct Slip10Node {
    key: Zeroizing<[u8; 32]>,
    chain_code: Zeroizing<[u8; 32]>,
}

impl Slip10Node {
    fn split(bytes: &[u8]) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        let mut chain_code = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&bytes[..32]);
        chain_code.copy_from_slice(&bytes[32..64]);
        Self { key, chain_code }
    }

    fn master(seed: &[u8]) -> Result<Self, DerivationError> {
        let mut mac = HmacSha512::new_from_slice(b"ed25519 seed")
            .map_err(|e| DerivationError::Backend(e.to_string()))?;
        mac.update(seed);
        let mut out = Zeroizing::new([0u8; 64]);
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Self::split(out.as_ref()))
    }

    fn hardened_child(&self, index: u32) -> Result<Self, DerivationError> {
        let mut mac = HmacSha512::new_from_slice(self.chain_code.as_ref())
            .map_err(|e| DerivationError::Backend(e.to_string()))?;
        mac.update(&[0u8]);
        mac.update(self.key.as_ref());
        mac.update(&(index | HARDENED_OFFSET).to_be_bytes());
        let mut out = Zeroizing::new([0u8; 64]);
        out.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Self::split(out.as_ref()))
    }
}

/// Encode an ed25519 public key as a Stellar account id
pub fn encode_account_id(public_key: &[u8; 32]) -> String {
    let mut payload = Vec::with_capacity(35);
    payload.push(VERSION_ACCOUNT_ID);
    payload.extend_from_slice(public_key);
    let checksum = CRC16.checksum(&payload);
    payload.extend_from_slice(&checksum.to_le_bytes());
    base32::encode(base32::Alphabet::RFC4648 { padding: false }, &payload)
}

/// Decode a `G…` account id back to its public key
pub fn decode_account_id(account_id: &str) -> Option<[u8; 32]> {
    let payload = base32::decode(base32::Alphabet::RFC4648 { padding: false }, account_id)?;
    if payload.len() != 35 || payload[0] != VERSION_ACCOUNT_ID {
        return None;
    }
    let (body, checksum) = payload.split_at(33);
    if CRC16.checksum(body).to_le_bytes() != checksum {
        return None;
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&body[1..]);
    Some(key)
}

pub struct StellarDeriver;

impl StellarDeriver {
    fn account_id(seed: &[u8], index: u32) -> Result<String, DerivationError> {
        let node = Slip10Node::master(seed)?
            .hardened_child(44)?
            .hardened_child(STELLAR_COIN_TYPE)?
            .hardened_child(index)?;
        let signing = SigningKey::from_bytes(&node.key);
        Ok(encode_account_id(&signing.verifying_key().to_bytes()))
    }
}

impl AssetDeriver for StellarDeriver {
    fn asset_type(&self) -> AssetType {
        AssetType::Stellar
    }

    fn derive_account(&self, seed: &[u8], index: u32) -> Result<Account, DerivationError> {
        let account_id = Self::account_id(seed, index)?;
        let mut account = Account::derived(AssetType::Stellar, index, account_id.clone());
        account.derived_addresses.push(Address {
            asset_type: AssetType::Stellar,
            chain: Chain::Receive,
            index: 0,
            value: account_id,
        });
        Ok(account)
    }

    fn derive_address(
        &self,
        account: &Account,
        chain: Chain,
        index: u32,
    ) -> Result<Address, DerivationError> {
        if chain != Chain::Receive || index != 0 {
            return Err(DerivationError::UnsupportedPath {
                asset: AssetType::Stellar,
                chain,
                index,
            });
        }
        Ok(Address {
            asset_type: AssetType::Stellar,
            chain,
            index,
            value: account.xpub.clone(),
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        decode_account_id(address).is_some()
    }
}
