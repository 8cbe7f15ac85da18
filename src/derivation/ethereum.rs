//! Ethereum accounts: `m/44'/60'/n'`, EIP-55 checksummed addresses

use sha3::{Digest, Keccak256};

use super::btc::{account_xpub, child_pubkey};
use super::{AssetDeriver, AssetType, Chain};
use crate::account::types::{Account, Address};
use crate::error::DerivationError;

const ETHEREUM_COIN_TYPE: u32 = 60;

fn keccak(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// EIP-55 mixed-case rendering of a 20-byte address
pub fn checksum_address(raw: &[u8; 20]) -> String {
    let lower = hex::encode(raw);
    let hash = keccak(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn address_from_xpub(xpub: &str, chain: Chain, index: u32) -> Result<String, DerivationError> {
    let pubkey = child_pubkey(xpub, chain, index)?;
    let uncompressed = pubkey.serialize_uncompressed();
    let hash = keccak(&uncompressed[1..]);
    let mut raw = [0u8; 20];
    raw.copy_from_slice(&hash[12..]);
    Ok(checksum_address(&raw))
}

pub struct EthereumDeriver;

impl AssetDeriver for EthereumDeriver {
    fn asset_type(&self) -> AssetType {
        AssetType::Ethereum
    }

    fn derive_account(&self, seed: &[u8], index: u32) -> Result<Account, DerivationError> {
        let xpub = account_xpub(seed, ETHEREUM_COIN_TYPE, index)?.to_string();
        let first = address_from_xpub(&xpub, Chain::Receive, 0)?;
        let mut account = Account::derived(AssetType::Ethereum, index, xpub);
        account.derived_addresses.push(Address {
            asset_type: AssetType::Ethereum,
            chain: Chain::Receive,
            index: 0,
            value: first,
        });
        Ok(account)
    }

    fn derive_address(
        &self,
        account: &Account,
        chain: Chain,
        index: u32,
    ) -> Result<Address, DerivationError> {
        Ok(Address {
            asset_type: AssetType::Ethereum,
            chain,
            index,
            value: address_from_xpub(&account.xpub, chain, index)?,
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        let Some(body) = address.strip_prefix("0x") else {
            return false;
        };
        let Ok(bytes) = hex::decode(body) else {
            return false;
        };
        let Ok(raw) = <[u8; 20]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let all_lower = body.chars().all(|c| !c.is_ascii_uppercase());
        let all_upper = body.chars().all(|c| !c.is_ascii_lowercase());
        // Single-case addresses carry no checksum
        all_lower || all_upper || checksum_address(&raw) == address
    }
}
