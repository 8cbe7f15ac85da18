//! BIP44 derivation for Bitcoin and Bitcoin Cash

use bitcoin::bip32::{ChildNumber, Xpriv, Xpub};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Address as BtcAddress, Network};
use std::str::FromStr;

use super::{cashaddr, AssetDeriver, AssetType, Chain};
use crate::account::types::{Account, Address};
use crate::error::DerivationError;

const PURPOSE: u32 = 44;
const BITCOIN_COIN_TYPE: u32 = 0;

fn backend<E: std::fmt::Display>(e: E) -> DerivationError {
    DerivationError::Backend(e.to_string())
}

/// Account-level xpub at `m/purpose'/coin_type'/index'`
pub(crate) fn account_xpub(
    seed: &[u8],
    coin_type: u32,
    index: u32,
) -> Result<Xpub, DerivationError> {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(Network::Bitcoin, seed).map_err(backend)?;
    let path = [
        ChildNumber::from_hardened_idx(PURPOSE).map_err(backend)?,
        ChildNumber::from_hardened_idx(coin_type).map_err(backend)?,
        ChildNumber::from_hardened_idx(index).map_err(backend)?,
    ];
    let account_key = master.derive_priv(&secp, &path).map_err(backend)?;
    Ok(Xpub::from_priv(&secp, &account_key))
}

/// Public child at `chain/index` below an account xpub
pub(crate) fn child_pubkey(
    xpub: &str,
    chain: Chain,
    index: u32,
) -> Result<bitcoin::secp256k1::PublicKey, DerivationError> {
    let xpub = Xpub::from_str(xpub).map_err(backend)?;
    let secp = Secp256k1::new();
    let path = [
        ChildNumber::from_normal_idx(chain.index()).map_err(backend)?,
        ChildNumber::from_normal_idx(index).map_err(backend)?,
    ];
    let derived = xpub.derive_pub(&secp, &path).map_err(backend)?;
    Ok(derived.public_key)
}

fn p2pkh(xpub: &str, chain: Chain, index: u32) -> Result<BtcAddress, DerivationError> {
    let pubkey = CompressedPublicKey(child_pubkey(xpub, chain, index)?);
    Ok(BtcAddress::p2pkh(pubkey.pubkey_hash(), Network::Bitcoin))
}

fn derive_with<F>(
    asset: AssetType,
    seed: &[u8],
    index: u32,
    render: F,
) -> Result<Account, DerivationError>
where
    F: Fn(&str, Chain, u32) -> Result<String, DerivationError>,
{
    let xpub = account_xpub(seed, BITCOIN_COIN_TYPE, index)?.to_string();
    let first = render(&xpub, Chain::Receive, 0)?;
    let mut account = Account::derived(asset, index, xpub);
    account.derived_addresses.push(Address {
        asset_type: asset,
        chain: Chain::Receive,
        index: 0,
        value: first,
    });
    Ok(account)
}

/// Bitcoin: `m/44'/0'/n'`, P2PKH addresses
pub struct BitcoinDeriver;

impl BitcoinDeriver {
    fn render(xpub: &str, chain: Chain, index: u32) -> Result<String, DerivationError> {
        Ok(p2pkh(xpub, chain, index)?.to_string())
    }
}

impl AssetDeriver for BitcoinDeriver {
    fn asset_type(&self) -> AssetType {
        AssetType::Bitcoin
    }

    fn derive_account(&self, seed: &[u8], index: u32) -> Result<Account, DerivationError> {
        derive_with(AssetType::Bitcoin, seed, index, Self::render)
    }

    fn derive_address(
        &self,
        account: &Account,
        chain: Chain,
        index: u32,
    ) -> Result<Address, DerivationError> {
        Ok(Address {
            asset_type: AssetType::Bitcoin,
            chain,
            index,
            value: Self::render(&account.xpub, chain, index)?,
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        BtcAddress::from_str(address)
            .map(|a| a.require_network(Network::Bitcoin).is_ok())
            .unwrap_or(false)
    }
}

/// Bitcoin Cash: mirrors the Bitcoin account xpubs, CashAddr rendering
pub struct BitcoinCashDeriver;

impl BitcoinCashDeriver {
    fn render(xpub: &str, chain: Chain, index: u32) -> Result<String, DerivationError> {
        let legacy = p2pkh(xpub, chain, index)?;
        cashaddr::from_legacy(&legacy.to_string())
            .ok_or_else(|| DerivationError::Backend("cashaddr encoding failed".to_string()))
    }
}

impl AssetDeriver for BitcoinCashDeriver {
    fn asset_type(&self) -> AssetType {
        AssetType::BitcoinCash
    }

    fn derive_account(&self, seed: &[u8], index: u32) -> Result<Account, DerivationError> {
        derive_with(AssetType::BitcoinCash, seed, index, Self::render)
    }

    fn derive_address(
        &self,
        account: &Account,
        chain: Chain,
        index: u32,
    ) -> Result<Address, DerivationError> {
        Ok(Address {
            asset_type: AssetType::BitcoinCash,
            chain,
            index,
            value: Self::render(&account.xpub, chain, index)?,
        })
    }

    fn validate_address(&self, address: &str) -> bool {
        cashaddr::decode(address).is_some()
    }
}
