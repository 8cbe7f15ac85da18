//! Exchange-rate cache and unit conversion

use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::derivation::AssetType;

/// Whole-unit value of an amount given in the asset's smallest unit.
/// `None` when the amount does not fit a `Decimal` mantissa.
pub fn to_decimal(asset: AssetType, atomic: u128) -> Option<Decimal> {
    let mantissa = i128::try_from(atomic).ok()?;
    Decimal::try_from_i128_with_scale(mantissa, asset.decimals()).ok()
}

/// Last fetched fiat rate per asset
#[derive(Default)]
pub struct RateCache {
    rates: RwLock<HashMap<AssetType, Decimal>>,
}

impl RateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached rates with a fresh fetch
    pub fn update(&self, rates: HashMap<AssetType, Decimal>) {
        *self.rates.write().unwrap_or_else(PoisonError::into_inner) = rates;
    }

    pub fn rate(&self, asset: AssetType) -> Option<Decimal> {
        self.rates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&asset)
            .copied()
    }

    pub fn fiat_value(&self, asset: AssetType, atomic: u128) -> Option<Decimal> {
        let rate = self.rate(asset)?;
        to_decimal(asset, atomic)?.checked_mul(rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_to_decimal_per_asset() {
        assert_eq!(
            to_decimal(AssetType::Bitcoin, 150_000_000),
            Some(Decimal::from_str("1.5").unwrap())
        );
        assert_eq!(
            to_decimal(AssetType::Stellar, 10_000_000),
            Some(Decimal::from_str("1").unwrap())
        );
        assert_eq!(
            to_decimal(AssetType::Ethereum, 2_000_000_000_000_000_000),
            Some(Decimal::from_str("2").unwrap())
        );
        assert_eq!(to_decimal(AssetType::Ethereum, u128::MAX), None);
    }

    #[test]
    fn test_fiat_value() {
        let cache = RateCache::new();
        assert_eq!(cache.fiat_value(AssetType::Bitcoin, 100_000_000), None);

        let mut rates = HashMap::new();
        rates.insert(AssetType::Bitcoin, Decimal::from(30_000));
        cache.update(rates);

        assert_eq!(
            cache.fiat_value(AssetType::Bitcoin, 50_000_000),
            Some(Decimal::from(15_000))
        );
    }
}
