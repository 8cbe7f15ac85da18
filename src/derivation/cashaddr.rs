//! CashAddr encoding for Bitcoin Cash P2PKH addresses

use bitcoin::hashes::Hash;
use bitcoin::{Address as BtcAddress, Network, PubkeyHash};
use std::str::FromStr;

const PREFIX: &str = "bitcoincash";
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
/// Version byte: P2KH, 160-bit hash
const VERSION_P2KH: u8 = 0x00;

fn polymod(values: &[u8]) -> u64 {
    let mut c: u64 = 1;
    for value in values {
        let c0 = (c >> 35) as u8;
        c = ((c & 0x07_ffff_ffff) << 5) ^ u64::from(*value);
        if c0 & 0x01 != 0 {
            c ^= 0x98_f2bc_8e61;
        }
        if c0 & 0x02 != 0 {
            c ^= 0x79_b76d_99e2;
        }
        if c0 & 0x04 != 0 {
            c ^= 0xf3_3e5f_b3c4;
        }
        if c0 & 0x08 != 0 {
            c ^= 0xae_2eab_e2a8;
        }
        if c0 & 0x10 != 0 {
            c ^= 0x1e_4f43_e470;
        }
    }
    c ^ 1
}

fn prefix_values() -> Vec<u8> {
    let mut values: Vec<u8> = PREFIX.bytes().map(|b| b & 0x1f).collect();
    values.push(0);
    values
}

fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let max = (1u32 << to) - 1;
    let max_acc = (1u32 << (from + to - 1)) - 1;
    let mut out = Vec::new();
    for value in data {
        let v = u32::from(*value);
        if v >> from != 0 {
            return None;
        }
        acc = ((acc << from) | v) & max_acc;
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & max) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & max) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & max) != 0 {
        return None;
    }
    Some(out)
}

/// Encode a 20-byte public key hash as `bitcoincash:q…`
pub fn encode(hash: &[u8; 20]) -> String {
    let mut payload = vec![VERSION_P2KH];
    payload.extend_from_slice(hash);
    // 8 -> 5 bit conversion with padding cannot fail
    let data = convert_bits(&payload, 8, 5, true).unwrap_or_default();

    let mut checked = prefix_values();
    checked.extend_from_slice(&data);
    checked.extend_from_slice(&[0u8; 8]);
    let checksum = polymod(&checked);

    let mut out = String::with_capacity(PREFIX.len() + 1 + data.len() + 8);
    out.push_str(PREFIX);
    out.push(':');
    for v in &data {
        out.push(CHARSET[*v as usize] as char);
    }
    for i in 0..8 {
        let v = ((checksum >> (5 * (7 - i))) & 0x1f) as usize;
        out.push(CHARSET[v] as char);
    }
    out
}

/// Decode a CashAddr P2PKH address to its public key hash.
/// The `bitcoincash:` prefix is optional; mixed case is rejected.
pub fn decode(address: &str) -> Option<[u8; 20]> {
    let has_lower = address.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = address.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return None;
    }
    let lowered = address.to_ascii_lowercase();
    let body = match lowered.split_once(':') {
        Some((prefix, body)) if prefix == PREFIX => body,
        Some(_) => return None,
        None => lowered.as_str(),
    };

    let mut values = Vec::with_capacity(body.len());
    for c in body.bytes() {
        let pos = CHARSET.iter().position(|x| *x == c)?;
        values.push(pos as u8);
    }
    if values.len() < 8 {
        return None;
    }

    let mut checked = prefix_values();
    checked.extend_from_slice(&values);
    if polymod(&checked) != 0 {
        return None;
    }

    let data = &values[..values.len() - 8];
    let payload = convert_bits(data, 5, 8, false)?;
    if payload.len() != 21 || payload[0] != VERSION_P2KH {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    Some(hash)
}

/// Legacy base58 P2PKH -> CashAddr
pub fn from_legacy(legacy: &str) -> Option<String> {
    let address = BtcAddress::from_str(legacy)
        .ok()?
        .require_network(Network::Bitcoin)
        .ok()?;
    let hash = address.pubkey_hash()?;
    Some(encode(&hash.to_byte_array()))
}

/// CashAddr -> legacy base58 P2PKH
pub fn to_legacy(cashaddr: &str) -> Option<String> {
    let hash = decode(cashaddr)?;
    let address = BtcAddress::p2pkh(PubkeyHash::from_byte_array(hash), Network::Bitcoin);
    Some(address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_vector() {
        let cash = from_legacy("1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu").unwrap();
        assert_eq!(cash, "bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a");

        let legacy = to_legacy("bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").unwrap();
        assert_eq!(legacy, "1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu");
    }

    #[test]
    fn test_prefix_optional_and_case() {
        assert!(decode("qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").is_some());
        assert!(decode("BITCOINCASH:QPM2QSZNHKS23Z7629MMS6S4CWEF74VCWVY22GDX6A").is_some());
        assert!(decode("bitcoincash:QPM2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").is_none());
    }

    #[test]
    fn test_checksum_rejects_typo() {
        assert!(decode("bitcoincash:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6b").is_none());
        assert!(decode("bchtest:qpm2qsznhks23z7629mms6s4cwef74vcwvy22gdx6a").is_none());
    }
}
