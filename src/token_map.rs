//! Cross-chain token identity and decimal-unit conversion
//!
//! Token identities are 32-byte values on both sides (EVM addresses are
//! left-padded); lookups are keyed by the lowercase hex form. An all-zero
//! identity denotes the chain's native asset.
//!
//! Conversion scales by `10^(decimals_out - decimals_in)`. Converting to
//! fewer decimals floors the result: the truncated remainder ("dust") is
//! deliberate behavior and is reported so callers can log it. The dust is
//! never minted on the destination side; it stays in the origin escrow.

#![allow(dead_code)]

use alloy::primitives::U256;
use eyre::{eyre, Result};

/// Direction of a unit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertDirection {
    OriginToDest,
    DestToOrigin,
}

/// One origin↔destination token pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenMapping {
    /// Lowercase `0x` + 64 hex, origin-chain identity.
    pub origin: String,
    /// Lowercase `0x` + 64 hex, destination-chain identity.
    pub dest: String,
    pub origin_decimals: u8,
    pub dest_decimals: u8,
}

impl TokenMapping {
    /// Whether the origin side of this mapping is the chain's native asset.
    pub fn origin_is_native(&self) -> bool {
        is_zero_identity(&self.origin)
    }

    pub fn dest_is_native(&self) -> bool {
        is_zero_identity(&self.dest)
    }
}

/// Result of a unit conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converted {
    pub amount: U256,
    /// Remainder lost to floor truncation (zero when scaling up).
    pub dust: U256,
}

/// Resolves token mappings by normalized origin identity.
#[derive(Debug, Clone, Default)]
pub struct TokenMapResolver {
    mappings: Vec<TokenMapping>,
}

impl TokenMapResolver {
    pub fn new(mappings: Vec<TokenMapping>) -> Self {
        Self { mappings }
    }

    /// Parse the `TOKEN_MAPPINGS` env value:
    /// `<origin>=<dest>:<origin_decimals>:<dest_decimals>` entries
    /// separated by commas. Identities may be 20-byte EVM addresses
    /// (left-padded on parse) or full 32-byte values.
    pub fn from_env_value(raw: &str) -> Result<Self> {
        let mut mappings = Vec::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (origin, rest) = entry
                .split_once('=')
                .ok_or_else(|| eyre!("token mapping entry missing '=': {}", entry))?;
            let parts: Vec<&str> = rest.split(':').collect();
            if parts.len() != 3 {
                return Err(eyre!(
                    "token mapping entry must be origin=dest:dec_in:dec_out: {}",
                    entry
                ));
            }
            mappings.push(TokenMapping {
                origin: normalize_identity(origin)?,
                dest: normalize_identity(parts[0])?,
                origin_decimals: parts[1]
                    .parse()
                    .map_err(|_| eyre!("invalid origin decimals in {}", entry))?,
                dest_decimals: parts[2]
                    .parse()
                    .map_err(|_| eyre!("invalid dest decimals in {}", entry))?,
            });
        }
        Ok(Self::new(mappings))
    }

    /// Look up a mapping by origin identity (any case, with or without 0x).
    pub fn resolve(&self, origin: &str) -> Option<&TokenMapping> {
        let key = normalize_identity(origin).ok()?;
        self.mappings.iter().find(|m| m.origin == key)
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }
}

/// Scale an amount between decimal bases. Floor-truncates when the target
/// has fewer decimals.
pub fn convert(amount: U256, mapping: &TokenMapping, direction: ConvertDirection) -> Converted {
    let (dec_in, dec_out) = match direction {
        ConvertDirection::OriginToDest => (mapping.origin_decimals, mapping.dest_decimals),
        ConvertDirection::DestToOrigin => (mapping.dest_decimals, mapping.origin_decimals),
    };

    if dec_out >= dec_in {
        let factor = pow10(dec_out - dec_in);
        Converted {
            amount: amount * factor,
            dust: U256::ZERO,
        }
    } else {
        let factor = pow10(dec_in - dec_out);
        Converted {
            amount: amount / factor,
            dust: amount % factor,
        }
    }
}

fn pow10(exp: u8) -> U256 {
    U256::from(10u64).pow(U256::from(exp))
}

/// Normalize a 32-byte identity to lowercase `0x` + 64 hex. EVM addresses
/// (20 bytes) are accepted and left-padded.
pub fn normalize_identity(raw: &str) -> Result<String> {
    let hex_part = raw.trim().strip_prefix("0x").unwrap_or(raw.trim());
    let bytes = hex::decode(hex_part).map_err(|_| eyre!("invalid hex identity: {}", raw))?;
    match bytes.len() {
        32 => Ok(format!("0x{}", hex::encode(bytes))),
        20 => {
            let mut padded = [0u8; 32];
            padded[12..].copy_from_slice(&bytes);
            Ok(format!("0x{}", hex::encode(padded)))
        }
        n => Err(eyre!("identity must be 20 or 32 bytes, got {}: {}", n, raw)),
    }
}

fn is_zero_identity(s: &str) -> bool {
    s.strip_prefix("0x")
        .map(|h| h.bytes().all(|b| b == b'0'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(dec_in: u8, dec_out: u8) -> TokenMapping {
        TokenMapping {
            origin: normalize_identity("0xf7f556c59fd417f195abcd8804e43cfc6714abf8").unwrap(),
            dest: format!("0x{}", "11".repeat(32)),
            origin_decimals: dec_in,
            dest_decimals: dec_out,
        }
    }

    #[test]
    fn test_scale_up_6_to_18() {
        let m = mapping(6, 18);
        let c = convert(U256::from(1_000_000u64), &m, ConvertDirection::OriginToDest);
        assert_eq!(
            c.amount,
            U256::from(1_000_000u64) * U256::from(10u64).pow(U256::from(12u64))
        );
        assert_eq!(c.dust, U256::ZERO);
    }

    #[test]
    fn test_scale_down_18_to_6_floors() {
        let m = mapping(18, 6);
        let c = convert(
            U256::from(1_000_000_000_000u64),
            &m,
            ConvertDirection::OriginToDest,
        );
        assert_eq!(c.amount, U256::from(1u64));
        assert_eq!(c.dust, U256::ZERO);

        // 1.5 * 10^12 origin units → floor to 1, dust = 0.5 * 10^12
        let c = convert(
            U256::from(1_500_000_000_000u64),
            &m,
            ConvertDirection::OriginToDest,
        );
        assert_eq!(c.amount, U256::from(1u64));
        assert_eq!(c.dust, U256::from(500_000_000_000u64));
    }

    #[test]
    fn test_reverse_direction_uses_swapped_decimals() {
        let m = mapping(6, 9);
        let c = convert(
            U256::from(1_000_000_000u64),
            &m,
            ConvertDirection::DestToOrigin,
        );
        assert_eq!(c.amount, U256::from(1_000_000u64));
    }

    #[test]
    fn test_resolver_normalized_lookup() {
        let r = TokenMapResolver::new(vec![mapping(6, 9)]);
        // mixed-case 20-byte address resolves to the padded key
        let found = r.resolve("0xF7F556c59fD417f195ABcd8804e43cfc6714aBF8");
        assert!(found.is_some());
        assert_eq!(found.unwrap().origin_decimals, 6);
        assert!(r.resolve(&format!("0x{}", "ab".repeat(32))).is_none());
    }

    #[test]
    fn test_from_env_value() {
        let origin = format!("0x{}", "aa".repeat(20));
        let dest = format!("0x{}", "bb".repeat(32));
        let raw = format!("{}={}:6:9", origin, dest);
        let r = TokenMapResolver::from_env_value(&raw).unwrap();
        assert_eq!(r.len(), 1);
        let m = r.resolve(&origin).unwrap();
        assert_eq!(m.dest, dest);
        assert_eq!((m.origin_decimals, m.dest_decimals), (6, 9));

        assert!(TokenMapResolver::from_env_value("garbage").is_err());
        assert!(TokenMapResolver::from_env_value("").unwrap().is_empty());
    }

    #[test]
    fn test_native_identity() {
        let m = TokenMapping {
            origin: format!("0x{}", "00".repeat(32)),
            dest: format!("0x{}", "11".repeat(32)),
            origin_decimals: 9,
            dest_decimals: 18,
        };
        assert!(m.origin_is_native());
        assert!(!m.dest_is_native());
    }
}
