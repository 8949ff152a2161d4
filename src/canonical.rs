//! Canonical bridge message encoding and identifier derivation
//!
//! Every cross-chain transfer is reduced to one fixed-layout byte string;
//! its keccak256 hash (`msg_id`) is the primary key for all downstream
//! state. The field order and widths are frozen: both chains and the
//! relayer must derive the same `msg_id` from the same transfer.

#![allow(dead_code)]

use alloy::primitives::{keccak256, B256, U256};
use serde::{Deserialize, Serialize};

/// Total size of the packed canonical encoding:
/// version(1) + dir(1) + 8 fields of 32 bytes each.
pub const CANONICAL_LEN: usize = 2 + 8 * 32;

/// Transfer direction relative to the origin chain.
pub const DIR_ORIGIN_TO_DEST: u8 = 1;
pub const DIR_DEST_TO_ORIGIN: u8 = 2;

/// The canonical cross-chain transfer record.
///
/// Serialized as JSON (camelCase, hex-quantity numbers) for the encrypted
/// event envelope plaintext; encoded as packed bytes for hashing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeMessage {
    pub version: u8,
    /// 1 = origin→dest, 2 = dest→origin
    pub dir: u8,
    pub src_chain_id: U256,
    pub dst_chain_id: U256,
    pub src_tx_id: B256,
    pub origin_token: B256,
    pub amount: U256,
    pub recipient: B256,
    pub nonce: U256,
    /// Unix seconds; occupies a full 32-byte word in the encoding.
    pub expiry: u64,
}

impl BridgeMessage {
    /// Packed fixed-order encoding. Never reordered, no length prefixes.
    pub fn encode(&self) -> [u8; CANONICAL_LEN] {
        let mut out = [0u8; CANONICAL_LEN];
        out[0] = self.version;
        out[1] = self.dir;

        let words: [[u8; 32]; 8] = [
            self.src_chain_id.to_be_bytes(),
            self.dst_chain_id.to_be_bytes(),
            self.src_tx_id.0,
            self.origin_token.0,
            self.amount.to_be_bytes(),
            self.recipient.0,
            self.nonce.to_be_bytes(),
            U256::from(self.expiry).to_be_bytes(),
        ];
        for (i, word) in words.iter().enumerate() {
            let off = 2 + i * 32;
            out[off..off + 32].copy_from_slice(word);
        }

        out
    }

    /// Parse a packed canonical encoding back into a message.
    ///
    /// Returns `None` when the buffer has the wrong length or the expiry
    /// word overflows u64.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != CANONICAL_LEN {
            return None;
        }

        let word = |i: usize| -> [u8; 32] {
            let start = 2 + i * 32;
            let mut w = [0u8; 32];
            w.copy_from_slice(&bytes[start..start + 32]);
            w
        };

        let expiry: u64 = U256::from_be_bytes(word(7)).try_into().ok()?;

        Some(Self {
            version: bytes[0],
            dir: bytes[1],
            src_chain_id: U256::from_be_bytes(word(0)),
            dst_chain_id: U256::from_be_bytes(word(1)),
            src_tx_id: B256::from(word(2)),
            origin_token: B256::from(word(3)),
            amount: U256::from_be_bytes(word(4)),
            recipient: B256::from(word(5)),
            nonce: U256::from_be_bytes(word(6)),
            expiry,
        })
    }

    /// Deterministic transfer identifier: keccak256 of the packed encoding.
    pub fn msg_id(&self) -> B256 {
        keccak256(self.encode())
    }

    /// Whether the solver claim-and-bond protocol applies to this transfer.
    pub fn is_solver_mediated(&self) -> bool {
        self.dir == DIR_DEST_TO_ORIGIN
    }
}

/// Lowercase `0x`-prefixed hex form used as the database primary key.
pub fn msg_id_hex(id: &B256) -> String {
    format!("{:#x}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_message() -> BridgeMessage {
        BridgeMessage {
            version: 1,
            dir: DIR_ORIGIN_TO_DEST,
            src_chain_id: U256::from(1u64),
            dst_chain_id: U256::from(11155111u64),
            src_tx_id: B256::repeat_byte(0xAA),
            origin_token: B256::ZERO,
            amount: U256::from(1_000_000u64),
            recipient: B256::repeat_byte(0xBB),
            nonce: U256::from(1u64),
            expiry: 1_900_000_000,
        }
    }

    #[test]
    fn test_encode_length_and_layout() {
        let m = sample_message();
        let bytes = m.encode();
        assert_eq!(bytes.len(), CANONICAL_LEN);
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[1], DIR_ORIGIN_TO_DEST);
        // src_chain_id = 1 sits big-endian at the end of the first word
        assert_eq!(bytes[2 + 31], 1);
        // src_tx_id occupies word 2
        assert!(bytes[2 + 64..2 + 96].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_roundtrip_identity() {
        let m = sample_message();
        let decoded = BridgeMessage::decode(&m.encode()).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(decoded.msg_id(), m.msg_id());
    }

    #[test]
    fn test_msg_id_sensitive_to_every_field() {
        let base = sample_message();
        let base_id = base.msg_id();

        let variants = vec![
            BridgeMessage { version: 2, ..base.clone() },
            BridgeMessage { dir: DIR_DEST_TO_ORIGIN, ..base.clone() },
            BridgeMessage { src_chain_id: U256::from(2u64), ..base.clone() },
            BridgeMessage { dst_chain_id: U256::from(5u64), ..base.clone() },
            BridgeMessage { src_tx_id: B256::repeat_byte(0xAB), ..base.clone() },
            BridgeMessage { origin_token: B256::repeat_byte(0x01), ..base.clone() },
            BridgeMessage { amount: U256::from(2u64), ..base.clone() },
            BridgeMessage { recipient: B256::repeat_byte(0xBC), ..base.clone() },
            BridgeMessage { nonce: U256::from(2u64), ..base.clone() },
            BridgeMessage { expiry: base.expiry + 1, ..base.clone() },
        ];

        for v in variants {
            assert_ne!(v.msg_id(), base_id, "field change must change msg_id");
        }
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert!(BridgeMessage::decode(&[0u8; 10]).is_none());
        assert!(BridgeMessage::decode(&[0u8; CANONICAL_LEN + 1]).is_none());
    }

    #[test]
    fn test_json_roundtrip() {
        let m = sample_message();
        let json = serde_json::to_string(&m).unwrap();
        let back: BridgeMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
        assert!(json.contains("srcChainId"));
    }

    #[test]
    fn test_msg_id_hex_is_lowercase() {
        let hex = msg_id_hex(&sample_message().msg_id());
        assert!(hex.starts_with("0x"));
        assert_eq!(hex.len(), 66);
        assert_eq!(hex, hex.to_lowercase());
    }
}
