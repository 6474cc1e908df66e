//! Block and transaction wire data.

use crate::crypto::{blake2b_256, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use crate::error::{ChainError, ChainResult};
use serde::{Deserialize, Serialize};

/// Maximum serialized transaction size accepted from peers.
pub const MAX_TRANSACTION_BYTES: usize = 128 * 1024;

/// Block header as exchanged between peers.
///
/// When a block travels with its payload, `transactions` carries the
/// hex-encoded serialized transactions; status replies and header-only
/// block queries leave it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct BlockHeader {
    /// Block id (hex BLAKE2b-256).
    pub id: String,
    /// Block format version.
    pub version: u8,
    /// Seconds since the network epoch.
    pub timestamp: u32,
    /// Block height.
    pub height: u32,
    /// Parent block id, absent for genesis.
    #[serde(default)]
    pub previous_block: Option<String>,
    /// Number of transactions in the payload.
    pub number_of_transactions: u32,
    /// Sum of transferred amounts.
    pub total_amount: u64,
    /// Sum of fees.
    pub total_fee: u64,
    /// Forging reward.
    pub reward: u64,
    /// Payload size in bytes.
    pub payload_length: u32,
    /// Hex hash of the payload.
    pub payload_hash: String,
    /// Hex compressed public key of the forging delegate.
    pub generator_public_key: String,
    /// Hex signature of the forging delegate.
    pub block_signature: String,
    /// Hex serialized transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transactions: Option<Vec<String>>,
}

impl BlockHeader {
    /// Check field encodings without any cryptography.
    pub fn validate(&self) -> ChainResult<()> {
        if !is_hex_of_len(&self.id, 32) {
            return Err(ChainError::InvalidBlock(format!("bad id {}", self.id)));
        }
        if self.height == 0 {
            return Err(ChainError::InvalidBlock("height 0".into()));
        }
        if let Some(previous) = &self.previous_block {
            if !is_hex_of_len(previous, 32) {
                return Err(ChainError::InvalidBlock(format!("bad previous block {}", previous)));
            }
        } else if self.height != 1 {
            return Err(ChainError::InvalidBlock(format!(
                "missing previous block at height {}",
                self.height
            )));
        }
        if !is_hex_of_len(&self.generator_public_key, PUBLIC_KEY_LENGTH) {
            return Err(ChainError::InvalidBlock("bad generator public key".into()));
        }
        if !is_hex_of_len(&self.block_signature, SIGNATURE_LENGTH) {
            return Err(ChainError::InvalidBlock("bad block signature".into()));
        }
        if hex::decode(&self.payload_hash).is_err() {
            return Err(ChainError::InvalidBlock("bad payload hash".into()));
        }
        Ok(())
    }

    /// Bytes covered by the block signature.
    pub fn unsigned_bytes(&self) -> ChainResult<Vec<u8>> {
        let decode = |field: &str, value: &str| {
            hex::decode(value).map_err(|e| ChainError::InvalidBlock(format!("{}: {}", field, e)))
        };

        let mut out = Vec::with_capacity(160);
        out.push(self.version);
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        match &self.previous_block {
            Some(previous) => out.extend_from_slice(&decode("previousBlock", previous)?),
            None => out.extend_from_slice(&[0u8; 32]),
        }
        out.extend_from_slice(&self.number_of_transactions.to_le_bytes());
        out.extend_from_slice(&self.total_amount.to_le_bytes());
        out.extend_from_slice(&self.total_fee.to_le_bytes());
        out.extend_from_slice(&self.reward.to_le_bytes());
        out.extend_from_slice(&self.payload_length.to_le_bytes());
        out.extend_from_slice(&decode("payloadHash", &self.payload_hash)?);
        out.extend_from_slice(&decode("generatorPublicKey", &self.generator_public_key)?);
        Ok(out)
    }

    /// Digest signed by the generator.
    pub fn signing_digest(&self) -> ChainResult<[u8; 32]> {
        Ok(blake2b_256(&self.unsigned_bytes()?))
    }

    /// Id derived from the signed header.
    pub fn compute_id(&self) -> ChainResult<String> {
        let mut bytes = self.unsigned_bytes()?;
        let signature = hex::decode(&self.block_signature)
            .map_err(|e| ChainError::InvalidBlock(format!("blockSignature: {}", e)))?;
        bytes.extend_from_slice(&signature);
        Ok(hex::encode(blake2b_256(&bytes)))
    }

    /// Copy of this header without its payload.
    pub fn without_transactions(&self) -> Self {
        Self {
            transactions: None,
            ..self.clone()
        }
    }
}

/// A deserialized transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    /// Hex BLAKE2b-256 of the serialized bytes.
    pub id: String,
    /// Serialized transaction.
    pub bytes: Vec<u8>,
}

impl Transaction {
    /// Decode a hex-serialized transaction.
    pub fn from_hex(data: &str) -> ChainResult<Self> {
        let bytes =
            hex::decode(data).map_err(|e| ChainError::InvalidTransaction(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    /// Wrap serialized bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> ChainResult<Self> {
        if bytes.is_empty() {
            return Err(ChainError::InvalidTransaction("empty".into()));
        }
        if bytes.len() > MAX_TRANSACTION_BYTES {
            return Err(ChainError::InvalidTransaction(format!(
                "{} bytes exceeds {}",
                bytes.len(),
                MAX_TRANSACTION_BYTES
            )));
        }
        Ok(Self {
            id: hex::encode(blake2b_256(&bytes)),
            bytes,
        })
    }

    /// Hex serialization.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

/// A block with its transactions decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Decode the inline payload of a received block.
    ///
    /// A header without payload yields an empty transaction list.
    pub fn from_header(mut header: BlockHeader) -> ChainResult<Self> {
        let transactions = match header.transactions.take() {
            Some(raw) => {
                if raw.len() != header.number_of_transactions as usize {
                    return Err(ChainError::InvalidBlock(format!(
                        "block {} declares {} transactions, carries {}",
                        header.height,
                        header.number_of_transactions,
                        raw.len()
                    )));
                }
                raw.iter()
                    .map(|tx| Transaction::from_hex(tx))
                    .collect::<ChainResult<Vec<_>>>()?
            }
            None => Vec::new(),
        };
        Ok(Self {
            header,
            transactions,
        })
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }
}

fn is_hex_of_len(value: &str, bytes: usize) -> bool {
    value.len() == bytes * 2 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            id: "00".repeat(32),
            version: 0,
            timestamp: 100,
            height: 2,
            previous_block: Some("11".repeat(32)),
            number_of_transactions: 0,
            total_amount: 0,
            total_fee: 0,
            reward: 0,
            payload_length: 0,
            payload_hash: "22".repeat(32),
            generator_public_key: format!("02{}", "33".repeat(32)),
            block_signature: "44".repeat(64),
            transactions: None,
        }
    }

    #[test]
    fn test_decode_rejects_unknown_fields() {
        let mut value = serde_json::to_value(header()).unwrap();
        value["extra"] = serde_json::json!(1);
        assert!(serde_json::from_value::<BlockHeader>(value).is_err());
    }

    #[test]
    fn test_decode_rejects_missing_fields() {
        let mut value = serde_json::to_value(header()).unwrap();
        value.as_object_mut().unwrap().remove("payloadHash");
        assert!(serde_json::from_value::<BlockHeader>(value).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(header().validate().is_ok());

        let mut bad = header();
        bad.previous_block = None;
        assert!(bad.validate().is_err());

        let mut bad = header();
        bad.generator_public_key = "zz".into();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_id_covers_signature() {
        let a = header();
        let mut b = header();
        b.block_signature = "55".repeat(64);
        assert_ne!(a.compute_id().unwrap(), b.compute_id().unwrap());
        assert_eq!(a.signing_digest().unwrap(), b.signing_digest().unwrap());
    }

    #[test]
    fn test_block_from_header_checks_count() {
        let mut h = header();
        h.number_of_transactions = 2;
        h.transactions = Some(vec!["aa".into()]);
        assert!(Block::from_header(h.clone()).is_err());

        h.transactions = Some(vec!["aa".into(), "bb".into()]);
        let block = Block::from_header(h).unwrap();
        assert_eq!(block.transactions.len(), 2);
        assert!(block.header.transactions.is_none());
    }

    #[test]
    fn test_transaction_from_hex() {
        let tx = Transaction::from_hex("deadbeef").unwrap();
        assert_eq!(tx.bytes, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(tx.id.len(), 64);
        assert_eq!(tx.to_hex(), "deadbeef");

        assert!(Transaction::from_hex("").is_err());
        assert!(Transaction::from_hex("xyz").is_err());
    }
}
