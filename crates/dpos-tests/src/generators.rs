//! Test data generators.
//!
//! Chains are deterministic: the same builder settings always produce the
//! same ids, so independently built chains agree on their shared prefix.

use dpos_chain::{blake2b_256, BlockHeader, Transaction};
use libsecp256k1::{Message, PublicKey, SecretKey};

/// Secret key derived from a one-byte seed (seed must be non-zero).
pub fn secret_key(seed: u8) -> SecretKey {
    SecretKey::parse(&[seed; 32]).expect("seed is a valid scalar")
}

/// Hex compressed public key of `secret`.
pub fn public_key_hex(secret: &SecretKey) -> String {
    hex::encode(PublicKey::from_secret_key(secret).serialize_compressed())
}

/// `n` delegate keys with seeds `1..=n`.
pub fn delegate_keys(n: u8) -> Vec<SecretKey> {
    (1..=n).map(secret_key).collect()
}

/// Sign `digest` with `secret`, hex encoded.
pub fn sign_hex(digest: &[u8; 32], secret: &SecretKey) -> String {
    let (signature, _) = libsecp256k1::sign(&Message::parse(digest), secret);
    hex::encode(signature.serialize())
}

/// A transaction whose bytes are derived from `seed`.
pub fn test_transaction(seed: u32) -> Transaction {
    let mut bytes = b"tx".to_vec();
    bytes.extend_from_slice(&seed.to_le_bytes());
    Transaction::from_bytes(bytes).expect("non-empty transaction")
}

/// Builds linked block headers.
#[derive(Clone)]
pub struct ChainBuilder {
    keys: Vec<SecretKey>,
    public_keys: Vec<String>,
    sign: bool,
    salt: u8,
}

impl ChainBuilder {
    /// Blocks forged round-robin by `keys`, properly signed.
    pub fn signed(keys: &[SecretKey]) -> Self {
        Self {
            keys: keys.to_vec(),
            public_keys: keys.iter().map(public_key_hex).collect(),
            sign: true,
            salt: 0,
        }
    }

    /// Well-formed but unsigned blocks, for tests that never verify.
    pub fn unsigned() -> Self {
        Self {
            keys: Vec::new(),
            public_keys: vec![format!("02{}", "11".repeat(32))],
            sign: false,
            salt: 0,
        }
    }

    /// Blocks above genesis differ from those of other salts.
    pub fn salt(mut self, salt: u8) -> Self {
        self.salt = salt;
        self
    }

    /// A chain of `length` blocks from genesis.
    pub fn build(&self, length: u32) -> Vec<BlockHeader> {
        self.extend(Vec::new(), length)
    }

    /// Extend `chain` up to `height`.
    pub fn extend(&self, mut chain: Vec<BlockHeader>, height: u32) -> Vec<BlockHeader> {
        while (chain.len() as u32) < height {
            let block = self.next_block(chain.last());
            chain.push(block);
        }
        chain
    }

    /// `base` up to `common`, then this builder's blocks up to `height`.
    pub fn fork(&self, base: &[BlockHeader], common: u32, height: u32) -> Vec<BlockHeader> {
        self.extend(base[..common as usize].to_vec(), height)
    }

    fn next_block(&self, parent: Option<&BlockHeader>) -> BlockHeader {
        let height = parent.map_or(1, |p| p.height + 1);
        let index = (height as usize - 1) % self.public_keys.len();
        let salt = if height == 1 { 0 } else { self.salt };

        let mut payload_seed = vec![salt];
        payload_seed.extend_from_slice(&height.to_le_bytes());

        let mut header = BlockHeader {
            id: String::new(),
            version: 0,
            timestamp: height * 8,
            height,
            previous_block: parent.map(|p| p.id.clone()),
            number_of_transactions: 0,
            total_amount: 0,
            total_fee: 0,
            reward: 0,
            payload_length: 0,
            payload_hash: hex::encode(blake2b_256(&payload_seed)),
            generator_public_key: self.public_keys[index].clone(),
            block_signature: "00".repeat(64),
            transactions: None,
        };
        if self.sign {
            let digest = header.signing_digest().expect("hex fields");
            header.block_signature = sign_hex(&digest, &self.keys[index]);
        }
        header.id = header.compute_id().expect("hex fields");
        header
    }
}
