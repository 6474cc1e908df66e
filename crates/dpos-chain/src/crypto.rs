//! Hashing and signature verification.
//!
//! Block and identity signatures are compact (64 byte) secp256k1 signatures
//! over a BLAKE2b-256 digest, with 33 byte compressed public keys.

use crate::block::BlockHeader;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use libsecp256k1::{Message, PublicKey, PublicKeyFormat, Signature};

/// Compressed public key length in bytes.
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// Compact signature length in bytes.
pub const SIGNATURE_LENGTH: usize = 64;

/// BLAKE2b-256 of `data`.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let hash = Blake2b::<U32>::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hash);
    out
}

/// Signature verification used by the network layer.
///
/// The cryptographic scheme is owned by the chain; the network layer only
/// asks yes/no questions.
pub trait BlockCrypto: Send + Sync {
    /// Check the block id and the generator's signature over the header.
    fn verify_block(&self, header: &BlockHeader) -> bool;

    /// Check `signature` over the 32 byte `digest` under `public_key`.
    fn verify_signature(&self, digest: &[u8; 32], signature: &[u8], public_key: &[u8]) -> bool;
}

/// secp256k1 verifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Crypto;

impl Secp256k1Crypto {
    /// Create a verifier.
    pub fn new() -> Self {
        Self
    }
}

impl BlockCrypto for Secp256k1Crypto {
    fn verify_block(&self, header: &BlockHeader) -> bool {
        let Ok(digest) = header.signing_digest() else {
            return false;
        };
        match header.compute_id() {
            Ok(id) if id == header.id => {}
            _ => return false,
        }
        let (Ok(signature), Ok(public_key)) = (
            hex::decode(&header.block_signature),
            hex::decode(&header.generator_public_key),
        ) else {
            return false;
        };
        self.verify_signature(&digest, &signature, &public_key)
    }

    fn verify_signature(&self, digest: &[u8; 32], signature: &[u8], public_key: &[u8]) -> bool {
        if signature.len() != SIGNATURE_LENGTH || public_key.len() != PUBLIC_KEY_LENGTH {
            return false;
        }
        let message = Message::parse(digest);
        let Ok(signature) = Signature::parse_standard_slice(signature) else {
            return false;
        };
        let Ok(public_key) = PublicKey::parse_slice(public_key, Some(PublicKeyFormat::Compressed))
        else {
            return false;
        };
        libsecp256k1::verify(&message, &signature, &public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libsecp256k1::SecretKey;

    fn keypair(seed: u8) -> (SecretKey, PublicKey) {
        let secret = SecretKey::parse(&[seed; 32]).unwrap();
        let public = PublicKey::from_secret_key(&secret);
        (secret, public)
    }

    #[test]
    fn test_blake2b_256_is_deterministic() {
        assert_eq!(blake2b_256(b"abc"), blake2b_256(b"abc"));
        assert_ne!(blake2b_256(b"abc"), blake2b_256(b"abd"));
    }

    #[test]
    fn test_verify_signature() {
        let (secret, public) = keypair(7);
        let digest = blake2b_256(b"status");
        let (signature, _) = libsecp256k1::sign(&Message::parse(&digest), &secret);

        let crypto = Secp256k1Crypto::new();
        let sig = signature.serialize();
        let pk = public.serialize_compressed();
        assert!(crypto.verify_signature(&digest, &sig, &pk));

        let other = blake2b_256(b"other");
        assert!(!crypto.verify_signature(&other, &sig, &pk));

        let (_, stranger) = keypair(9);
        assert!(!crypto.verify_signature(&digest, &sig, &stranger.serialize_compressed()));
        assert!(!crypto.verify_signature(&digest, &sig[..63], &pk));
    }
}
