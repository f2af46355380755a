use std::fmt;

use ed25519_dalek::{Signer, Verifier};

use serde::{Deserialize, Serialize};

use sha3::{Digest, Sha3_256};

/// Size of a digest in bytes
pub const DIGEST_SIZE: usize = 32;

/// A SHA3-256 digest
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash256([u8; DIGEST_SIZE]);

/// Nodes of the commit graph are addressed by the digest of their content
pub type NodeId = Hash256;

impl Hash256 {
    pub const fn zero() -> Self {
        Self([0u8; DIGEST_SIZE])
    }

    pub fn from_array(bytes: [u8; DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }

    /// Hash of the concatenation of both digests
    pub fn aggregate(&self, other: &Hash256) -> Hash256 {
        let mut hasher = Sha3_256::new();
        hasher.update(self.0);
        hasher.update(other.0);
        Hash256(hasher.finalize().into())
    }

    /// Abbreviated form used in log messages
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.short())
    }
}

pub fn hash(bytes: &[u8]) -> Hash256 {
    let mut hasher = Sha3_256::new();
    hasher.update(bytes);
    Hash256(hasher.finalize().into())
}

/// An Ed25519 verifying key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_array(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

/// An Ed25519 signature (64 bytes)
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.0.len().min(8);
        write!(f, "Signature({})", hex::encode(&self.0[..len]))
    }
}

/// An Ed25519 signing key
///
/// Only the seed is kept around; the expanded key is derived on use.
#[derive(Clone)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self(seed)
    }

    pub fn public_key(&self) -> PublicKey {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        PublicKey(key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        Signature(key.sign(message).to_bytes().to_vec())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey({})", self.public_key())
    }
}

/// Checks `signature` over `message` against `public_key`
///
/// Malformed keys or signatures simply fail verification.
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> bool {
    let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&public_key.0) else {
        return false;
    };

    let Ok(bytes) = <[u8; 64]>::try_from(signature.0.as_slice()) else {
        return false;
    };

    let signature = ed25519_dalek::Signature::from_bytes(&bytes);
    key.verify(message, &signature).is_ok()
}

/// A signature together with the key that produced it
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypedSignature {
    pub signer: PublicKey,
    pub signature: Signature,
}

impl TypedSignature {
    pub fn sign(message: &[u8], key: &PrivateKey) -> Self {
        Self {
            signer: key.public_key(),
            signature: key.sign(message),
        }
    }

    pub fn verify(&self, message: &[u8]) -> bool {
        verify(&self.signer, message, &self.signature)
    }
}
