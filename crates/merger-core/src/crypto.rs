// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_consensus::Signature;
use rand::{rngs::StdRng, SeedableRng};
use rs_merkle::{algorithms::Sha256, Hasher, MerkleTree};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

pub const SIGNATURE_SIZE: usize = 64;
pub const BLOCK_DIGEST_SIZE: usize = 32;

/// 32 byte digest used for block ids, block hashes, transaction ids and merkle roots.
///
/// Human readable formats (json message bodies) carry it as base64, binary formats as raw bytes.
#[derive(Clone, Copy, Eq, Ord, PartialOrd, PartialEq, Default, Hash)]
pub struct BlockDigest([u8; BLOCK_DIGEST_SIZE]);

#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SignatureBytes([u8; SIGNATURE_SIZE]);

#[derive(Clone, Eq, PartialEq)]
pub struct PublicKey(ed25519_consensus::VerificationKey);

// Box ensures value is not copied in memory when Signer itself is moved around for better security
pub struct Signer(Box<ed25519_consensus::SigningKey>);

impl BlockDigest {
    pub const fn new(bytes: [u8; BLOCK_DIGEST_SIZE]) -> Self {
        Self(bytes)
    }

    /// blake3 digest of the given bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).into())
    }

    pub fn of_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        Self(hasher.finalize().into())
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, DigestError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| DigestError(e.to_string()))?;
        Self::try_from(bytes.as_slice())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; BLOCK_DIGEST_SIZE]
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid digest: {0}")]
pub struct DigestError(String);

impl TryFrom<&[u8]> for BlockDigest {
    type Error = DigestError;

    fn try_from(v: &[u8]) -> Result<Self, Self::Error> {
        let inner: [u8; BLOCK_DIGEST_SIZE] = v
            .try_into()
            .map_err(|_| DigestError(format!("length {}", v.len())))?;
        Ok(Self(inner))
    }
}

impl AsRef<[u8]> for BlockDigest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_string = hex::encode(self.0);
        write!(f, "@{}", &hex_string[..8])
    }
}

impl fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_string = hex::encode(self.0);
        write!(f, "@{}", &hex_string[..8])
    }
}

impl Serialize for BlockDigest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base64())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for BlockDigest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let encoded = String::deserialize(deserializer)?;
            Self::from_base64(&encoded).map_err(de::Error::custom)
        } else {
            <[u8; BLOCK_DIGEST_SIZE]>::deserialize(deserializer).map(Self)
        }
    }
}

impl SignatureBytes {
    pub fn to_bytes(&self) -> [u8; SIGNATURE_SIZE] {
        self.0
    }
}

impl Default for SignatureBytes {
    fn default() -> Self {
        Self([0u8; SIGNATURE_SIZE])
    }
}

impl AsRef<[u8]> for SignatureBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SignatureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", &hex::encode(self.0)[..8])
    }
}

impl Serialize for SignatureBytes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&BASE64.encode(self.0))
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for SignatureBytes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = if deserializer.is_human_readable() {
            let encoded = String::deserialize(deserializer)?;
            BASE64.decode(encoded).map_err(de::Error::custom)?
        } else {
            Vec::<u8>::deserialize(deserializer)?
        };
        let inner: [u8; SIGNATURE_SIZE] = bytes.as_slice().try_into().map_err(|_| {
            de::Error::custom(format!("Invalid signature length: {}", bytes.len()))
        })?;
        Ok(Self(inner))
    }
}

impl PublicKey {
    pub fn verify(
        &self,
        message: &[u8],
        signature: &SignatureBytes,
    ) -> Result<(), ed25519_consensus::Error> {
        let signature = Signature::from(signature.0);
        self.0.verify(&signature, message)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_hex(encoded: &str) -> Result<Self, String> {
        let bytes = hex::decode(encoded).map_err(|e| e.to_string())?;
        let bytes: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("Invalid public key length: {}", bytes.len()))?;
        ed25519_consensus::VerificationKey::try_from(bytes)
            .map(Self)
            .map_err(|e| e.to_string())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", &self.to_hex()[..8])
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_hex(&encoded).map_err(de::Error::custom)
    }
}

impl Signer {
    pub fn new_for_test(n: usize) -> Vec<Self> {
        let mut rng = StdRng::seed_from_u64(0);
        (0..n)
            .map(|_| Self(Box::new(ed25519_consensus::SigningKey::new(&mut rng))))
            .collect()
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self(Box::new(ed25519_consensus::SigningKey::from(seed)))
    }

    pub fn sign(&self, message: &[u8]) -> SignatureBytes {
        SignatureBytes(self.0.sign(message).to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verification_key())
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signer(public_key={:?})", self.public_key())
    }
}

impl Serialize for Signer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for Signer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(&encoded).map_err(de::Error::custom)?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| de::Error::custom("Invalid signing key length"))?;
        Ok(Self::from_seed(seed))
    }
}

/// Which side of the running hash a proof sibling sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProofSide {
    Left,
    Right,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofNode {
    pub side: ProofSide,
    pub val: BlockDigest,
}

/// Merkle root over transaction ids. The ids are already digests and are used as leaves directly.
pub fn merkle_root(leaves: &[BlockDigest]) -> BlockDigest {
    let leaves: Vec<[u8; BLOCK_DIGEST_SIZE]> = leaves.iter().map(|l| l.0).collect();
    MerkleTree::<Sha256>::from_leaves(&leaves)
        .root()
        .map(BlockDigest)
        .unwrap_or_default()
}

/// Sibling path for the leaf at `index`, leaf level first.
pub fn merkle_proof(leaves: &[BlockDigest], index: usize) -> Vec<ProofNode> {
    if index >= leaves.len() {
        return Vec::new();
    }
    let raw: Vec<[u8; BLOCK_DIGEST_SIZE]> = leaves.iter().map(|l| l.0).collect();
    let tree = MerkleTree::<Sha256>::from_leaves(&raw);
    let mut hashes = tree.proof(&[index]).proof_hashes().to_vec().into_iter();

    // Odd nodes are promoted without a sibling, so only levels with a sibling consume a hash.
    let mut proof = Vec::new();
    let (mut position, mut level_len) = (index, leaves.len());
    while level_len > 1 {
        if (position ^ 1) < level_len {
            let Some(hash) = hashes.next() else {
                break;
            };
            let side = if position % 2 == 0 {
                ProofSide::Right
            } else {
                ProofSide::Left
            };
            proof.push(ProofNode {
                side,
                val: BlockDigest(hash),
            });
        }
        position /= 2;
        level_len = (level_len + 1) / 2;
    }
    proof
}

pub fn verify_merkle_proof(leaf: &BlockDigest, proof: &[ProofNode], root: &BlockDigest) -> bool {
    let mut running = leaf.0;
    for node in proof {
        let mut concat = Vec::with_capacity(2 * BLOCK_DIGEST_SIZE);
        match node.side {
            ProofSide::Left => {
                concat.extend_from_slice(&node.val.0);
                concat.extend_from_slice(&running);
            }
            ProofSide::Right => {
                concat.extend_from_slice(&running);
                concat.extend_from_slice(&node.val.0);
            }
        }
        running = Sha256::hash(&concat);
    }
    running == root.0
}
