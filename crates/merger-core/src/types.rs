// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::{merkle_root, BlockDigest, SignatureBytes, Signer};

pub type Height = u64;
pub type MergerIndex = u64;
pub type SignerIndex = u64;
pub type ChainId = u32;
pub type TimestampSecs = u64;

pub type BlockId = BlockDigest;
pub type BlockHash = BlockDigest;
pub type TransactionId = BlockDigest;
pub type MerkleRoot = BlockDigest;

pub const BLOCK_VERSION: u32 = 1;

/// Numbers travel as decimal strings in JSON message bodies and natively in binary encodings.
pub mod as_string {
    use std::{fmt::Display, str::FromStr};

    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: Display + Serialize,
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.collect_str(value)
        } else {
            value.serialize(serializer)
        }
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        T: FromStr + Deserialize<'de>,
        T::Err: Display,
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            String::deserialize(deserializer)?
                .parse()
                .map_err(de::Error::custom)
        } else {
            T::deserialize(deserializer)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: TransactionId,
    #[serde(with = "as_string")]
    pub time: TimestampSecs,
    #[serde(rename = "rID")]
    pub requestor: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Vec<String>,
}

impl Transaction {
    pub fn new(time: TimestampSecs, requestor: &str, kind: &str, content: Vec<String>) -> Self {
        let txid = Self::compute_id(time, requestor, kind, &content);
        Self {
            txid,
            time,
            requestor: requestor.to_string(),
            kind: kind.to_string(),
            content,
        }
    }

    fn compute_id(
        time: TimestampSecs,
        requestor: &str,
        kind: &str,
        content: &[String],
    ) -> TransactionId {
        let time = time.to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![&time, requestor.as_bytes(), b"\0", kind.as_bytes()];
        for item in content {
            parts.push(b"\0");
            parts.push(item.as_bytes());
        }
        BlockDigest::of_parts(parts)
    }

    pub fn has_valid_id(&self) -> bool {
        self.txid == Self::compute_id(self.time, &self.requestor, &self.kind, &self.content)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportSignature {
    pub signer: SignerIndex,
    pub signature: SignatureBytes,
}

impl SupportSignature {
    /// Bytes a signer endorses: the block coordinates together with the transaction root.
    pub fn message(
        signer: SignerIndex,
        block_id: &BlockId,
        tx_root: &MerkleRoot,
        height: Height,
    ) -> Vec<u8> {
        let mut message = Vec::with_capacity(80);
        message.extend_from_slice(&signer.to_be_bytes());
        message.extend_from_slice(block_id.as_ref());
        message.extend_from_slice(tx_root.as_ref());
        message.extend_from_slice(&height.to_be_bytes());
        message
    }

    pub fn sign(
        signer_index: SignerIndex,
        signer: &Signer,
        block_id: &BlockId,
        tx_root: &MerkleRoot,
        height: Height,
    ) -> Self {
        let message = Self::message(signer_index, block_id, tx_root, height);
        Self {
            signer: signer_index,
            signature: signer.sign(&message),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub chain_id: ChainId,
    pub height: Height,
    pub time: TimestampSecs,
    pub merger: MergerIndex,
    pub prev_block_id: BlockId,
    pub prev_hash: BlockHash,
    pub tx_root: MerkleRoot,
    pub tx_ids: Vec<TransactionId>,
    pub support_signatures: Vec<SupportSignature>,
}

impl BlockHeader {
    pub fn new(
        chain_id: ChainId,
        height: Height,
        time: TimestampSecs,
        merger: MergerIndex,
        parent: &ChainLink,
        transactions: &[Transaction],
    ) -> Self {
        let tx_ids: Vec<TransactionId> = transactions.iter().map(|tx| tx.txid).collect();
        Self {
            version: BLOCK_VERSION,
            chain_id,
            height,
            time,
            merger,
            prev_block_id: parent.id,
            prev_hash: parent.hash,
            tx_root: merkle_root(&tx_ids),
            tx_ids,
            support_signatures: Vec::new(),
        }
    }

    pub fn block_id(&self) -> BlockId {
        block_id(self.chain_id, self.height, self.merger)
    }

    pub fn with_support(mut self, support: SupportSignature) -> Self {
        self.support_signatures.push(support);
        self
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }
}

/// Block ids are bound to the position and author, two versions of the same block share an id
/// and differ by hash.
pub fn block_id(chain_id: ChainId, height: Height, merger: MergerIndex) -> BlockId {
    BlockDigest::of_parts([
        &chain_id.to_be_bytes()[..],
        &height.to_be_bytes()[..],
        &merger.to_be_bytes()[..],
    ])
}

#[derive(Serialize, Deserialize)]
struct SignedHeader {
    header: BlockHeader,
    signature: SignatureBytes,
}

#[derive(Serialize, Deserialize)]
struct BlockRecord {
    raw: Vec<u8>,
    transactions: Vec<Transaction>,
}

#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("malformed block encoding: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("block height must be positive")]
    ZeroHeight,
}

#[derive(Clone)]
pub struct Block {
    header: BlockHeader,
    signature: SignatureBytes,
    id: BlockId,
    hash: BlockHash,
    raw: Bytes,
    transactions: Vec<Transaction>,
}

impl Block {
    /// Signs the header as its merger and assembles the block.
    pub fn new_signed(
        header: BlockHeader,
        transactions: Vec<Transaction>,
        signer: &Signer,
    ) -> Result<Self, BlockError> {
        let signature = signer.sign(&header.signing_bytes()?);
        let raw = bincode::serialize(&SignedHeader { header, signature })?;
        Self::from_raw(raw.into(), transactions)
    }

    /// Parses the signed header carried in `raw` and recomputes the block hash from those bytes.
    pub fn from_raw(raw: Bytes, transactions: Vec<Transaction>) -> Result<Self, BlockError> {
        let SignedHeader { header, signature } = bincode::deserialize(&raw)?;
        if header.height == 0 {
            return Err(BlockError::ZeroHeight);
        }
        Ok(Self {
            id: header.block_id(),
            hash: BlockDigest::of(&raw),
            header,
            signature,
            raw,
            transactions,
        })
    }

    pub fn serialize(&self) -> Result<Vec<u8>, BlockError> {
        let record = BlockRecord {
            raw: self.raw.to_vec(),
            transactions: self.transactions.clone(),
        };
        Ok(bincode::serialize(&record)?)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, BlockError> {
        let BlockRecord { raw, transactions } = bincode::deserialize(bytes)?;
        Self::from_raw(raw.into(), transactions)
    }

    pub fn height(&self) -> Height {
        self.header.height
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn prev_id(&self) -> BlockId {
        self.header.prev_block_id
    }

    pub fn prev_hash(&self) -> BlockHash {
        self.header.prev_hash
    }

    pub fn signature_count(&self) -> usize {
        self.header.support_signatures.len()
    }

    pub fn time(&self) -> TimestampSecs {
        self.header.time
    }

    pub fn merger(&self) -> MergerIndex {
        self.header.merger
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn merger_signature(&self) -> &SignatureBytes {
        &self.signature
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn tx_ids(&self) -> &[TransactionId] {
        &self.header.tx_ids
    }

    pub fn reference(&self) -> BlockReference {
        BlockReference {
            height: self.height(),
            id: self.id,
            hash: self.hash,
        }
    }

    pub fn link(&self) -> ChainLink {
        ChainLink {
            height: self.height(),
            id: self.id,
            hash: self.hash,
            prev_hash: self.prev_hash(),
            time: self.time(),
        }
    }

    /// Whether `self` names `parent` as its direct predecessor.
    pub fn extends(&self, parent_id: &BlockId, parent_hash: &BlockHash) -> bool {
        self.prev_id() == *parent_id && self.prev_hash() == *parent_hash
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.hash == other.hash
    }
}

impl Eq for Block {}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "B{}({}{}<-{}, sigs={})",
            self.height(),
            self.id,
            self.hash,
            self.prev_id(),
            self.signature_count()
        )
    }
}

/// Identity of a block version, used as backup key.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BlockReference {
    pub height: Height,
    pub id: BlockId,
    pub hash: BlockHash,
}

impl BlockReference {
    pub const KEY_SIZE: usize = 8 + 32 + 32;

    pub fn to_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(Self::KEY_SIZE);
        key.extend_from_slice(&self.height.to_be_bytes());
        key.extend_from_slice(self.id.as_ref());
        key.extend_from_slice(self.hash.as_ref());
        key
    }

    pub fn from_key(key: &[u8]) -> Option<Self> {
        if key.len() != Self::KEY_SIZE {
            return None;
        }
        let height = Height::from_be_bytes(key[..8].try_into().ok()?);
        let id = BlockDigest::try_from(&key[8..40]).ok()?;
        let hash = BlockDigest::try_from(&key[40..]).ok()?;
        Some(Self { height, id, hash })
    }
}

/// Coordinates of a chain tip, finalized or speculative.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub height: Height,
    pub id: BlockId,
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub time: TimestampSecs,
}

impl ChainLink {
    /// The virtual tip the first block extends.
    pub fn genesis() -> Self {
        Self::default()
    }
}

/// The next block missing from the best known branch, `height == 0` when nothing is missing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NextLink {
    pub height: Height,
    pub prev_hash: BlockHash,
}

impl NextLink {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_missing(&self) -> bool {
        self.height != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> Block {
        let signers = Signer::new_for_test(3);
        let transactions = vec![
            Transaction::new(5, "user-1", "transfer", vec!["a".into(), "1".into()]),
            Transaction::new(6, "user-2", "transfer", vec!["b".into()]),
        ];
        let header = BlockHeader::new(7, 1, 42, 0, &ChainLink::genesis(), &transactions);
        let id = header.block_id();
        let root = header.tx_root;
        let header = header
            .with_support(SupportSignature::sign(1, &signers[1], &id, &root, 1))
            .with_support(SupportSignature::sign(2, &signers[2], &id, &root, 1));
        Block::new_signed(header, transactions, &signers[0]).unwrap()
    }

    #[test]
    fn block_serialization_is_byte_exact() {
        let block = sample_block();
        let bytes = block.serialize().unwrap();
        let restored = Block::deserialize(&bytes).unwrap();
        assert_eq!(restored.raw(), block.raw());
        assert_eq!(restored.transactions(), block.transactions());
        assert_eq!(restored.serialize().unwrap(), bytes);
        assert_eq!(restored.hash(), block.hash());
    }

    #[test]
    fn block_exposes_header_coordinates() {
        let block = sample_block();
        assert_eq!(block.height(), 1);
        assert_eq!(block.id(), block_id(7, 1, 0));
        assert_eq!(block.hash(), BlockDigest::of(block.raw()));
        assert_eq!(block.signature_count(), 2);
        assert!(block.extends(&BlockDigest::default(), &BlockDigest::default()));
        assert_eq!(block.tx_ids().len(), 2);
    }

    #[test]
    fn zero_height_is_rejected() {
        let signer = &Signer::new_for_test(1)[0];
        let header = BlockHeader::new(7, 0, 42, 0, &ChainLink::genesis(), &[]);
        assert!(matches!(
            Block::new_signed(header, vec![], signer),
            Err(BlockError::ZeroHeight)
        ));
    }

    #[test]
    fn garbage_raw_is_rejected() {
        assert!(Block::from_raw(Bytes::from_static(b"nope"), vec![]).is_err());
    }

    #[test]
    fn reference_key_round_trips() {
        let reference = sample_block().reference();
        assert_eq!(BlockReference::from_key(&reference.to_key()), Some(reference));
        assert_eq!(BlockReference::from_key(b"short"), None);
    }

    #[test]
    fn transaction_id_covers_content() {
        let mut tx = Transaction::new(1, "r", "k", vec!["x".into()]);
        assert!(tx.has_valid_id());
        tx.content.push("y".into());
        assert!(!tx.has_valid_id());
    }
}
