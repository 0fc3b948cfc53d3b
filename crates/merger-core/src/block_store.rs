// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{BTreeMap, HashMap},
    io,
};

use parking_lot::RwLock;

use crate::{
    crypto::{merkle_proof, ProofNode},
    types::{Block, BlockId, BlockReference, ChainLink, Height, TransactionId},
};

/// Inclusion proof of a finalized transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionProof {
    pub block_id: BlockId,
    pub proof: Vec<ProofNode>,
}

impl TransactionProof {
    pub fn for_transaction(block: &Block, txid: &TransactionId) -> Option<Self> {
        let index = block.tx_ids().iter().position(|id| id == txid)?;
        Some(Self {
            block_id: block.id(),
            proof: merkle_proof(block.tx_ids(), index),
        })
    }
}

/// Append-only store of finalized blocks.
pub trait ChainStore: Send + Sync {
    fn save_block(&self, block: &Block) -> io::Result<()>;

    /// Block at `height`; height 0 reads the latest block.
    fn read_block(&self, height: Height) -> io::Result<Option<Block>>;

    /// Tip of the finalized chain, `None` while the chain is empty.
    fn latest_link(&self) -> io::Result<Option<ChainLink>>;

    fn transaction_proof(&self, txid: &TransactionId) -> io::Result<Option<TransactionProof>>;
}

/// Write-through copy of blocks that are not finalized yet, used to rebuild the pool on restart.
///
/// `list_ids` returns references in the order they were first saved.
pub trait BackupStore: Send + Sync {
    fn save(&self, reference: &BlockReference, serialized: &[u8]) -> io::Result<()>;

    fn read(&self, reference: &BlockReference) -> io::Result<Option<Vec<u8>>>;

    fn list_ids(&self) -> io::Result<Vec<BlockReference>>;

    fn delete(&self, reference: &BlockReference) -> io::Result<()>;
}

#[derive(Default)]
struct MemoryChain {
    blocks: BTreeMap<Height, Block>,
    transactions: HashMap<TransactionId, Height>,
}

#[derive(Default)]
struct MemoryBackup {
    next_sequence: u64,
    entries: HashMap<BlockReference, (u64, Vec<u8>)>,
}

/// In-memory chain and backup store.
#[derive(Default)]
pub struct MemoryStore {
    chain: RwLock<MemoryChain>,
    backup: RwLock<MemoryBackup>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chain_height(&self) -> Height {
        self.chain
            .read()
            .blocks
            .last_key_value()
            .map(|(height, _)| *height)
            .unwrap_or_default()
    }

    pub fn backup_len(&self) -> usize {
        self.backup.read().entries.len()
    }
}

impl ChainStore for MemoryStore {
    fn save_block(&self, block: &Block) -> io::Result<()> {
        let mut chain = self.chain.write();
        for txid in block.tx_ids() {
            chain.transactions.insert(*txid, block.height());
        }
        chain.blocks.insert(block.height(), block.clone());
        Ok(())
    }

    fn read_block(&self, height: Height) -> io::Result<Option<Block>> {
        let chain = self.chain.read();
        let block = if height == 0 {
            chain.blocks.last_key_value().map(|(_, b)| b.clone())
        } else {
            chain.blocks.get(&height).cloned()
        };
        Ok(block)
    }

    fn latest_link(&self) -> io::Result<Option<ChainLink>> {
        Ok(self
            .chain
            .read()
            .blocks
            .last_key_value()
            .map(|(_, b)| b.link()))
    }

    fn transaction_proof(&self, txid: &TransactionId) -> io::Result<Option<TransactionProof>> {
        let chain = self.chain.read();
        let proof = chain
            .transactions
            .get(txid)
            .and_then(|height| chain.blocks.get(height))
            .and_then(|block| TransactionProof::for_transaction(block, txid));
        Ok(proof)
    }
}

impl BackupStore for MemoryStore {
    fn save(&self, reference: &BlockReference, serialized: &[u8]) -> io::Result<()> {
        let mut backup = self.backup.write();
        let sequence = match backup.entries.get(reference) {
            Some((sequence, _)) => *sequence,
            None => {
                backup.next_sequence += 1;
                backup.next_sequence
            }
        };
        backup
            .entries
            .insert(*reference, (sequence, serialized.to_vec()));
        Ok(())
    }

    fn read(&self, reference: &BlockReference) -> io::Result<Option<Vec<u8>>> {
        Ok(self
            .backup
            .read()
            .entries
            .get(reference)
            .map(|(_, bytes)| bytes.clone()))
    }

    fn list_ids(&self) -> io::Result<Vec<BlockReference>> {
        let backup = self.backup.read();
        let mut references: Vec<_> = backup
            .entries
            .iter()
            .map(|(reference, (sequence, _))| (*sequence, *reference))
            .collect();
        references.sort_unstable();
        Ok(references.into_iter().map(|(_, reference)| reference).collect())
    }

    fn delete(&self, reference: &BlockReference) -> io::Result<()> {
        self.backup.write().entries.remove(reference);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::verify_merkle_proof, test_util::TestChain};

    #[test]
    fn chain_reads_by_height_and_latest() {
        let chain = TestChain::new().draw("B1<-G:1; B2<-B1:1; B3<-B2:1");
        let store = MemoryStore::new();
        assert_eq!(store.latest_link().unwrap(), None);
        for name in ["B1", "B2", "B3"] {
            store.save_block(chain.block(name)).unwrap();
        }
        assert_eq!(store.read_block(2).unwrap().as_ref(), Some(chain.block("B2")));
        assert_eq!(store.read_block(0).unwrap().as_ref(), Some(chain.block("B3")));
        assert_eq!(store.read_block(9).unwrap(), None);
        assert_eq!(store.latest_link().unwrap(), Some(chain.block("B3").link()));
        assert_eq!(store.chain_height(), 3);
    }

    #[test]
    fn transaction_proof_matches_root() {
        let chain = TestChain::new().with_transactions(5).draw("B1<-G:1");
        let store = MemoryStore::new();
        let block = chain.block("B1");
        store.save_block(block).unwrap();
        let txid = block.tx_ids()[3];
        let proof = store.transaction_proof(&txid).unwrap().unwrap();
        assert_eq!(proof.block_id, block.id());
        assert!(verify_merkle_proof(&txid, &proof.proof, &block.header().tx_root));
        assert_eq!(
            store
                .transaction_proof(&TransactionId::default())
                .unwrap(),
            None
        );
    }

    #[test]
    fn backup_is_keyed_by_block_version() {
        let chain = TestChain::new().draw("B1<-G:1; B1b<-G:2");
        let store = MemoryStore::new();
        let (first, second) = (chain.block("B1"), chain.block("B1b"));
        store.save(&first.reference(), b"one").unwrap();
        store.save(&second.reference(), b"two").unwrap();
        store.save(&first.reference(), b"one again").unwrap();
        assert_eq!(
            store.list_ids().unwrap(),
            vec![first.reference(), second.reference()]
        );
        store.delete(&first.reference()).unwrap();
        assert_eq!(store.read(&first.reference()).unwrap(), None);
        assert_eq!(store.read(&second.reference()).unwrap(), Some(b"two".to_vec()));
    }
}
