// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashSet, sync::Arc};

use crate::{
    committee::Committee,
    crypto::merkle_root,
    types::{Block, SupportSignature},
};

/// Validity predicates applied to incoming blocks. Neither touches shared state.
pub trait BlockVerifier: Send + Sync {
    /// Checks that need nothing but the block itself.
    fn is_valid_early(&self, block: &Block) -> bool;

    /// Checks run once the block is about to become part of the permanent chain.
    fn is_valid_late(&self, block: &Block) -> bool;
}

pub struct SignatureVerifier {
    committee: Arc<Committee>,
}

impl SignatureVerifier {
    pub fn new(committee: Arc<Committee>) -> Self {
        Self { committee }
    }

    fn check_early(&self, block: &Block) -> Result<(), String> {
        let header = block.header();
        if header.chain_id != self.committee.chain_id() {
            return Err(format!("foreign chain {}", header.chain_id));
        }
        if block.raw().is_empty() {
            return Err("empty raw header".to_string());
        }
        let carried: Vec<_> = block.transactions().iter().map(|tx| tx.txid).collect();
        if carried != header.tx_ids {
            return Err("transaction ids do not match the body".to_string());
        }
        if let Some(tx) = block.transactions().iter().find(|tx| !tx.has_valid_id()) {
            return Err(format!("transaction {} has a forged id", tx.txid));
        }
        if merkle_root(&header.tx_ids) != header.tx_root {
            return Err("transaction root mismatch".to_string());
        }
        let key = self
            .committee
            .merger_key(header.merger)
            .ok_or_else(|| format!("unknown merger {}", header.merger))?;
        let message = header.signing_bytes().map_err(|e| e.to_string())?;
        key.verify(&message, block.merger_signature())
            .map_err(|e| format!("bad merger signature: {e}"))
    }

    fn check_late(&self, block: &Block) -> Result<(), String> {
        let header = block.header();
        let mut seen = HashSet::new();
        for support in &header.support_signatures {
            if !seen.insert(support.signer) {
                return Err(format!("signer {} signed twice", support.signer));
            }
            let key = self
                .committee
                .signer_key(support.signer)
                .ok_or_else(|| format!("unknown signer {}", support.signer))?;
            let message =
                SupportSignature::message(support.signer, &block.id(), &header.tx_root, block.height());
            key.verify(&message, &support.signature)
                .map_err(|e| format!("bad support signature of {}: {e}", support.signer))?;
        }
        Ok(())
    }
}

impl BlockVerifier for SignatureVerifier {
    fn is_valid_early(&self, block: &Block) -> bool {
        match self.check_early(block) {
            Ok(()) => true,
            Err(reason) => {
                tracing::warn!("Block {block:?} failed early validation: {reason}");
                false
            }
        }
    }

    fn is_valid_late(&self, block: &Block) -> bool {
        match self.check_late(block) {
            Ok(()) => true,
            Err(reason) => {
                tracing::warn!("Block {block:?} failed late validation: {reason}");
                false
            }
        }
    }
}

/// Accepts every block. Used where blocks are built without real keys.
#[derive(Default)]
pub struct AcceptAllVerifier;

impl BlockVerifier for AcceptAllVerifier {
    fn is_valid_early(&self, _block: &Block) -> bool {
        true
    }

    fn is_valid_late(&self, _block: &Block) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        crypto::Signer,
        types::{BlockHeader, ChainLink, Transaction},
    };

    const CHAIN: u32 = 3;

    // Keys 0..2 author blocks, keys 2..5 endorse them.
    fn setup() -> (SignatureVerifier, Vec<Signer>) {
        let committee = Committee::new_for_benchmarks(CHAIN, 2, 3);
        (SignatureVerifier::new(committee), Signer::new_for_test(5))
    }

    fn block(keys: &[Signer], merger: u64, supporters: &[u64]) -> Block {
        let transactions = vec![Transaction::new(1, "r", "k", vec!["c".into()])];
        let mut header =
            BlockHeader::new(CHAIN, 1, 10, merger, &ChainLink::genesis(), &transactions);
        let (id, root) = (header.block_id(), header.tx_root);
        for signer in supporters {
            header = header.with_support(SupportSignature::sign(
                *signer,
                &keys[2 + *signer as usize],
                &id,
                &root,
                1,
            ));
        }
        Block::new_signed(header, transactions, &keys[merger as usize]).unwrap()
    }

    #[test]
    fn well_formed_block_passes_both_stages() {
        let (verifier, keys) = setup();
        let block = block(&keys, 1, &[0, 2]);
        assert!(verifier.is_valid_early(&block));
        assert!(verifier.is_valid_late(&block));
    }

    #[test]
    fn wrong_merger_key_fails_early() {
        let (verifier, keys) = setup();
        let transactions = vec![];
        let header = BlockHeader::new(CHAIN, 1, 10, 0, &ChainLink::genesis(), &transactions);
        // signed by merger 1 while claiming merger 0
        let block = Block::new_signed(header, transactions, &keys[1]).unwrap();
        assert!(!verifier.is_valid_early(&block));
    }

    #[test]
    fn tampered_body_fails_early() {
        let (verifier, keys) = setup();
        let block = block(&keys, 0, &[]);
        let tampered = Block::from_raw(block.raw().clone(), vec![]).unwrap();
        assert!(!verifier.is_valid_early(&tampered));
    }

    #[test]
    fn unknown_signer_fails_late() {
        let (verifier, keys) = setup();
        let transactions = vec![];
        let header = BlockHeader::new(CHAIN, 1, 10, 0, &ChainLink::genesis(), &transactions);
        let (id, root) = (header.block_id(), header.tx_root);
        let header = header.with_support(SupportSignature::sign(7, &keys[4], &id, &root, 1));
        let block = Block::new_signed(header, transactions, &keys[0]).unwrap();
        assert!(verifier.is_valid_early(&block));
        assert!(!verifier.is_valid_late(&block));
    }

    #[test]
    fn forged_support_signature_fails_late() {
        let (verifier, keys) = setup();
        let transactions = vec![];
        let header = BlockHeader::new(CHAIN, 1, 10, 0, &ChainLink::genesis(), &transactions);
        let (id, root) = (header.block_id(), header.tx_root);
        // signer 0 slot carrying signer 1's signature
        let mut support = SupportSignature::sign(1, &keys[3], &id, &root, 1);
        support.signer = 0;
        let block =
            Block::new_signed(header.with_support(support), transactions, &keys[0]).unwrap();
        assert!(!verifier.is_valid_late(&block));
    }
}
