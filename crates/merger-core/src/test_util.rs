// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{collections::HashMap, sync::Arc};

use crate::{
    committee::Committee,
    crypto::Signer,
    types::{
        Block, BlockHeader, ChainId, ChainLink, Height, MergerIndex, SupportSignature, Transaction,
    },
};

pub const TEST_CHAIN_ID: ChainId = 7;
pub const TEST_MERGERS: usize = 4;
pub const TEST_SIGNERS: usize = 8;

/// Named blocks drawn from a compact description.
///
/// `"B11a<-B10:1; B12<-B11a:1"` creates `B11a` extending `B10` with one support signature and
/// `B12` extending `B11a`. `G` is the genesis link. A trailing letter picks the merger
/// (`a` = 1, `b` = 2, ...) so siblings at one height get distinct ids.
pub struct TestChain {
    keys: Vec<Signer>,
    links: HashMap<String, ChainLink>,
    blocks: HashMap<String, Block>,
    transactions_per_block: usize,
}

impl TestChain {
    pub fn new() -> Self {
        let mut links = HashMap::new();
        links.insert("G".to_string(), ChainLink::genesis());
        Self {
            keys: Signer::new_for_test(TEST_MERGERS + TEST_SIGNERS),
            links,
            blocks: HashMap::new(),
            transactions_per_block: 0,
        }
    }

    pub fn committee(&self) -> Arc<Committee> {
        Committee::new_for_benchmarks(TEST_CHAIN_ID, TEST_MERGERS, TEST_SIGNERS)
    }

    pub fn with_transactions(mut self, transactions_per_block: usize) -> Self {
        self.transactions_per_block = transactions_per_block;
        self
    }

    /// Adds a block named `name` at `height` whose parent is not part of the drawing.
    pub fn with_tip(mut self, name: &str, height: Height) -> Self {
        let parent = ChainLink {
            height: height - 1,
            id: crate::crypto::BlockDigest::of(format!("{name}-parent-id").as_bytes()),
            hash: crate::crypto::BlockDigest::of(format!("{name}-parent-hash").as_bytes()),
            prev_hash: Default::default(),
            time: height - 1,
        };
        let block = self.build(name, &parent, 0);
        self.insert(name, block);
        self
    }

    pub fn draw(mut self, description: &str) -> Self {
        for statement in description.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, rest) = statement
                .split_once("<-")
                .unwrap_or_else(|| panic!("Missing parent in {statement}"));
            let (parent, sigs) = match rest.split_once(':') {
                Some((parent, sigs)) => (parent.trim(), sigs.trim().parse().unwrap()),
                None => (rest.trim(), 0),
            };
            let parent = self
                .links
                .get(parent)
                .unwrap_or_else(|| panic!("Unknown parent {parent}"))
                .clone();
            let name = name.trim();
            let block = self.build(name, &parent, sigs);
            self.insert(name, block);
        }
        self
    }

    fn insert(&mut self, name: &str, block: Block) {
        self.links.insert(name.to_string(), block.link());
        self.blocks.insert(name.to_string(), block);
    }

    fn build(&self, name: &str, parent: &ChainLink, sigs: usize) -> Block {
        let height = parent.height + 1;
        let merger = merger_for(name);
        let transactions: Vec<_> = (0..self.transactions_per_block)
            .map(|i| Transaction::new(height, name, "test", vec![format!("{name}-{i}")]))
            .collect();
        let mut header =
            BlockHeader::new(TEST_CHAIN_ID, height, height, merger, parent, &transactions);
        let (id, root) = (header.block_id(), header.tx_root);
        for signer in 0..sigs {
            let key = &self.keys[TEST_MERGERS + signer % TEST_SIGNERS];
            header = header.with_support(SupportSignature::sign(
                signer as u64,
                key,
                &id,
                &root,
                height,
            ));
        }
        Block::new_signed(header, transactions, &self.keys[merger as usize]).unwrap()
    }

    pub fn block(&self, name: &str) -> &Block {
        self.blocks
            .get(name)
            .unwrap_or_else(|| panic!("Unknown block {name}"))
    }

    pub fn link(&self, name: &str) -> ChainLink {
        self.links
            .get(name)
            .unwrap_or_else(|| panic!("Unknown link {name}"))
            .clone()
    }

    /// Blocks for a space separated list of names, in that order.
    pub fn blocks(&self, names: &str) -> Vec<Block> {
        names
            .split_whitespace()
            .map(|name| self.block(name).clone())
            .collect()
    }

    pub fn signer(&self, merger: MergerIndex) -> &Signer {
        &self.keys[merger as usize]
    }
}

fn merger_for(name: &str) -> MergerIndex {
    match name.chars().last() {
        Some(c) if c.is_ascii_lowercase() => (c as u64 - 'a' as u64 + 1) % TEST_MERGERS as u64,
        _ => 0,
    }
}
