// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    config::ImportExport,
    crypto::{PublicKey, Signer},
    types::{ChainId, MergerIndex, SignerIndex},
};

/// Known block authors (mergers) and block endorsers (signers) of one chain.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Committee {
    chain_id: ChainId,
    mergers: Vec<PublicKey>,
    signers: Vec<PublicKey>,
}

impl Committee {
    pub const DEFAULT_FILENAME: &'static str = "committee.yaml";

    pub fn new(chain_id: ChainId, mergers: Vec<PublicKey>, signers: Vec<PublicKey>) -> Arc<Self> {
        // Ensure the list is not empty
        assert!(!mergers.is_empty());
        Arc::new(Self {
            chain_id,
            mergers,
            signers,
        })
    }

    /// Committee over deterministic test keys: the first `mergers` keys of [`Signer::new_for_test`]
    /// author blocks, the following `signers` keys endorse them.
    pub fn new_for_benchmarks(chain_id: ChainId, mergers: usize, signers: usize) -> Arc<Self> {
        let keys: Vec<PublicKey> = Signer::new_for_test(mergers + signers)
            .iter()
            .map(Signer::public_key)
            .collect();
        let (merger_keys, signer_keys) = keys.split_at(mergers);
        Self::new(chain_id, merger_keys.to_vec(), signer_keys.to_vec())
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn len(&self) -> usize {
        self.mergers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mergers.is_empty()
    }

    pub fn merger_key(&self, merger: MergerIndex) -> Option<&PublicKey> {
        self.mergers.get(merger as usize)
    }

    pub fn signer_key(&self, signer: SignerIndex) -> Option<&PublicKey> {
        self.signers.get(signer as usize)
    }

    pub fn known_merger(&self, merger: MergerIndex) -> bool {
        merger < self.mergers.len() as MergerIndex
    }

    pub fn mergers(&self) -> impl Iterator<Item = MergerIndex> {
        0..self.mergers.len() as MergerIndex
    }

    /// Every merger except `me`, the receivers of a broadcast.
    pub fn peers(&self, me: MergerIndex) -> Vec<MergerIndex> {
        self.mergers().filter(|m| *m != me).collect()
    }
}

impl ImportExport for Committee {}
