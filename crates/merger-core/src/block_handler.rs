// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::types::{BlockId, Transaction, TransactionId};

/// Folds the transactions of linked blocks into speculative ledger state.
pub trait LedgerProjector: Send + Sync {
    /// Applies `transactions` of `block_id` on top of the branch named by `block_layer`.
    /// Calling it twice for the same block has no further effect.
    fn project(&self, transactions: &[Transaction], block_id: &BlockId, block_layer: &[BlockId]);

    /// Discards the projection of a block that lost its fork.
    fn invalidate(&self, block_id: &BlockId);
}

/// Pending transactions not yet included in a block.
pub trait TransactionPool: Send + Sync {
    fn remove_transactions(&self, txids: &[TransactionId]);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Projection {
    pub block_layer: Vec<BlockId>,
    pub transactions: Vec<TransactionId>,
}

#[derive(Default)]
struct LayeredState {
    projections: HashMap<BlockId, Projection>,
    // Blocks in the order they were first projected.
    applied: Vec<BlockId>,
}

/// Keeps one projection per linked block, keyed by block id, each remembering the branch it
/// was applied on.
#[derive(Default)]
pub struct LayeredLedger {
    state: Mutex<LayeredState>,
}

impl LayeredLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(&self, block_id: &BlockId) -> Option<Projection> {
        self.state.lock().projections.get(block_id).cloned()
    }

    pub fn projected_blocks(&self) -> Vec<BlockId> {
        self.state.lock().applied.clone()
    }

    /// Transactions visible on the branch ending at `block_id`.
    pub fn visible_transactions(&self, block_id: &BlockId) -> Vec<TransactionId> {
        let state = self.state.lock();
        let Some(tip) = state.projections.get(block_id) else {
            return Vec::new();
        };
        tip.block_layer
            .iter()
            .chain(std::iter::once(block_id))
            .filter_map(|id| state.projections.get(id))
            .flat_map(|projection| projection.transactions.iter().copied())
            .collect()
    }
}

impl LedgerProjector for LayeredLedger {
    fn project(&self, transactions: &[Transaction], block_id: &BlockId, block_layer: &[BlockId]) {
        let mut state = self.state.lock();
        let projection = Projection {
            block_layer: block_layer.to_vec(),
            transactions: transactions.iter().map(|tx| tx.txid).collect(),
        };
        if state.projections.insert(*block_id, projection).is_none() {
            state.applied.push(*block_id);
            tracing::debug!(
                "Projected {} transactions of {block_id} on a layer of {}",
                transactions.len(),
                block_layer.len()
            );
        }
    }

    fn invalidate(&self, block_id: &BlockId) {
        let mut state = self.state.lock();
        if state.projections.remove(block_id).is_some() {
            state.applied.retain(|id| id != block_id);
            tracing::debug!("Invalidated projection of {block_id}");
        }
    }
}

#[derive(Default)]
pub struct PendingTransactions {
    pending: Mutex<HashMap<TransactionId, Transaction>>,
}

impl PendingTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, transaction: Transaction) {
        self.pending.lock().insert(transaction.txid, transaction);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, txid: &TransactionId) -> bool {
        self.pending.lock().contains_key(txid)
    }
}

impl TransactionPool for PendingTransactions {
    fn remove_transactions(&self, txids: &[TransactionId]) {
        let txids: HashSet<_> = txids.iter().collect();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|txid, _| !txids.contains(txid));
        let removed = before - pending.len();
        if removed > 0 {
            tracing::debug!("Removed {removed} transactions included in blocks");
        }
    }
}
