// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{collections::VecDeque, sync::Arc, time::Duration};

use crate::{
    block_store::BackupStore,
    config::NodeParameters,
    runtime::timestamp_utc,
    types::{Block, BlockHash, BlockId, BlockReference, ChainLink, Height, NextLink},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParentLink {
    /// Extends the finalized tip. Only found in bin 0.
    Root,
    /// Index into the previous bin.
    Index(usize),
    Unlinked,
}

struct PoolEntry {
    block: Block,
    parent: ParentLink,
    confirm_level: u64,
    linked: bool,
    /// Ancestor ids from the finalized tip, oldest first, excluding the block itself.
    block_layer: Vec<BlockId>,
}

impl PoolEntry {
    fn layer_for_children(&self) -> Vec<BlockId> {
        let mut layer = self.block_layer.clone();
        layer.push(self.block.id());
        layer
    }
}

#[derive(Clone, Debug)]
pub struct PoolParameters {
    pub block_confirm_level: u64,
    /// Minimum spacing of heights; zero disables the future height check.
    pub block_interval: Duration,
    /// Hard limit on how many heights above the finalized tip the pool holds.
    pub max_bins: u64,
}

impl From<&NodeParameters> for PoolParameters {
    fn from(parameters: &NodeParameters) -> Self {
        Self {
            block_confirm_level: parameters.block_confirm_level,
            block_interval: parameters.block_interval,
            max_bins: parameters.max_pool_bins,
        }
    }
}

impl Default for PoolParameters {
    fn default() -> Self {
        Self::from(&NodeParameters::default())
    }
}

/// A block whose full ancestry back to the finalized tip is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkedBlock {
    pub block: Block,
    pub block_layer: Vec<BlockId>,
}

/// Why [`UnresolvedBlockPool::push`] refused a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    /// At or below the finalized height.
    Stale,
    /// Further above the finalized tip than the bin cap or the elapsed time allows.
    TooFarAhead,
    /// Next height after the finalized tip, but a different parent.
    Unlinkable,
}

impl Rejection {
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::Stale => "stale",
            Rejection::TooFarAhead => "too_far_ahead",
            Rejection::Unlinkable => "unlinkable",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PushResult {
    /// Height of the stored block, 0 when the block was refused.
    pub height: Height,
    pub linked: bool,
    pub block_layer: Vec<BlockId>,
    pub duplicate: bool,
    /// The pushed block and every stored descendant it linked, ancestors first.
    pub newly_linked: Vec<LinkedBlock>,
    pub rejection: Option<Rejection>,
}

impl PushResult {
    fn rejected(rejection: Rejection) -> Self {
        Self {
            rejection: Some(rejection),
            ..Self::default()
        }
    }

    pub fn is_rejected(&self) -> bool {
        self.rejection.is_some()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedBlocks {
    /// Newly finalized blocks, lowest first.
    pub resolved: Vec<Block>,
    /// Competing candidates superseded by the finalized blocks.
    pub dropped: Vec<BlockId>,
}

#[derive(Clone, Debug, Default)]
pub struct RestoredPool {
    pub restored: usize,
    pub newly_linked: Vec<LinkedBlock>,
}

#[derive(Clone)]
struct MostPossible {
    link: ChainLink,
    layer: Vec<BlockId>,
}

/// Candidate blocks above the finalized tip, grouped into bins by height.
///
/// Bin `i` holds the candidates for height `last.height + i + 1`. Entries reference their parent
/// by index into the previous bin, so forks share a common arena and no entry is aliased.
pub struct UnresolvedBlockPool {
    bins: Vec<Vec<PoolEntry>>,
    last: ChainLink,
    parameters: PoolParameters,
    backup: Arc<dyn BackupStore>,
    most_possible: Option<MostPossible>,
}

impl UnresolvedBlockPool {
    pub fn new(tip: ChainLink, parameters: PoolParameters, backup: Arc<dyn BackupStore>) -> Self {
        Self {
            bins: Vec::new(),
            last: tip,
            parameters,
            backup,
            most_possible: None,
        }
    }

    /// Moves the finalized tip and forgets every candidate.
    pub fn set_pool(&mut self, tip: ChainLink) {
        self.bins.clear();
        self.last = tip;
        self.most_possible = None;
    }

    pub fn last_link(&self) -> &ChainLink {
        &self.last
    }

    pub fn push(&mut self, block: Block, restore: bool) -> PushResult {
        let height = block.height();
        if height <= self.last.height {
            tracing::debug!(
                "Refusing stale block {block:?}, finalized height is {}",
                self.last.height
            );
            return PushResult::rejected(Rejection::Stale);
        }
        let offset = height - self.last.height - 1;
        if !self.is_plausible_offset(offset) {
            tracing::warn!(
                "Refusing block {block:?}: {offset} heights ahead of the finalized tip is too far"
            );
            return PushResult::rejected(Rejection::TooFarAhead);
        }
        let bin = offset as usize;

        if let Some(existing) = self
            .bins
            .get(bin)
            .and_then(|entries| Self::find(entries, &block.id(), &block.hash()))
        {
            let entry = &self.bins[bin][existing];
            return PushResult {
                height,
                linked: entry.linked,
                block_layer: entry.block_layer.clone(),
                duplicate: true,
                newly_linked: Vec::new(),
                rejection: None,
            };
        }

        let parent = if bin == 0 {
            if !block.extends(&self.last.id, &self.last.hash) {
                tracing::debug!("Refusing block {block:?}: does not extend the finalized tip");
                return PushResult::rejected(Rejection::Unlinkable);
            }
            ParentLink::Root
        } else {
            self.bins
                .get(bin - 1)
                .and_then(|previous| Self::find(previous, &block.prev_id(), &block.prev_hash()))
                .map_or(ParentLink::Unlinked, ParentLink::Index)
        };

        if self.bins.len() <= bin {
            self.bins.resize_with(bin + 1, Vec::new);
        }
        let (linked, block_layer) = match parent {
            ParentLink::Root => (true, Vec::new()),
            ParentLink::Index(p) if self.bins[bin - 1][p].linked => {
                (true, self.bins[bin - 1][p].layer_for_children())
            }
            _ => (false, Vec::new()),
        };
        let serialized = (!restore).then(|| block.serialize());
        let reference = block.reference();
        let (id, hash) = (block.id(), block.hash());
        self.bins[bin].push(PoolEntry {
            block,
            parent,
            confirm_level: 0,
            linked,
            block_layer: block_layer.clone(),
        });
        let index = self.bins[bin].len() - 1;

        // Children that arrived before this block.
        if let Some(next) = self.bins.get_mut(bin + 1) {
            for child in next.iter_mut() {
                if child.parent == ParentLink::Unlinked && child.block.extends(&id, &hash) {
                    child.parent = ParentLink::Index(index);
                }
            }
        }

        let newly_linked = if linked {
            self.propagate_links(bin, index)
        } else {
            Vec::new()
        };
        self.most_possible = None;

        match serialized {
            Some(Ok(bytes)) => {
                if let Err(e) = self.backup.save(&reference, &bytes) {
                    tracing::error!("Failed to back up block {reference:?}: {e}");
                }
            }
            Some(Err(e)) => tracing::error!("Failed to encode block {reference:?} for backup: {e}"),
            None => {}
        }

        PushResult {
            height,
            linked,
            block_layer,
            duplicate: false,
            newly_linked,
            rejection: None,
        }
    }

    /// First candidate at `height` matching the given hashes; `None` filters match anything.
    /// Height 0 looks up the tip of the most possible branch.
    pub fn get_block(
        &mut self,
        height: Height,
        prev_hash: Option<BlockHash>,
        hash: Option<BlockHash>,
    ) -> Option<Block> {
        let (height, prev_hash, hash) = if height == 0 {
            let tip = self.get_most_possible_link();
            (tip.height, Some(tip.prev_hash), Some(tip.hash))
        } else {
            (height, prev_hash, hash)
        };
        if height <= self.last.height {
            return None;
        }
        let bin = self.bins.get((height - self.last.height - 1) as usize)?;
        bin.iter()
            .find(|entry| {
                prev_hash.map_or(true, |p| entry.block.prev_hash() == p)
                    && hash.map_or(true, |h| entry.block.hash() == h)
            })
            .map(|entry| entry.block.clone())
    }

    /// Finalizes every bin-0 candidate that gathered enough confirmation and has a successor.
    pub fn get_resolved_blocks(&mut self) -> ResolvedBlocks {
        let mut result = ResolvedBlocks::default();
        let mut retired = Vec::new();
        loop {
            self.update_confirm_level();
            if self.bins.len() < 2 || self.bins[0].is_empty() || self.bins[1].is_empty() {
                break;
            }
            let mut best: Option<(usize, u64)> = None;
            for (i, entry) in self.bins[0].iter().enumerate() {
                if entry.parent != ParentLink::Root {
                    continue;
                }
                if best.map_or(true, |(_, level)| entry.confirm_level > level) {
                    best = Some((i, entry.confirm_level));
                }
            }
            let Some((best, level)) = best else {
                break;
            };
            let has_successor = self.bins[1]
                .iter()
                .any(|entry| entry.parent == ParentLink::Index(best));
            if level < self.parameters.block_confirm_level || !has_successor {
                break;
            }

            let finalized = self.bins.remove(0);
            for (i, entry) in finalized.into_iter().enumerate() {
                retired.push(entry.block.reference());
                if i == best {
                    tracing::debug!(
                        "Finalized {:?} with confirm level {}",
                        entry.block,
                        entry.confirm_level
                    );
                    self.last = entry.block.link();
                    result.resolved.push(entry.block);
                } else {
                    tracing::debug!("Dropping superseded candidate {:?}", entry.block);
                    result.dropped.push(entry.block.id());
                }
            }
            let (tip_id, tip_hash) = (self.last.id, self.last.hash);
            for entry in self.bins[0].iter_mut() {
                entry.parent = if entry.block.extends(&tip_id, &tip_hash) {
                    ParentLink::Root
                } else {
                    ParentLink::Unlinked
                };
            }
        }

        if !retired.is_empty() {
            self.relink();
            self.most_possible = None;
            for reference in &retired {
                if let Err(e) = self.backup.delete(reference) {
                    tracing::error!("Failed to remove {reference:?} from backup: {e}");
                }
            }
        }
        result
    }

    /// The block still missing to extend the most possible branch, if the pool holds anything
    /// above that branch's tip.
    pub fn get_unresolved_lowest_link(&mut self) -> NextLink {
        let tip = self.most_possible().link.clone();
        if self.last.height + self.bins.len() as Height > tip.height {
            NextLink {
                height: tip.height + 1,
                prev_hash: tip.hash,
            }
        } else {
            NextLink::none()
        }
    }

    /// Tip of the deepest linked branch, or the finalized tip while nothing is linked.
    pub fn get_most_possible_link(&mut self) -> ChainLink {
        self.most_possible().link.clone()
    }

    /// Ids of the most possible branch from bin 0 up to and including its tip.
    pub fn get_most_possible_block_layer(&mut self) -> Vec<BlockId> {
        self.most_possible().layer.clone()
    }

    pub fn block_layer_of(&self, id: &BlockId) -> Option<Vec<BlockId>> {
        self.bins
            .iter()
            .flatten()
            .find(|entry| entry.linked && entry.block.id() == *id)
            .map(|entry| entry.block_layer.clone())
    }

    pub fn len(&self) -> usize {
        self.bins.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(Vec::is_empty)
    }

    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    pub fn has_unresolved_blocks(&self) -> bool {
        !self.is_empty()
    }

    /// Re-pushes every backed up block in store order without writing it back.
    pub fn restore_pool(&mut self) -> RestoredPool {
        let mut restored = RestoredPool::default();
        let references = match self.backup.list_ids() {
            Ok(references) => references,
            Err(e) => {
                tracing::error!("Failed to list backed up blocks: {e}");
                return restored;
            }
        };
        for reference in references {
            let bytes = match self.backup.read(&reference) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!("Failed to read backed up block {reference:?}: {e}");
                    continue;
                }
            };
            let block = match Block::deserialize(&bytes) {
                Ok(block) => block,
                Err(e) => {
                    tracing::warn!("Discarding undecodable backup of {reference:?}: {e}");
                    self.discard_backup(&reference);
                    continue;
                }
            };
            let result = self.push(block, true);
            if result.is_rejected() {
                self.discard_backup(&reference);
                continue;
            }
            restored.restored += 1;
            restored.newly_linked.extend(result.newly_linked);
        }
        tracing::info!(
            "Restored {} unresolved blocks above height {}",
            restored.restored,
            self.last.height
        );
        restored
    }

    fn discard_backup(&self, reference: &BlockReference) {
        if let Err(e) = self.backup.delete(reference) {
            tracing::error!("Failed to remove {reference:?} from backup: {e}");
        }
    }

    fn find(entries: &[PoolEntry], id: &BlockId, hash: &BlockHash) -> Option<usize> {
        entries
            .iter()
            .position(|entry| entry.block.id() == *id && entry.block.hash() == *hash)
    }

    fn is_plausible_offset(&self, offset: u64) -> bool {
        if offset >= self.parameters.max_bins {
            return false;
        }
        if self.parameters.block_interval.is_zero() {
            return true;
        }
        let elapsed = timestamp_utc().saturating_sub(Duration::from_secs(self.last.time));
        let required = self
            .parameters
            .block_interval
            .saturating_mul(offset.min(u32::MAX as u64) as u32);
        elapsed >= required
    }

    /// Links stored descendants of a freshly linked entry, breadth first.
    fn propagate_links(&mut self, bin: usize, index: usize) -> Vec<LinkedBlock> {
        let root = &self.bins[bin][index];
        let mut newly_linked = vec![LinkedBlock {
            block: root.block.clone(),
            block_layer: root.block_layer.clone(),
        }];
        let mut queue = VecDeque::from([(bin, index)]);
        while let Some((b, i)) = queue.pop_front() {
            let layer = self.bins[b][i].layer_for_children();
            let Some(next) = self.bins.get_mut(b + 1) else {
                continue;
            };
            for (child_index, child) in next.iter_mut().enumerate() {
                if child.parent != ParentLink::Index(i) || child.linked {
                    continue;
                }
                child.linked = true;
                child.block_layer = layer.clone();
                newly_linked.push(LinkedBlock {
                    block: child.block.clone(),
                    block_layer: layer.clone(),
                });
                queue.push_back((b + 1, child_index));
            }
        }
        newly_linked
    }

    /// Own signatures plus the weight of every descendant, one sweep from the deepest bin.
    fn update_confirm_level(&mut self) {
        for entry in self.bins.iter_mut().flatten() {
            entry.confirm_level = entry.block.signature_count() as u64;
        }
        for b in (1..self.bins.len()).rev() {
            let (lower, upper) = self.bins.split_at_mut(b);
            let parents = &mut lower[b - 1];
            for child in &upper[0] {
                if let ParentLink::Index(p) = child.parent {
                    parents[p].confirm_level += child.confirm_level;
                }
            }
        }
    }

    /// Recomputes linkage and layers of every entry relative to the current tip.
    fn relink(&mut self) {
        let (tip_id, tip_hash) = (self.last.id, self.last.hash);
        for b in 0..self.bins.len() {
            let (lower, upper) = self.bins.split_at_mut(b);
            let previous = lower.last();
            for entry in upper[0].iter_mut() {
                if b == 0 {
                    entry.parent = if entry.block.extends(&tip_id, &tip_hash) {
                        ParentLink::Root
                    } else {
                        ParentLink::Unlinked
                    };
                }
                let (linked, layer) = match (entry.parent, previous) {
                    (ParentLink::Root, _) => (true, Vec::new()),
                    (ParentLink::Index(p), Some(previous)) if previous[p].linked => {
                        (true, previous[p].layer_for_children())
                    }
                    _ => (false, Vec::new()),
                };
                entry.linked = linked;
                entry.block_layer = layer;
            }
        }
    }

    fn most_possible(&mut self) -> &MostPossible {
        let (bins, last) = (&self.bins, &self.last);
        self.most_possible
            .get_or_insert_with(|| Self::compute_most_possible(bins, last))
    }

    /// Depth first walk from the root-linked bin-0 entries in insertion order; the first entry
    /// found at the greatest depth wins.
    fn compute_most_possible(bins: &[Vec<PoolEntry>], last: &ChainLink) -> MostPossible {
        let mut best: Option<(usize, usize)> = None;
        let mut stack: Vec<(usize, usize)> = Vec::new();
        if let Some(first) = bins.first() {
            for (i, entry) in first.iter().enumerate().rev() {
                if entry.parent == ParentLink::Root {
                    stack.push((0, i));
                }
            }
        }
        while let Some((b, i)) = stack.pop() {
            if best.map_or(true, |(best_bin, _)| b > best_bin) {
                best = Some((b, i));
            }
            if let Some(next) = bins.get(b + 1) {
                for (child_index, child) in next.iter().enumerate().rev() {
                    if child.parent == ParentLink::Index(i) {
                        stack.push((b + 1, child_index));
                    }
                }
            }
        }
        match best {
            Some((b, i)) => {
                let entry = &bins[b][i];
                MostPossible {
                    link: entry.block.link(),
                    layer: entry.layer_for_children(),
                }
            }
            None => MostPossible {
                link: last.clone(),
                layer: Vec::new(),
            },
        }
    }
}
