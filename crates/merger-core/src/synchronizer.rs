// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::Arc,
    time::Duration,
};

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use tokio::{select, sync::mpsc, time::Instant};

use crate::{
    block_store::ChainStore,
    block_verifier::BlockVerifier,
    config::NodeParameters,
    metrics::Metrics,
    network::{
        BlockMessage, InboundMessage, MessageType, OutboundMessage, ReqBlockMessage,
        ReqStatusMessage, ResStatusMessage,
    },
    runtime::now_secs,
    types::{Block, ChainLink, Height, MergerIndex},
};

/// Heights requested ahead of the local tip at once.
const SYNC_WINDOW: Height = 16;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no progress for {0:?}")]
    Stalled(Duration),
    #[error("block at height {height} failed after {retries} requests")]
    RetriesExhausted { height: Height, retries: u32 },
    #[error("network closed during synchronization")]
    NetworkClosed,
    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    pub tip: ChainLink,
    pub applied: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SyncState {
    Running,
    Done,
}

#[derive(Default)]
struct SyncSlot {
    block: Option<Block>,
    /// Last received block was unusable, ask again.
    retry: bool,
    retries: u32,
    requested_at: Option<Instant>,
}

/// Sequential catch-up run before the unresolved pool takes over.
///
/// Blocks are applied strictly in height order on top of the local chain; forks are not
/// considered. A slot whose block does not extend the tip or fails validation is re-requested
/// from a random peer that claims to have it.
pub struct BlockSynchronizer {
    merger: MergerIndex,
    peers: Vec<MergerIndex>,
    request_wait: Duration,
    max_retries: u32,
    control_interval: Duration,
    max_sync_wait: Duration,
    verifier: Arc<dyn BlockVerifier>,
    chain: Arc<dyn ChainStore>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    metrics: Arc<Metrics>,
    tip: ChainLink,
    peer_heights: HashMap<MergerIndex, Height>,
    slots: BTreeMap<Height, SyncSlot>,
    last_progress: Instant,
    applied: usize,
    rng: StdRng,
}

impl BlockSynchronizer {
    pub fn new(
        merger: MergerIndex,
        peers: Vec<MergerIndex>,
        parameters: &NodeParameters,
        verifier: Arc<dyn BlockVerifier>,
        chain: Arc<dyn ChainStore>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        metrics: Arc<Metrics>,
    ) -> io::Result<Self> {
        let tip = chain.latest_link()?.unwrap_or_else(ChainLink::genesis);
        Ok(Self {
            merger,
            peers,
            request_wait: parameters.request_wait,
            max_retries: parameters.max_request_retries,
            control_interval: parameters.sync_control_interval,
            max_sync_wait: parameters.max_sync_wait,
            verifier,
            chain,
            outbound,
            metrics,
            tip,
            peer_heights: HashMap::new(),
            slots: BTreeMap::new(),
            last_progress: Instant::now(),
            applied: 0,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn tip(&self) -> &ChainLink {
        &self.tip
    }

    /// Drives the synchronization until the node caught up with every peer that answered.
    pub async fn run(
        mut self,
        inbound: &mut mpsc::Receiver<InboundMessage>,
    ) -> Result<SyncOutcome, SyncError> {
        tracing::info!("Starting block synchronization from height {}", self.tip.height);
        self.start();
        let mut control = tokio::time::interval(self.control_interval);
        control.tick().await;
        loop {
            select! {
                message = inbound.recv() => {
                    let Some(message) = message else {
                        return Err(SyncError::NetworkClosed);
                    };
                    self.handle_message(&message);
                }
                _tick = control.tick() => {
                    if self.control_step(Instant::now())? == SyncState::Done {
                        tracing::info!(
                            "Block synchronization done at height {} ({} blocks applied)",
                            self.tip.height,
                            self.applied
                        );
                        return Ok(SyncOutcome {
                            tip: self.tip,
                            applied: self.applied,
                        });
                    }
                }
            }
        }
    }

    /// Asks every peer for its status and the block after the local tip.
    pub fn start(&mut self) {
        self.last_progress = Instant::now();
        let status = ReqStatusMessage {
            merger: self.merger,
            time: now_secs(),
        };
        self.send(OutboundMessage::broadcast(MessageType::ReqStatus, &status));
        let request = self.request_for(self.tip.height + 1);
        self.send(OutboundMessage::broadcast(MessageType::ReqBlock, &request));
    }

    pub fn handle_message(&mut self, message: &InboundMessage) {
        match message.kind {
            MessageType::ResStatus => match message.decode::<ResStatusMessage>() {
                Ok(status) => {
                    tracing::debug!("Merger {} is at height {}", message.sender, status.height);
                    self.peer_heights.insert(message.sender, status.height);
                }
                Err(e) => tracing::warn!("Malformed status from merger {}: {e}", message.sender),
            },
            MessageType::Block => {
                match message
                    .decode::<BlockMessage>()
                    .and_then(BlockMessage::into_block)
                {
                    Ok(block) => self.receive_block(block),
                    Err(e) => {
                        tracing::warn!("Malformed block from merger {}: {e}", message.sender)
                    }
                }
            }
            kind => tracing::debug!(
                "Ignoring {kind:?} from merger {} during synchronization",
                message.sender
            ),
        }
    }

    /// Applies what is ready, re-requests what is missing and decides whether to finish.
    pub fn control_step(&mut self, now: Instant) -> Result<SyncState, SyncError> {
        self.apply_ready_blocks(now)?;
        self.request_blocks(now)?;
        if self.is_caught_up() {
            self.slots.clear();
            return Ok(SyncState::Done);
        }
        let idle = now.saturating_duration_since(self.last_progress);
        if idle > self.max_sync_wait {
            return Err(SyncError::Stalled(idle));
        }
        Ok(SyncState::Running)
    }

    fn receive_block(&mut self, block: Block) {
        let height = block.height();
        if height <= self.tip.height {
            return;
        }
        let slot = self.slots.entry(height).or_default();
        if slot.block.is_some() {
            return;
        }
        slot.block = Some(block);
        slot.retry = false;
    }

    fn apply_ready_blocks(&mut self, now: Instant) -> Result<(), SyncError> {
        loop {
            let next = self.tip.height + 1;
            let Some(slot) = self.slots.get_mut(&next) else {
                return Ok(());
            };
            let Some(block) = slot.block.take() else {
                return Ok(());
            };
            let valid = block.extends(&self.tip.id, &self.tip.hash)
                && self.verifier.is_valid_early(&block)
                && self.verifier.is_valid_late(&block);
            if !valid {
                tracing::warn!("Block {block:?} does not continue the local chain, retrying");
                slot.retry = true;
                return Ok(());
            }
            self.chain.save_block(&block)?;
            self.slots.remove(&next);
            self.tip = block.link();
            self.last_progress = now;
            self.applied += 1;
            self.metrics.sync_blocks_applied_total.inc();
            self.metrics.finalized_height.set(self.tip.height as i64);
        }
    }

    fn request_blocks(&mut self, now: Instant) -> Result<(), SyncError> {
        let Some(target) = self.best_peer_height() else {
            return Ok(());
        };
        let last = target.min(self.tip.height + SYNC_WINDOW);
        for height in self.tip.height + 1..=last {
            let receiver = self.random_peer_at(height);
            let slot = self.slots.entry(height).or_default();
            if slot.block.is_some() {
                continue;
            }
            let due = slot.retry
                || slot
                    .requested_at
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.request_wait);
            if !due {
                continue;
            }
            if slot.requested_at.is_some() || slot.retry {
                if slot.retries >= self.max_retries {
                    return Err(SyncError::RetriesExhausted {
                        height,
                        retries: slot.retries,
                    });
                }
                slot.retries += 1;
            }
            slot.retry = false;
            slot.requested_at = Some(now);
            let request = self.request_for(height);
            let receivers = receiver.into_iter().collect();
            self.metrics
                .block_requests_sent_total
                .with_label_values(&["sync"])
                .inc();
            self.send(OutboundMessage::to_receivers(
                MessageType::ReqBlock,
                receivers,
                &request,
            ));
        }
        Ok(())
    }

    fn is_caught_up(&self) -> bool {
        let heard = !self.peer_heights.is_empty() || self.peers.is_empty();
        let behind = self
            .best_peer_height()
            .is_some_and(|height| height > self.tip.height);
        heard && !behind && !self.slots.contains_key(&(self.tip.height + 1))
    }

    fn best_peer_height(&self) -> Option<Height> {
        self.peer_heights.values().copied().max()
    }

    fn random_peer_at(&mut self, height: Height) -> Option<MergerIndex> {
        let mut candidates: Vec<_> = self
            .peer_heights
            .iter()
            .filter(|(_, reported)| **reported >= height)
            .map(|(peer, _)| *peer)
            .collect();
        candidates.sort_unstable();
        candidates.choose(&mut self.rng).copied()
    }

    fn request_for(&self, height: Height) -> ReqBlockMessage {
        let prev_hash = (height == self.tip.height + 1).then_some(self.tip.hash);
        ReqBlockMessage {
            merger: self.merger,
            time: now_secs(),
            height,
            prev_hash,
            hash: None,
        }
    }

    fn send(&self, message: Result<OutboundMessage, crate::network::MessageError>) {
        match message {
            Ok(message) => {
                if self.outbound.send(message).is_err() {
                    tracing::debug!("Network is shut down, dropping synchronization message");
                }
            }
            Err(e) => tracing::error!("Failed to encode synchronization message: {e}"),
        }
    }
}
