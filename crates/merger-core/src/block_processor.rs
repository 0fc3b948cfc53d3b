// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    block_handler::{LayeredLedger, LedgerProjector, PendingTransactions, TransactionPool},
    block_pool::{LinkedBlock, PoolParameters, UnresolvedBlockPool},
    block_requests::{BlockRequestRecord, BlockRequestTracker},
    block_store::{BackupStore, ChainStore, MemoryStore},
    block_verifier::BlockVerifier,
    config::NodeParameters,
    metrics::Metrics,
    network::{
        BlockHeightMessage, BlockMessage, ErrorMessage, InboundMessage, MessageType,
        OutboundMessage, ReqBlockMessage, ReqCheckMessage, ReqStatusMessage, ResCheckMessage,
        ResStatusMessage, ERROR_NO_BLOCK, ERROR_UNKNOWN,
    },
    runtime::{now_secs, timestamp_utc},
    types::{Block, BlockId, ChainLink, Height, MergerIndex, NextLink},
};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("block at height {height} could not be obtained after {retries} requests")]
    UnresolvableGap { height: Height, retries: u32 },
}

/// Everything the processor talks to besides the network.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn BlockVerifier>,
    pub chain: Arc<dyn ChainStore>,
    pub backup: Arc<dyn BackupStore>,
    pub ledger: Arc<dyn LedgerProjector>,
    pub mempool: Arc<dyn TransactionPool>,
}

impl Collaborators {
    /// Memory backed stores with an in-memory ledger and mempool.
    pub fn in_memory(verifier: Arc<dyn BlockVerifier>) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            verifier,
            chain: store.clone(),
            backup: store,
            ledger: Arc::new(LayeredLedger::new()),
            mempool: Arc::new(PendingTransactions::new()),
        }
    }
}

/// Turns inbound messages into pool operations and drives block requests.
///
/// The pool and the request tracker sit behind separate locks, each taken once per entry point.
/// Projection, persistence, late validation and sends happen after the pool lock is released.
pub struct BlockProcessor {
    merger: MergerIndex,
    pool: Mutex<UnresolvedBlockPool>,
    requests: Mutex<BlockRequestTracker>,
    verifier: Arc<dyn BlockVerifier>,
    chain: Arc<dyn ChainStore>,
    ledger: Arc<dyn LedgerProjector>,
    mempool: Arc<dyn TransactionPool>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    metrics: Arc<Metrics>,
}

impl BlockProcessor {
    pub fn new(
        merger: MergerIndex,
        parameters: &NodeParameters,
        tip: ChainLink,
        collaborators: Collaborators,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let pool = UnresolvedBlockPool::new(
            tip,
            PoolParameters::from(parameters),
            collaborators.backup,
        );
        Self {
            merger,
            pool: Mutex::new(pool),
            requests: Mutex::new(BlockRequestTracker::new(
                parameters.request_wait,
                parameters.max_request_retries,
            )),
            verifier: collaborators.verifier,
            chain: collaborators.chain,
            ledger: collaborators.ledger,
            mempool: collaborators.mempool,
            outbound,
            metrics,
        }
    }

    pub fn handle_message(&self, message: &InboundMessage) {
        match message.kind {
            MessageType::Block => self.handle_block(message),
            MessageType::ReqBlock => self.handle_block_request(message),
            MessageType::ReqStatus => self.handle_status_request(message),
            MessageType::ReqCheck => self.handle_check_request(message),
            kind => tracing::debug!("Ignoring {kind:?} from merger {}", message.sender),
        }
    }

    /// Finalizes what the pool allows, then re-sends requests whose wait elapsed.
    pub fn periodic_task(&self) -> Result<(), ProcessorError> {
        self.resolve_blocks_if();
        let due = {
            let mut requests = self.requests.lock();
            let due = requests.due(timestamp_utc());
            self.metrics
                .pending_block_requests
                .set(requests.len() as i64);
            due?
        };
        for record in &due {
            tracing::debug!(
                "Re-requesting block at height {} (attempt {})",
                record.height,
                record.retries
            );
            self.send_request(record, "retry");
        }
        Ok(())
    }

    /// Finalizes every block the pool resolved and requests the next missing block if any.
    /// Returns the blocks written to the chain store.
    pub fn resolve_blocks_if(&self) -> Vec<Block> {
        let (resolved, lowest, finalized) = {
            let mut pool = self.pool.lock();
            let resolved = pool.get_resolved_blocks();
            let lowest = pool.get_unresolved_lowest_link();
            self.metrics
                .report_pool(pool.bin_count(), pool.len(), pool.last_link().height);
            (resolved, lowest, pool.last_link().height)
        };

        let mut saved = Vec::with_capacity(resolved.resolved.len());
        for block in resolved.resolved {
            if !self.verifier.is_valid_late(&block) {
                tracing::error!("Block {block:?} dropped (invalid at late stage validation)");
                self.metrics
                    .blocks_dropped_total
                    .with_label_values(&["late"])
                    .inc();
                continue;
            }
            if let Err(e) = self.chain.save_block(&block) {
                tracing::error!("Failed to save block {block:?}: {e}");
                self.metrics.backup_errors_total.inc();
                continue;
            }
            tracing::info!(
                "Block saved (height={}, #tx={}, #ssig={})",
                block.height(),
                block.transactions().len(),
                block.signature_count()
            );
            self.metrics.blocks_resolved_total.inc();
            saved.push(block);
        }
        for id in &resolved.dropped {
            self.ledger.invalidate(id);
        }
        self.metrics
            .forks_dropped_total
            .inc_by(resolved.dropped.len() as u64);

        {
            let mut requests = self.requests.lock();
            requests.prune(finalized);
            requests.retain_only(&lowest);
        }
        self.request_missing(lowest);
        saved
    }

    pub fn most_possible_link(&self) -> ChainLink {
        self.pool.lock().get_most_possible_link()
    }

    pub fn most_possible_block_layer(&self) -> Vec<BlockId> {
        self.pool.lock().get_most_possible_block_layer()
    }

    pub fn block_layer_of(&self, id: &BlockId) -> Option<Vec<BlockId>> {
        self.pool.lock().block_layer_of(id)
    }

    pub fn has_unresolved_blocks(&self) -> bool {
        self.pool.lock().has_unresolved_blocks()
    }

    pub fn last_link(&self) -> ChainLink {
        self.pool.lock().last_link().clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Rebuilds the pool from the backup store and projects what became linked.
    pub fn restore_pool(&self) -> usize {
        let restored = self.pool.lock().restore_pool();
        for linked in &restored.newly_linked {
            self.project(linked);
        }
        restored.restored
    }

    fn handle_block(&self, message: &InboundMessage) {
        self.metrics.blocks_received_total.inc();
        let block = match message
            .decode::<BlockMessage>()
            .and_then(BlockMessage::into_block)
        {
            Ok(block) => block,
            Err(e) => {
                tracing::warn!("Dropping malformed block from merger {}: {e}", message.sender);
                self.drop_block("malformed");
                return;
            }
        };
        if !self.verifier.is_valid_early(&block) {
            tracing::warn!("Dropping invalid block {block:?} from merger {}", message.sender);
            self.drop_block("invalid");
            return;
        }

        let result = self.pool.lock().push(block.clone(), false);
        if let Some(rejection) = result.rejection {
            self.drop_block(rejection.label());
            return;
        }
        if result.duplicate {
            tracing::trace!("Duplicate block {block:?}");
            return;
        }
        tracing::debug!(
            "Pushed {block:?} from merger {} (linked={})",
            message.sender,
            result.linked
        );

        if result.linked {
            for linked in &result.newly_linked {
                self.project(linked);
            }
            {
                let mut requests = self.requests.lock();
                for linked in &result.newly_linked {
                    let block = &linked.block;
                    requests.satisfy(block.height(), &block.prev_hash(), &block.hash());
                }
            }
            let info = BlockHeightMessage::new(self.merger, now_secs(), &block);
            match OutboundMessage::broadcast(MessageType::BlockHeight, &info) {
                Ok(message) => self.send(message),
                Err(e) => tracing::error!("Failed to encode chain info: {e}"),
            }
        } else {
            self.requests.lock().note_unlinked_sender(message.sender);
        }

        self.resolve_blocks_if();
    }

    fn handle_block_request(&self, message: &InboundMessage) {
        let request: ReqBlockMessage = match message.decode() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed block request from merger {}: {e}", message.sender);
                return;
            }
        };
        let from_pool = self
            .pool
            .lock()
            .get_block(request.height, request.prev_hash, request.hash);
        let block = match from_pool {
            Some(block) => Some(block),
            None => match self.chain.read_block(request.height) {
                Ok(block) => block.filter(|block| {
                    request.height == 0
                        || (request.prev_hash.map_or(true, |p| block.prev_hash() == p)
                            && request.hash.map_or(true, |h| block.hash() == h))
                }),
                Err(e) => {
                    tracing::error!("Failed to read block {}: {e}", request.height);
                    None
                }
            },
        };

        let reply = match block {
            Some(block) => OutboundMessage::to(
                MessageType::Block,
                message.sender,
                &BlockMessage::new(self.merger, &block),
            ),
            None => {
                tracing::debug!(
                    "No block at height {} for merger {}",
                    request.height,
                    message.sender
                );
                self.error_reply(
                    message.sender,
                    ERROR_NO_BLOCK,
                    format!("no block at height {}", request.height),
                )
            }
        };
        match reply {
            Ok(reply) => self.send(reply),
            Err(e) => tracing::error!("Failed to encode block reply: {e}"),
        }
    }

    fn handle_status_request(&self, message: &InboundMessage) {
        if let Err(e) = message.decode::<ReqStatusMessage>() {
            tracing::warn!("Malformed status request from merger {}: {e}", message.sender);
            return;
        }
        let tip = self.most_possible_link();
        let status = ResStatusMessage::new(self.merger, now_secs(), &tip);
        match OutboundMessage::to(MessageType::ResStatus, message.sender, &status) {
            Ok(reply) => self.send(reply),
            Err(e) => tracing::error!("Failed to encode status reply: {e}"),
        }
    }

    fn handle_check_request(&self, message: &InboundMessage) {
        let request: ReqCheckMessage = match message.decode() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed check request from merger {}: {e}", message.sender);
                return;
            }
        };
        let reply = match self.chain.transaction_proof(&request.txid) {
            Ok(Some(proof)) => OutboundMessage::to(
                MessageType::ResCheck,
                message.sender,
                &ResCheckMessage {
                    merger: self.merger,
                    time: now_secs(),
                    block_id: proof.block_id,
                    proof: proof.proof,
                },
            ),
            Ok(None) => self.error_reply(
                message.sender,
                ERROR_UNKNOWN,
                format!("transaction {} is not finalized", request.txid),
            ),
            Err(e) => {
                tracing::error!("Failed to look up transaction {}: {e}", request.txid);
                self.error_reply(message.sender, ERROR_UNKNOWN, "storage failure".to_string())
            }
        };
        match reply {
            Ok(reply) => self.send(reply),
            Err(e) => tracing::error!("Failed to encode check reply: {e}"),
        }
    }

    fn project(&self, linked: &LinkedBlock) {
        let block = &linked.block;
        self.ledger
            .project(block.transactions(), &block.id(), &linked.block_layer);
        self.mempool.remove_transactions(block.tx_ids());
    }

    fn request_missing(&self, lowest: NextLink) {
        if !lowest.is_missing() {
            return;
        }
        let record = self.requests.lock().enqueue(lowest, timestamp_utc());
        if let Some(record) = record {
            tracing::debug!("Requesting missing block at height {}", record.height);
            self.send_request(&record, "new");
        }
    }

    fn send_request(&self, record: &BlockRequestRecord, kind: &str) {
        let request = ReqBlockMessage {
            merger: self.merger,
            time: now_secs(),
            height: record.height,
            prev_hash: record.prev_hash,
            hash: record.hash,
        };
        let receivers = record.target.into_iter().collect();
        match OutboundMessage::to_receivers(MessageType::ReqBlock, receivers, &request) {
            Ok(message) => {
                self.metrics
                    .block_requests_sent_total
                    .with_label_values(&[kind])
                    .inc();
                self.send(message);
            }
            Err(e) => tracing::error!("Failed to encode block request: {e}"),
        }
    }

    fn error_reply(
        &self,
        receiver: MergerIndex,
        kind: u8,
        info: String,
    ) -> Result<OutboundMessage, crate::network::MessageError> {
        let error = ErrorMessage {
            sender: self.merger,
            time: now_secs(),
            kind,
            info,
        };
        OutboundMessage::to(MessageType::Error, receiver, &error)
    }

    fn drop_block(&self, reason: &str) {
        self.metrics
            .blocks_dropped_total
            .with_label_values(&[reason])
            .inc();
    }

    fn send(&self, message: OutboundMessage) {
        let kind = message.kind;
        if self.outbound.send(message).is_err() {
            tracing::debug!("Network is shut down, dropping {kind:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::{
        block_verifier::{AcceptAllVerifier, SignatureVerifier},
        crypto::verify_merkle_proof,
        test_util::TestChain,
        types::Transaction,
    };

    struct Fixture {
        processor: BlockProcessor,
        outbound: mpsc::UnboundedReceiver<OutboundMessage>,
        store: Arc<MemoryStore>,
        ledger: Arc<LayeredLedger>,
        mempool: Arc<PendingTransactions>,
        metrics: Arc<Metrics>,
    }

    impl Fixture {
        fn new(chain: &TestChain, tip: &str) -> Self {
            let verifier = Arc::new(SignatureVerifier::new(chain.committee()));
            Self::with(chain.link(tip), verifier, NodeParameters::new_for_tests())
        }

        fn with(
            tip: ChainLink,
            verifier: Arc<dyn BlockVerifier>,
            parameters: NodeParameters,
        ) -> Self {
            Self::with_store(tip, verifier, parameters, Arc::new(MemoryStore::new()))
        }

        fn with_store(
            tip: ChainLink,
            verifier: Arc<dyn BlockVerifier>,
            parameters: NodeParameters,
            store: Arc<MemoryStore>,
        ) -> Self {
            let ledger = Arc::new(LayeredLedger::new());
            let mempool = Arc::new(PendingTransactions::new());
            let metrics = Metrics::new_for_test();
            let (sender, outbound) = mpsc::unbounded_channel();
            let collaborators = Collaborators {
                verifier,
                chain: store.clone(),
                backup: store.clone(),
                ledger: ledger.clone(),
                mempool: mempool.clone(),
            };
            let processor =
                BlockProcessor::new(0, &parameters, tip, collaborators, sender, metrics.clone());
            Self {
                processor,
                outbound,
                store,
                ledger,
                mempool,
                metrics,
            }
        }

        fn deliver(&self, sender: MergerIndex, block: &Block) {
            let message =
                InboundMessage::new(MessageType::Block, sender, &BlockMessage::new(sender, block))
                    .unwrap();
            self.processor.handle_message(&message);
        }

        fn drain(&mut self) -> Vec<OutboundMessage> {
            let mut messages = Vec::new();
            while let Ok(message) = self.outbound.try_recv() {
                messages.push(message);
            }
            messages
        }

        fn drain_kind(&mut self, kind: MessageType) -> Vec<OutboundMessage> {
            self.drain()
                .into_iter()
                .filter(|message| message.kind == kind)
                .collect()
        }
    }

    struct RejectLate;

    impl BlockVerifier for RejectLate {
        fn is_valid_early(&self, _block: &Block) -> bool {
            true
        }

        fn is_valid_late(&self, _block: &Block) -> bool {
            false
        }
    }

    #[test]
    fn heavier_fork_is_saved_and_loser_invalidated() {
        let chain = TestChain::new()
            .with_transactions(1)
            .with_tip("B10", 10)
            .draw("B11a<-B10:1; B11b<-B10:2; B12<-B11b:1");
        let mut fixture = Fixture::new(&chain, "B10");
        for (sender, name) in [(1, "B11a"), (2, "B11b"), (3, "B12")] {
            fixture.deliver(sender, chain.block(name));
        }

        assert_eq!(fixture.store.read_block(11).unwrap().as_ref(), Some(chain.block("B11b")));
        assert_eq!(fixture.processor.last_link(), chain.link("B11b"));
        assert_eq!(fixture.processor.most_possible_link(), chain.link("B12"));
        assert_eq!(fixture.ledger.projection(&chain.block("B11a").id()), None);
        assert!(fixture.ledger.projection(&chain.block("B12").id()).is_some());
        assert_eq!(fixture.metrics.blocks_resolved_total.get(), 1);
        assert_eq!(fixture.metrics.forks_dropped_total.get(), 1);

        let announced: Vec<BlockHeightMessage> = fixture
            .drain_kind(MessageType::BlockHeight)
            .iter()
            .map(|message| message.decode().unwrap())
            .collect();
        assert_eq!(announced.len(), 3);
        assert_eq!(announced[2].block_id, chain.block("B12").id());
        assert_eq!(announced[2].prev_block_id, chain.block("B11b").id());
    }

    #[test]
    fn gap_is_requested_from_the_sender_and_satisfied() {
        let chain = TestChain::new()
            .with_tip("B10", 10)
            .draw("B11<-B10:3; B12<-B11:1");
        let mut fixture = Fixture::new(&chain, "B10");
        fixture.deliver(2, chain.block("B12"));

        let requests = fixture.drain_kind(MessageType::ReqBlock);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].receivers, vec![2]);
        let request: ReqBlockMessage = requests[0].decode().unwrap();
        assert_eq!(request.height, 11);
        assert_eq!(request.prev_hash, Some(chain.block("B10").hash()));
        assert_eq!(fixture.processor.pending_requests(), 1);

        fixture.deliver(2, chain.block("B11"));
        assert_eq!(fixture.processor.pending_requests(), 0);
        assert_eq!(fixture.store.chain_height(), 11);
        assert_eq!(
            fixture.processor.most_possible_block_layer(),
            vec![chain.block("B12").id()]
        );
    }

    #[test]
    fn exhausted_retries_are_fatal() {
        let chain = TestChain::new()
            .with_tip("B10", 10)
            .draw("B11<-B10:1; B12<-B11:1");
        let parameters = NodeParameters {
            request_wait: Duration::ZERO,
            max_request_retries: 1,
            ..NodeParameters::new_for_tests()
        };
        let mut fixture = Fixture::with(
            chain.link("B10"),
            Arc::new(AcceptAllVerifier),
            parameters,
        );
        fixture.deliver(1, chain.block("B12"));
        assert_eq!(fixture.drain_kind(MessageType::ReqBlock).len(), 1);

        fixture.processor.periodic_task().unwrap();
        let retries = fixture.drain_kind(MessageType::ReqBlock);
        assert_eq!(retries.len(), 1);
        assert!(retries[0].is_broadcast());

        assert!(matches!(
            fixture.processor.periodic_task(),
            Err(ProcessorError::UnresolvableGap { height: 11, .. })
        ));
    }

    #[test]
    fn gap_on_abandoned_fork_is_forgotten() {
        let chain = TestChain::new().with_tip("B10", 10).draw(
            "B11a<-B10:0; B12a<-B11a:0; B13a<-B12a:0; \
             B11b<-B10:0; B12b<-B11b:0; B13b<-B12b:0; B14b<-B13b:0",
        );
        let parameters = NodeParameters {
            request_wait: Duration::ZERO,
            max_request_retries: 1,
            ..NodeParameters::new_for_tests()
        };
        let mut fixture = Fixture::with(
            chain.link("B10"),
            Arc::new(AcceptAllVerifier),
            parameters,
        );
        fixture.deliver(1, chain.block("B11a"));
        fixture.deliver(1, chain.block("B13a"));
        assert_eq!(fixture.drain_kind(MessageType::ReqBlock).len(), 1);
        assert_eq!(fixture.processor.pending_requests(), 1);

        for name in ["B11b", "B12b", "B13b", "B14b"] {
            fixture.deliver(2, chain.block(name));
        }
        assert_eq!(fixture.processor.most_possible_link(), chain.link("B14b"));
        assert_eq!(fixture.processor.pending_requests(), 0);
        fixture.drain();

        fixture.processor.periodic_task().unwrap();
        fixture.processor.periodic_task().unwrap();
        assert!(fixture.drain_kind(MessageType::ReqBlock).is_empty());
    }

    #[test]
    fn refused_blocks_are_counted_by_reason() {
        let chain = TestChain::new()
            .with_tip("B10", 10)
            .with_tip("X10", 10)
            .draw("B11<-B10:1; B12<-B11:1; B13<-B12:1; B11x<-X10:1");
        let parameters = NodeParameters {
            max_pool_bins: 2,
            ..NodeParameters::new_for_tests()
        };
        let fixture = Fixture::with(
            chain.link("B10"),
            Arc::new(AcceptAllVerifier),
            parameters,
        );
        for name in ["B10", "B11x", "B13"] {
            fixture.deliver(1, chain.block(name));
        }

        let dropped = &fixture.metrics.blocks_dropped_total;
        assert_eq!(dropped.with_label_values(&["stale"]).get(), 1);
        assert_eq!(dropped.with_label_values(&["unlinkable"]).get(), 1);
        assert_eq!(dropped.with_label_values(&["too_far_ahead"]).get(), 1);
        assert!(!fixture.processor.has_unresolved_blocks());
    }

    #[test]
    fn block_requests_are_served_from_pool_then_chain() {
        let chain = TestChain::new().draw("B1<-G:3; B2<-B1:1; B3<-B2:1");
        let mut fixture = Fixture::new(&chain, "G");
        for (sender, name) in [(1, "B1"), (1, "B2"), (1, "B3")] {
            fixture.deliver(sender, chain.block(name));
        }
        assert_eq!(fixture.store.chain_height(), 1);
        fixture.drain();

        for (height, expected) in [(1, "B1"), (3, "B3"), (0, "B3")] {
            let request = ReqBlockMessage {
                merger: 3,
                time: 0,
                height,
                prev_hash: None,
                hash: None,
            };
            fixture.processor.handle_message(
                &InboundMessage::new(MessageType::ReqBlock, 3, &request).unwrap(),
            );
            let replies = fixture.drain();
            assert_eq!(replies.len(), 1);
            assert_eq!(replies[0].kind, MessageType::Block);
            assert_eq!(replies[0].receivers, vec![3]);
            let body: BlockMessage = replies[0].decode().unwrap();
            assert_eq!(&body.into_block().unwrap(), chain.block(expected));
        }

        let request = ReqBlockMessage {
            merger: 3,
            time: 0,
            height: 9,
            prev_hash: None,
            hash: None,
        };
        fixture
            .processor
            .handle_message(&InboundMessage::new(MessageType::ReqBlock, 3, &request).unwrap());
        let replies = fixture.drain();
        assert_eq!(replies[0].kind, MessageType::Error);
        let error: ErrorMessage = replies[0].decode().unwrap();
        assert_eq!(error.kind, ERROR_NO_BLOCK);
    }

    #[test]
    fn status_and_check_requests() {
        let chain = TestChain::new()
            .with_transactions(3)
            .draw("B1<-G:3; B2<-B1:1");
        let mut fixture = Fixture::new(&chain, "G");
        fixture.deliver(1, chain.block("B1"));
        fixture.deliver(1, chain.block("B2"));
        fixture.drain();

        let status = ReqStatusMessage { merger: 2, time: 0 };
        fixture
            .processor
            .handle_message(&InboundMessage::new(MessageType::ReqStatus, 2, &status).unwrap());
        let reply: ResStatusMessage = fixture.drain()[0].decode().unwrap();
        assert_eq!(reply.height, 2);
        assert_eq!(reply.hash, chain.block("B2").hash());

        let txid = chain.block("B1").tx_ids()[1];
        let check = ReqCheckMessage {
            sender: 2,
            time: 0,
            requester: "client".to_string(),
            txid,
        };
        fixture
            .processor
            .handle_message(&InboundMessage::new(MessageType::ReqCheck, 2, &check).unwrap());
        let replies = fixture.drain();
        assert_eq!(replies[0].kind, MessageType::ResCheck);
        let proof: ResCheckMessage = replies[0].decode().unwrap();
        assert_eq!(proof.block_id, chain.block("B1").id());
        assert!(verify_merkle_proof(
            &txid,
            &proof.proof,
            &chain.block("B1").header().tx_root
        ));

        // Only linked, not finalized yet.
        let pending = ReqCheckMessage {
            txid: chain.block("B2").tx_ids()[0],
            ..check
        };
        fixture
            .processor
            .handle_message(&InboundMessage::new(MessageType::ReqCheck, 2, &pending).unwrap());
        assert_eq!(fixture.drain()[0].kind, MessageType::Error);
    }

    #[test]
    #[traced_test]
    fn malformed_and_invalid_blocks_are_dropped() {
        let chain = TestChain::new().draw("B1<-G:1");
        let fixture = Fixture::new(&chain, "G");
        fixture.processor.handle_message(&InboundMessage {
            kind: MessageType::Block,
            sender: 1,
            body: "not json".to_string(),
        });
        assert!(logs_contain("Dropping malformed block from merger 1"));

        let mut block = BlockMessage::new(1, chain.block("B1"));
        block.transactions.push(Transaction::new(1, "forger", "test", vec![]));
        fixture
            .processor
            .handle_message(&InboundMessage::new(MessageType::Block, 1, &block).unwrap());

        let dropped = &fixture.metrics.blocks_dropped_total;
        assert_eq!(dropped.with_label_values(&["malformed"]).get(), 1);
        assert_eq!(dropped.with_label_values(&["invalid"]).get(), 1);
        assert!(!fixture.processor.has_unresolved_blocks());
    }

    #[test]
    fn late_validation_failure_skips_saving() {
        let chain = TestChain::new().draw("B1<-G:3; B2<-B1:1");
        let fixture = Fixture::with(
            ChainLink::genesis(),
            Arc::new(RejectLate),
            NodeParameters::new_for_tests(),
        );
        fixture.deliver(1, chain.block("B1"));
        fixture.deliver(1, chain.block("B2"));
        assert_eq!(fixture.store.chain_height(), 0);
        assert_eq!(fixture.processor.last_link(), chain.link("B1"));
        assert_eq!(
            fixture
                .metrics
                .blocks_dropped_total
                .with_label_values(&["late"])
                .get(),
            1
        );
    }

    #[test]
    fn linked_transactions_leave_the_mempool() {
        let chain = TestChain::new().with_transactions(2).draw("B1<-G:1");
        let fixture = Fixture::new(&chain, "G");
        for tx in chain.block("B1").transactions() {
            fixture.mempool.submit(tx.clone());
        }
        fixture.deliver(1, chain.block("B1"));
        assert!(fixture.mempool.is_empty());
        assert_eq!(fixture.ledger.projected_blocks(), vec![chain.block("B1").id()]);
    }

    #[test]
    fn restored_pool_is_projected() {
        let chain = TestChain::new().draw("B1<-G:0; B2<-B1:1; B2b<-B1:1");
        let store = Arc::new(MemoryStore::new());
        let verifier: Arc<dyn BlockVerifier> = Arc::new(SignatureVerifier::new(chain.committee()));
        let (link, layer) = {
            let fixture = Fixture::with_store(
                ChainLink::genesis(),
                verifier.clone(),
                NodeParameters::new_for_tests(),
                store.clone(),
            );
            for name in ["B2", "B1", "B2b"] {
                fixture.deliver(1, chain.block(name));
            }
            (
                fixture.processor.most_possible_link(),
                fixture.processor.most_possible_block_layer(),
            )
        };

        let fixture = Fixture::with_store(
            ChainLink::genesis(),
            verifier,
            NodeParameters::new_for_tests(),
            store,
        );
        assert_eq!(fixture.processor.restore_pool(), 3);
        assert_eq!(fixture.processor.most_possible_link(), link);
        assert_eq!(fixture.processor.most_possible_block_layer(), layer);
        assert_eq!(fixture.ledger.projected_blocks().len(), 3);
    }
}
