// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{fs, sync::Arc};

use ::prometheus::Registry;
use eyre::{Context, Result};

use crate::{
    block_handler::{LayeredLedger, PendingTransactions},
    block_processor::{BlockProcessor, Collaborators, ProcessorError},
    block_store::ChainStore,
    block_verifier::{BlockVerifier, SignatureVerifier},
    committee::Committee,
    config::{NodeParameters, NodePrivateConfig},
    metrics::Metrics,
    net_sync::NetworkSyncer,
    network::NetworkEndpoint,
    prometheus,
    rocks_store::RocksStore,
    runtime::{JoinError, JoinHandle},
    synchronizer::BlockSynchronizer,
    types::{ChainLink, MergerIndex},
};

pub struct Validator {
    network_syncer: NetworkSyncer,
    metrics_handle: JoinHandle<Result<(), std::io::Error>>,
    metrics: Arc<Metrics>,
}

impl Validator {
    /// Opens the merger's storage, optionally catches up with its peers, restores the unresolved
    /// pool from the backup and starts processing messages from `endpoint`.
    pub async fn start(
        merger: MergerIndex,
        committee: Arc<Committee>,
        parameters: NodeParameters,
        private_config: NodePrivateConfig,
        endpoint: NetworkEndpoint,
        bootstrap: bool,
    ) -> Result<Self> {
        // Boot the prometheus server.
        let registry = Registry::new();
        let metrics = Metrics::new(&registry);
        let metrics_address = parameters.metrics_address(merger);
        let metrics_handle = prometheus::start_prometheus_server(metrics_address, &registry);

        fs::create_dir_all(&private_config.storage_path)
            .wrap_err("Failed to create the storage directory")?;
        let store = Arc::new(
            RocksStore::open(private_config.rocksdb()).wrap_err("Failed to open the block store")?,
        );
        let verifier: Arc<dyn BlockVerifier> = Arc::new(SignatureVerifier::new(committee.clone()));

        let NetworkEndpoint {
            mut inbound,
            outbound,
        } = endpoint;

        if bootstrap {
            let synchronizer = BlockSynchronizer::new(
                merger,
                committee.peers(merger),
                &parameters,
                verifier.clone(),
                store.clone(),
                outbound.clone(),
                metrics.clone(),
            )
            .wrap_err("Failed to read the chain tip")?;
            match synchronizer.run(&mut inbound).await {
                Ok(outcome) => tracing::info!(
                    "Merger {merger} synchronized {} blocks up to height {}",
                    outcome.applied,
                    outcome.tip.height
                ),
                Err(e) => tracing::warn!(
                    "Merger {merger} continues from its stored chain, synchronization failed: {e}"
                ),
            }
        }

        let tip = store
            .latest_link()
            .wrap_err("Failed to read the chain tip")?
            .unwrap_or_else(ChainLink::genesis);
        let collaborators = Collaborators {
            verifier,
            chain: store.clone(),
            backup: store,
            ledger: Arc::new(LayeredLedger::new()),
            mempool: Arc::new(PendingTransactions::new()),
        };
        let processor = Arc::new(BlockProcessor::new(
            merger,
            &parameters,
            tip,
            collaborators,
            outbound,
            metrics.clone(),
        ));
        let restored = processor.restore_pool();
        tracing::info!(
            "Merger {merger} restored {restored} unresolved blocks on top of height {}",
            processor.most_possible_link().height
        );

        let network_syncer = NetworkSyncer::start(
            inbound,
            processor,
            parameters.processor_task_interval,
            parameters.shutdown_grace_period,
        );

        tracing::info!("Merger {merger} exposing metrics on {metrics_address}");

        Ok(Self {
            network_syncer,
            metrics_handle,
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn processor(&self) -> &Arc<BlockProcessor> {
        self.network_syncer.processor()
    }

    pub fn is_finished(&self) -> bool {
        self.network_syncer.is_finished()
    }

    /// Resolves when the merger stops on a fatal error.
    pub async fn await_completion(self) -> Result<Result<(), ProcessorError>, JoinError> {
        let result = self.network_syncer.await_completion().await;
        self.metrics_handle.abort();
        result
    }

    pub async fn stop(self) -> Result<(), ProcessorError> {
        let result = self.network_syncer.shutdown().await;
        self.metrics_handle.abort();
        result
    }
}
