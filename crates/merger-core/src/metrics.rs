// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

use crate::types::Height;

pub const BLOCKS_RECEIVED_TOTAL: &str = "blocks_received_total";

#[derive(Clone)]
pub struct Metrics {
    pub blocks_received_total: IntCounter,
    pub blocks_dropped_total: IntCounterVec,
    pub blocks_resolved_total: IntCounter,
    pub forks_dropped_total: IntCounter,
    pub block_requests_sent_total: IntCounterVec,
    pub backup_errors_total: IntCounter,
    pub sync_blocks_applied_total: IntCounter,

    pub unresolved_pool_bins: IntGauge,
    pub unresolved_pool_blocks: IntGauge,
    pub pending_block_requests: IntGauge,
    pub finalized_height: IntGauge,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Self> {
        let metrics = Self {
            blocks_received_total: register_int_counter_with_registry!(
                BLOCKS_RECEIVED_TOTAL,
                "Total number of block messages received from peers",
                registry,
            )
            .unwrap(),
            blocks_dropped_total: register_int_counter_vec_with_registry!(
                "blocks_dropped_total",
                "Total number of received blocks dropped before entering the pool",
                &["reason"],
                registry,
            )
            .unwrap(),
            blocks_resolved_total: register_int_counter_with_registry!(
                "blocks_resolved_total",
                "Total number of blocks finalized by the unresolved pool",
                registry,
            )
            .unwrap(),
            forks_dropped_total: register_int_counter_with_registry!(
                "forks_dropped_total",
                "Total number of candidates superseded by a finalized sibling",
                registry,
            )
            .unwrap(),
            block_requests_sent_total: register_int_counter_vec_with_registry!(
                "block_requests_sent_total",
                "Total number of block requests sent, by kind",
                &["kind"],
                registry,
            )
            .unwrap(),
            backup_errors_total: register_int_counter_with_registry!(
                "backup_errors_total",
                "Total number of failed chain store writes",
                registry,
            )
            .unwrap(),
            sync_blocks_applied_total: register_int_counter_with_registry!(
                "sync_blocks_applied_total",
                "Total number of blocks applied by the bootstrap synchronizer",
                registry,
            )
            .unwrap(),
            unresolved_pool_bins: register_int_gauge_with_registry!(
                "unresolved_pool_bins",
                "Number of height bins in the unresolved pool",
                registry,
            )
            .unwrap(),
            unresolved_pool_blocks: register_int_gauge_with_registry!(
                "unresolved_pool_blocks",
                "Number of candidate blocks in the unresolved pool",
                registry,
            )
            .unwrap(),
            pending_block_requests: register_int_gauge_with_registry!(
                "pending_block_requests",
                "Number of outstanding block requests",
                registry,
            )
            .unwrap(),
            finalized_height: register_int_gauge_with_registry!(
                "finalized_height",
                "Height of the finalized chain tip",
                registry,
            )
            .unwrap(),
        };
        Arc::new(metrics)
    }

    pub fn new_for_test() -> Arc<Self> {
        Self::new(&Registry::new())
    }

    pub fn report_pool(&self, bins: usize, blocks: usize, finalized: Height) {
        self.unresolved_pool_bins.set(bins as i64);
        self.unresolved_pool_blocks.set(blocks as i64);
        self.finalized_height.set(finalized as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_are_exported_by_the_registry() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry);
        metrics.blocks_received_total.inc();
        metrics
            .blocks_dropped_total
            .with_label_values(&["invalid"])
            .inc();
        metrics.report_pool(2, 3, 10);

        let families = registry.gather();
        let names: Vec<_> = families.iter().map(|f| f.get_name().to_string()).collect();
        assert!(names.contains(&BLOCKS_RECEIVED_TOTAL.to_string()));
        assert!(names.contains(&"blocks_dropped_total".to_string()));
        assert_eq!(metrics.unresolved_pool_blocks.get(), 3);
        assert_eq!(metrics.finalized_height.get(), 10);
    }
}
