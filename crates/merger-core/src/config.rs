// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{
    fs, io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{crypto::Signer, types::MergerIndex};

pub trait ImportExport: Serialize + DeserializeOwned {
    fn load<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let content = fs::read_to_string(&path)?;
        let object =
            serde_yaml::from_str(&content).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(object)
    }

    fn print<P: AsRef<Path>>(&self, path: P) -> Result<(), io::Error> {
        let content =
            serde_yaml::to_string(self).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::write(&path, content)
    }
}

pub mod node_defaults {
    use std::time::Duration;

    /// Weight a bin-0 candidate (own signatures plus descendants) needs before it is finalized.
    pub fn default_block_confirm_level() -> u64 {
        3
    }

    pub fn default_processor_task_interval() -> Duration {
        Duration::from_millis(500)
    }

    pub fn default_request_wait() -> Duration {
        Duration::from_secs(3)
    }

    pub fn default_max_request_retries() -> u32 {
        5
    }

    pub fn default_block_interval() -> Duration {
        Duration::from_secs(10)
    }

    /// Heights above the finalized tip the unresolved pool may hold.
    pub fn default_max_pool_bins() -> u64 {
        1024
    }

    pub fn default_sync_control_interval() -> Duration {
        Duration::from_millis(1000)
    }

    pub fn default_max_sync_wait() -> Duration {
        Duration::from_secs(60)
    }

    pub fn default_shutdown_grace_period() -> Duration {
        Duration::from_secs(2)
    }

    pub fn default_metrics_port() -> u16 {
        1500
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NodeParameters {
    #[serde(default = "node_defaults::default_block_confirm_level")]
    pub block_confirm_level: u64,
    #[serde(default = "node_defaults::default_processor_task_interval")]
    pub processor_task_interval: Duration,
    #[serde(default = "node_defaults::default_request_wait")]
    pub request_wait: Duration,
    #[serde(default = "node_defaults::default_max_request_retries")]
    pub max_request_retries: u32,
    /// Expected spacing of blocks; blocks further ahead than elapsed time allows are refused.
    /// Zero disables the check.
    #[serde(default = "node_defaults::default_block_interval")]
    pub block_interval: Duration,
    #[serde(default = "node_defaults::default_max_pool_bins")]
    pub max_pool_bins: u64,
    #[serde(default = "node_defaults::default_sync_control_interval")]
    pub sync_control_interval: Duration,
    #[serde(default = "node_defaults::default_max_sync_wait")]
    pub max_sync_wait: Duration,
    #[serde(default = "node_defaults::default_shutdown_grace_period")]
    pub shutdown_grace_period: Duration,
    #[serde(default = "node_defaults::default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for NodeParameters {
    fn default() -> Self {
        Self {
            block_confirm_level: node_defaults::default_block_confirm_level(),
            processor_task_interval: node_defaults::default_processor_task_interval(),
            request_wait: node_defaults::default_request_wait(),
            max_request_retries: node_defaults::default_max_request_retries(),
            block_interval: node_defaults::default_block_interval(),
            max_pool_bins: node_defaults::default_max_pool_bins(),
            sync_control_interval: node_defaults::default_sync_control_interval(),
            max_sync_wait: node_defaults::default_max_sync_wait(),
            shutdown_grace_period: node_defaults::default_shutdown_grace_period(),
            metrics_port: node_defaults::default_metrics_port(),
        }
    }
}

impl NodeParameters {
    pub const DEFAULT_FILENAME: &'static str = "parameters.yaml";

    pub fn metrics_address(&self, merger: MergerIndex) -> SocketAddr {
        SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.metrics_port + merger as u16,
        )
    }

    /// Fast timers for tests and local runs.
    pub fn new_for_tests() -> Self {
        Self {
            processor_task_interval: Duration::from_millis(20),
            request_wait: Duration::from_millis(100),
            block_interval: Duration::ZERO,
            sync_control_interval: Duration::from_millis(20),
            max_sync_wait: Duration::from_secs(2),
            shutdown_grace_period: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

impl ImportExport for NodeParameters {}

#[derive(Serialize, Deserialize)]
pub struct NodePrivateConfig {
    pub merger: MergerIndex,
    pub keypair: Signer,
    pub storage_path: PathBuf,
}

impl NodePrivateConfig {
    pub fn new_for_benchmarks(dir: &Path, mergers: usize) -> Vec<Self> {
        Signer::new_for_test(mergers)
            .into_iter()
            .enumerate()
            .map(|(i, keypair)| {
                let merger = i as MergerIndex;
                Self {
                    merger,
                    keypair,
                    storage_path: dir.join(Self::default_storage_path(merger)),
                }
            })
            .collect()
    }

    pub fn default_filename(merger: MergerIndex) -> PathBuf {
        format!("private-config-{merger}.yaml").into()
    }

    pub fn default_storage_path(merger: MergerIndex) -> PathBuf {
        format!("storage-{merger}").into()
    }

    pub fn rocksdb(&self) -> PathBuf {
        self.storage_path.join("rocksdb")
    }
}

impl ImportExport for NodePrivateConfig {}
