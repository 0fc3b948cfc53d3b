// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use tokio::{
    runtime::Handle,
    task::{JoinError, JoinHandle},
    time::{sleep, Instant},
};

/// Wall-clock time since the unix epoch.
pub fn timestamp_utc() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Wall-clock seconds, the resolution used by block headers and message bodies.
pub fn now_secs() -> u64 {
    timestamp_utc().as_secs()
}
