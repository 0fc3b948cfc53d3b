// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

pub mod block_handler;
pub mod block_pool;
pub mod block_processor;
mod block_requests;
pub mod block_store;
pub mod block_verifier;
pub mod committee;
pub mod config;
pub mod crypto;
pub mod metrics;
pub mod net_sync;
pub mod network;
pub mod prometheus;
pub mod rocks_store;
pub mod runtime;
pub mod synchronizer;
#[cfg(test)]
mod test_util;
pub mod types;
pub mod validator;
