// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{collections::BTreeMap, time::Duration};

use crate::{
    block_processor::ProcessorError,
    types::{BlockHash, Height, MergerIndex, NextLink},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRequestRecord {
    pub height: Height,
    pub hash: Option<BlockHash>,
    pub prev_hash: Option<BlockHash>,
    /// Peer asked first; retries go to everybody.
    pub target: Option<MergerIndex>,
    /// Wall-clock time of the last send.
    pub request_time: Duration,
    pub retries: u32,
}

/// Outstanding block requests, one per missing height.
pub struct BlockRequestTracker {
    records: BTreeMap<Height, BlockRequestRecord>,
    request_wait: Duration,
    max_retries: u32,
    // Sender of the most recent block that could not be linked, likely ahead of us.
    target_hint: Option<MergerIndex>,
}

impl BlockRequestTracker {
    pub fn new(request_wait: Duration, max_retries: u32) -> Self {
        Self {
            records: BTreeMap::new(),
            request_wait,
            max_retries,
            target_hint: None,
        }
    }

    pub fn note_unlinked_sender(&mut self, sender: MergerIndex) {
        self.target_hint = Some(sender);
    }

    /// Records a request for `link`. Returns the record when it is new and must be sent now.
    pub fn enqueue(&mut self, link: NextLink, now: Duration) -> Option<BlockRequestRecord> {
        if let Some(record) = self.records.get_mut(&link.height) {
            record.prev_hash = Some(link.prev_hash);
            return None;
        }
        let record = BlockRequestRecord {
            height: link.height,
            hash: None,
            prev_hash: Some(link.prev_hash),
            target: self.target_hint,
            request_time: now,
            retries: 0,
        };
        self.records.insert(link.height, record.clone());
        Some(record)
    }

    /// Drops the request for `height` if the arrived block answers it.
    pub fn satisfy(&mut self, height: Height, prev_hash: &BlockHash, hash: &BlockHash) -> bool {
        let answered = self.records.get(&height).is_some_and(|record| {
            record.prev_hash.map_or(true, |p| p == *prev_hash)
                && record.hash.map_or(true, |h| h == *hash)
        });
        if answered {
            self.records.remove(&height);
        }
        answered
    }

    /// Forgets requests at or below the finalized height.
    pub fn prune(&mut self, finalized: Height) {
        self.records = self.records.split_off(&(finalized + 1));
    }

    /// Drops every request except the one for `lowest`, the gap of the best known branch.
    /// Gaps on abandoned forks are no longer worth asking for.
    pub fn retain_only(&mut self, lowest: &NextLink) {
        self.records.retain(|height, record| {
            lowest.is_missing()
                && *height == lowest.height
                && record.prev_hash == Some(lowest.prev_hash)
        });
    }

    /// Records whose wait elapsed, already marked as resent. Fails once a record used up its
    /// retries.
    pub fn due(&mut self, now: Duration) -> Result<Vec<BlockRequestRecord>, ProcessorError> {
        let mut due = Vec::new();
        for record in self.records.values_mut() {
            if now.saturating_sub(record.request_time) < self.request_wait {
                continue;
            }
            if record.retries >= self.max_retries {
                return Err(ProcessorError::UnresolvableGap {
                    height: record.height,
                    retries: record.retries,
                });
            }
            record.retries += 1;
            record.request_time = now;
            record.target = None;
            due.push(record.clone());
        }
        Ok(due)
    }

    pub fn get(&self, height: Height) -> Option<&BlockRequestRecord> {
        self.records.get(&height)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
