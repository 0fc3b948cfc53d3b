// Copyright (c) Mysten Labs, Inc.
// Modifications Copyright (c) 2025 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::{sync::Arc, time::Duration};

use futures::future::join;
use tokio::{
    select,
    sync::{mpsc, Notify},
};

use crate::{
    block_processor::{BlockProcessor, ProcessorError},
    network::InboundMessage,
    runtime::{sleep, Handle, JoinError, JoinHandle},
};

/// Async driver of a [`BlockProcessor`]: one task feeds inbound messages, one runs the periodic
/// task. An unresolvable gap stops both.
pub struct NetworkSyncer {
    inner: Arc<NetworkSyncerInner>,
    inbound_task: JoinHandle<()>,
    periodic_task: JoinHandle<Result<(), ProcessorError>>,
    shutdown_grace_period: Duration,
    stop: mpsc::Receiver<()>,
}

pub struct NetworkSyncerInner {
    pub processor: Arc<BlockProcessor>,
    stop: mpsc::Sender<()>,
    fatal: Notify,
}

impl NetworkSyncer {
    pub fn start(
        inbound: mpsc::Receiver<InboundMessage>,
        processor: Arc<BlockProcessor>,
        processor_task_interval: Duration,
        shutdown_grace_period: Duration,
    ) -> Self {
        let handle = Handle::current();
        let (stop_sender, stop_receiver) = mpsc::channel(1);
        // Occupy the only permit so that every other send() waits until the receiver is dropped.
        stop_sender.try_send(()).ok();
        let inner = Arc::new(NetworkSyncerInner {
            processor,
            stop: stop_sender,
            fatal: Notify::new(),
        });
        let inbound_task = handle.spawn(Self::inbound_task(inner.clone(), inbound));
        let periodic_task =
            handle.spawn(Self::periodic_task(inner.clone(), processor_task_interval));
        Self {
            inner,
            inbound_task,
            periodic_task,
            shutdown_grace_period,
            stop: stop_receiver,
        }
    }

    pub fn processor(&self) -> &Arc<BlockProcessor> {
        &self.inner.processor
    }

    /// True once the periodic task ended, which only happens on a fatal error or after shutdown.
    pub fn is_finished(&self) -> bool {
        self.periodic_task.is_finished()
    }

    /// Stops both tasks, giving them the grace period to finish what they are doing.
    pub async fn shutdown(self) -> Result<(), ProcessorError> {
        drop(self.stop);
        let inbound_abort = self.inbound_task.abort_handle();
        let periodic_abort = self.periodic_task.abort_handle();
        let tasks = join(self.inbound_task, self.periodic_task);
        match tokio::time::timeout(self.shutdown_grace_period, tasks).await {
            Ok((_, Ok(result))) => result,
            Ok((_, Err(e))) => {
                tracing::error!("Periodic task failed: {e}");
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Merger tasks did not stop in time, aborting");
                inbound_abort.abort();
                periodic_abort.abort();
                Ok(())
            }
        }
    }

    /// Resolves once the periodic task ends, which only happens on a fatal error.
    pub async fn await_completion(self) -> Result<Result<(), ProcessorError>, JoinError> {
        let (_, result) = join(self.inbound_task, self.periodic_task).await;
        result
    }

    async fn inbound_task(
        inner: Arc<NetworkSyncerInner>,
        mut inbound: mpsc::Receiver<InboundMessage>,
    ) {
        while let Some(message) = inner.recv_or_stopped(&mut inbound).await {
            inner.processor.handle_message(&message);
        }
        tracing::debug!("Inbound message loop finished");
    }

    async fn periodic_task(
        inner: Arc<NetworkSyncerInner>,
        interval: Duration,
    ) -> Result<(), ProcessorError> {
        loop {
            select! {
                _sleep = sleep(interval) => {
                    if let Err(e) = inner.processor.periodic_task() {
                        tracing::error!("Stopping merger: {e}");
                        inner.fatal.notify_one();
                        return Err(e);
                    }
                }
                _stopped = inner.stopped() => {
                    return Ok(());
                }
            }
        }
    }
}

impl NetworkSyncerInner {
    // Returns None either if the channel is closed or the syncer receives a stop signal.
    async fn recv_or_stopped<T>(&self, channel: &mut mpsc::Receiver<T>) -> Option<T> {
        select! {
            stopped = self.stop.send(()) => {
                debug_assert!(stopped.is_err());
                None
            }
            _fatal = self.fatal.notified() => {
                None
            }
            data = channel.recv() => {
                data
            }
        }
    }

    async fn stopped(&self) {
        let stopped = self.stop.send(()).await;
        debug_assert!(stopped.is_err());
    }
}
