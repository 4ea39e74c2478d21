// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::{LogClient, NewClientFn};
use crate::config::{ClientConfig, RetryPolicy, TransportConfig};
use crate::constants::wait_check_frequency;
use crate::entry::{validate_labels, LabelSet, LogEntry};
use crate::errors::ClientError;
use crate::metrics::{DropReason, Metrics};
use crate::retry::handle_with_retry;
use crate::sorted::batch::{Batch, SealedBatch};

#[derive(Debug, Clone)]
pub struct SortedClientConfig {
    pub number_of_batch_ids: u64,
    pub batch_wait: Duration,
    pub batch_size_bytes: usize,
    pub batch_id_label: Option<String>,
    /// Sealed batches queued per slot before sealing waits for the flusher.
    pub slot_queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl From<&ClientConfig> for SortedClientConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            number_of_batch_ids: config.number_of_batch_ids,
            batch_wait: config.batch_wait(),
            batch_size_bytes: config.batch_size_bytes,
            batch_id_label: config.batch_id_label.clone(),
            slot_queue_capacity: config.slot_queue_capacity,
            retry: config.retry.clone(),
        }
    }
}

/// Where a batch-id slot stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    Idle,
    /// The current batch belongs to this slot and holds entries.
    Accumulating,
    /// Sealed batches wait for the slot's flusher.
    Sealed,
    /// The flusher is delivering a batch.
    Flushing,
}

struct EngineState {
    current: Batch,
    senders: Vec<mpsc::Sender<SealedBatch>>,
    queued: Vec<usize>,
    flushing: Vec<bool>,
    closed: bool,
}

/// Outcome of an attempt to seal the current batch without waiting.
enum Seal {
    /// Sealed, or nothing to seal.
    Done,
    /// The slot queue is at capacity. Room is awaited on this sender.
    SlotFull(mpsc::Sender<SealedBatch>, u64),
}

struct Engine {
    config: SortedClientConfig,
    metrics: Arc<Metrics>,
    state: Mutex<EngineState>,
}

impl Engine {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot_of(&self, batch_id: u64) -> usize {
        // number_of_batch_ids is checked to be non-zero at construction.
        usize::try_from(batch_id % self.config.number_of_batch_ids).unwrap_or_default()
    }

    /// Hands the current batch to its slot if the slot queue has room.
    ///
    /// Every send happens under the engine lock and only for the current
    /// batch, so a slot receives its batches in seal order.
    fn try_seal(&self, state: &mut EngineState) -> Seal {
        if state.current.is_empty() {
            return Seal::Done;
        }
        let id = state.current.id();
        let slot = self.slot_of(id);
        let Some(sender) = state.senders.get(slot).cloned() else {
            self.discard_current(state, "its slot is closed");
            return Seal::Done;
        };
        let reserved = sender.try_reserve();
        match reserved {
            Ok(permit) => self.seal_into(state, slot, permit),
            Err(TrySendError::Full(())) => return Seal::SlotFull(sender.clone(), id),
            Err(TrySendError::Closed(())) => self.discard_current(state, "its slot is closed"),
        }
        Seal::Done
    }

    /// Waits until the slot fed by `sender` has room, then seals batch `id`
    /// unless someone else sealed it meanwhile.
    async fn seal_when_room(&self, sender: mpsc::Sender<SealedBatch>, id: u64) {
        let reserved = sender.reserve().await;
        let mut state = self.lock();
        if state.current.is_empty() || state.current.id() != id {
            return;
        }
        match reserved {
            Ok(permit) => self.seal_into(&mut state, self.slot_of(id), permit),
            Err(_) => self.discard_current(&mut state, "its slot is closed"),
        }
    }

    fn seal_into(
        &self,
        state: &mut EngineState,
        slot: usize,
        permit: mpsc::Permit<'_, SealedBatch>,
    ) {
        let next = Batch::new(state.current.id().wrapping_add(1));
        let batch = std::mem::replace(&mut state.current, next).seal();
        debug!(
            "Sealed batch {} with {} entries into slot {slot}",
            batch.id(),
            batch.len()
        );
        state.queued[slot] += 1;
        permit.send(batch);
    }

    fn discard_current(&self, state: &mut EngineState, why: &str) {
        let count = state.current.len();
        if count == 0 {
            return;
        }
        warn!(
            "Dropping {count} entries of batch {}: {why}",
            state.current.id()
        );
        self.metrics.inc_dropped(DropReason::Shutdown, count as u64);
        state.current = Batch::new(state.current.id().wrapping_add(1));
    }

    /// Seals the current batch if it is due and its slot has room, drops it
    /// otherwise.
    fn seal_or_discard_current(&self, state: &mut EngineState) {
        if !state.current.is_due(self.config.batch_wait) {
            self.discard_current(state, "not due on stop");
            return;
        }
        if let Seal::SlotFull(..) = self.try_seal(state) {
            self.discard_current(state, "its slot is full on stop");
        }
    }

    fn close(&self, state: &mut EngineState) {
        state.closed = true;
        state.senders.clear();
    }

    fn begin_flush(&self, slot: usize) {
        let mut state = self.lock();
        state.queued[slot] = state.queued[slot].saturating_sub(1);
        state.flushing[slot] = true;
    }

    fn end_flush(&self, slot: usize) {
        self.lock().flushing[slot] = false;
    }

    fn phases(&self) -> Vec<SlotPhase> {
        let state = self.lock();
        let accumulating =
            (!state.closed && !state.current.is_empty()).then(|| self.slot_of(state.current.id()));

        (0..state.queued.len())
            .map(|slot| {
                if state.flushing[slot] {
                    SlotPhase::Flushing
                } else if state.queued[slot] > 0 {
                    SlotPhase::Sealed
                } else if accumulating == Some(slot) {
                    SlotPhase::Accumulating
                } else {
                    SlotPhase::Idle
                }
            })
            .collect()
    }

    /// Delivers `batch` entry by entry.
    ///
    /// A retryable failure is retried on the same entry. Once retries are
    /// spent the rest of the batch is dropped. A refused entry is skipped.
    async fn deliver(
        &self,
        batch: &SealedBatch,
        inner: &dyn LogClient,
        abort: &CancellationToken,
    ) {
        debug!("Flushing batch {} with {} entries", batch.id(), batch.len());

        let exhausted = || {
            if abort.is_cancelled() {
                DropReason::Shutdown
            } else {
                DropReason::RetriesExhausted
            }
        };

        for (delivered, entry) in batch.entries().iter().enumerate() {
            match handle_with_retry(inner, entry, &self.config.retry, abort).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    let remaining = batch.len() - delivered;
                    error!(
                        "Dropping {remaining} entries of batch {}: {e}",
                        batch.id()
                    );
                    self.metrics.inc_dropped(exhausted(), remaining as u64);
                    return;
                }
                Err(ClientError::PartialDelivery { failed, source }) => {
                    error!(
                        "Entry of batch {} missed {} tenants: {source}",
                        batch.id(),
                        failed.len()
                    );
                    self.metrics.inc_dropped(exhausted(), failed.len() as u64);
                }
                Err(e) => {
                    warn!("Entry of batch {} was refused: {e}", batch.id());
                    self.metrics.inc_dropped(DropReason::Rejected, 1);
                }
            }
        }
    }
}

/// Batching stage that reorders entries by timestamp before forwarding.
///
/// Entries accumulate in a single rolling batch. A batch is sealed when it is
/// older than `batch_wait` or would grow past `batch_size_bytes`, and is then
/// flushed by the task owning slot `batch_id % number_of_batch_ids`. Every
/// entry is stamped with its slot under `batch_id_label`, so consecutive
/// batches land in distinct streams and never interleave out of order.
///
/// Each slot queues at most `slot_queue_capacity` sealed batches. Past that,
/// the `handle` call that needs a seal waits for the slot's flusher.
pub struct SortedClient {
    engine: Arc<Engine>,
    inner: Arc<dyn LogClient>,
    quit: CancellationToken,
    abort: CancellationToken,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SortedClient {
    /// Builds the inner client through `new_client`, then starts one scheduler
    /// and one flusher per slot on the current tokio runtime.
    pub fn new(
        config: SortedClientConfig,
        transport_config: &TransportConfig,
        new_client: NewClientFn,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ClientError> {
        let slots = usize::try_from(config.number_of_batch_ids)
            .ok()
            .filter(|slots| *slots > 0)
            .ok_or_else(|| {
                ClientError::InvalidConfig(format!(
                    "invalid number_of_batch_ids {}",
                    config.number_of_batch_ids
                ))
            })?;
        if config.slot_queue_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "slot_queue_capacity must be greater than 0".to_string(),
            ));
        }

        let inner: Arc<dyn LogClient> = Arc::from(new_client(transport_config)?);

        let mut senders = Vec::with_capacity(slots);
        let mut receivers = Vec::with_capacity(slots);
        for _ in 0..slots {
            let (tx, rx) = mpsc::channel(config.slot_queue_capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        let engine = Arc::new(Engine {
            config,
            metrics,
            state: Mutex::new(EngineState {
                current: Batch::new(0),
                senders,
                queued: vec![0; slots],
                flushing: vec![false; slots],
                closed: false,
            }),
        });
        let quit = CancellationToken::new();
        let abort = CancellationToken::new();

        let mut tasks = Vec::with_capacity(slots + 1);
        tasks.push(tokio::spawn(run_scheduler(
            Arc::clone(&engine),
            quit.clone(),
        )));
        for (slot, batches) in receivers.into_iter().enumerate() {
            tasks.push(tokio::spawn(run_flusher(
                slot,
                batches,
                Arc::clone(&engine),
                Arc::clone(&inner),
                abort.clone(),
            )));
        }

        debug!("Sorted client started with {slots} batch id slots");

        Ok(Self {
            engine,
            inner,
            quit,
            abort,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(tasks),
        })
    }

    /// Phase of every slot, indexed by slot.
    #[must_use]
    pub fn slot_phases(&self) -> Vec<SlotPhase> {
        self.engine.phases()
    }

    fn take_tasks(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl LogClient for SortedClient {
    async fn handle(
        &self,
        mut labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError> {
        validate_labels(&labels)?;
        let config = &self.engine.config;

        loop {
            let (sender, id) = {
                let mut state = self.engine.lock();
                if state.closed {
                    return Err(ClientError::Stopped);
                }
                let seal = if state.current.would_exceed(line.len(), config.batch_size_bytes) {
                    self.engine.try_seal(&mut state)
                } else {
                    Seal::Done
                };
                match seal {
                    Seal::SlotFull(sender, id) => (sender, id),
                    Seal::Done => {
                        if let Some(label) = &config.batch_id_label {
                            let slot = self.engine.slot_of(state.current.id());
                            labels.insert(label.clone(), slot.to_string());
                        }
                        state.current.add(LogEntry::new(labels, timestamp, line));
                        return Ok(());
                    }
                }
            };
            debug!("Slot of batch {id} is full, waiting for its flusher");
            self.engine.seal_when_room(sender, id).await;
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.quit.cancel();
        self.abort.cancel();
        {
            let mut state = self.engine.lock();
            state.closed = true;
            self.engine.seal_or_discard_current(&mut state);
            self.engine.close(&mut state);
        }

        let tasks = self.take_tasks();
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    join_all(tasks).await;
                    inner.stop();
                });
            }
            Err(_) => {
                for task in tasks {
                    task.abort();
                }
                inner.stop();
            }
        }
    }

    async fn stop_wait(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.quit.cancel();
        let seal = {
            let mut state = self.engine.lock();
            state.closed = true;
            self.engine.try_seal(&mut state)
        };
        if let Seal::SlotFull(sender, id) = seal {
            self.engine.seal_when_room(sender, id).await;
        }
        {
            let mut state = self.engine.lock();
            self.engine.close(&mut state);
        }

        for result in join_all(self.take_tasks()).await {
            if let Err(e) = result {
                error!("Sorted client task failed: {e}");
            }
        }
        self.inner.stop_wait().await;
        debug!("Sorted client stopped");
    }
}

impl Drop for SortedClient {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_scheduler(engine: Arc<Engine>, quit: CancellationToken) {
    let mut ticker = interval(wait_check_frequency(engine.config.batch_wait));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = quit.cancelled() => return,
            _ = ticker.tick() => {
                let seal = {
                    let mut state = engine.lock();
                    if !state.closed && state.current.is_due(engine.config.batch_wait) {
                        engine.try_seal(&mut state)
                    } else {
                        Seal::Done
                    }
                };
                if let Seal::SlotFull(sender, id) = seal {
                    tokio::select! {
                        () = quit.cancelled() => return,
                        () = engine.seal_when_room(sender, id) => {}
                    }
                }
            }
        }
    }
}

async fn run_flusher(
    slot: usize,
    mut batches: mpsc::Receiver<SealedBatch>,
    engine: Arc<Engine>,
    inner: Arc<dyn LogClient>,
    abort: CancellationToken,
) {
    while let Some(batch) = batches.recv().await {
        engine.begin_flush(slot);
        engine.deliver(&batch, inner.as_ref(), &abort).await;
        engine.end_flush(slot);
    }
    debug!("Flusher of slot {slot} exiting");
}
