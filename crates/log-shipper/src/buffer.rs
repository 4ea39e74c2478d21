// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded in-memory queue in front of a client.
//!
//! `handle` only enqueues. A single drain task hands queued entries to the
//! wrapped client in arrival order, retrying retryable failures.

use std::collections::VecDeque;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::{LogClient, NewClientFn};
use crate::config::{BufferConfig, OverflowPolicy, RetryPolicy, TransportConfig};
use crate::entry::{validate_labels, LabelSet, LogEntry};
use crate::errors::ClientError;
use crate::metrics::{DropReason, Metrics};
use crate::retry::handle_with_retry;

struct Queue {
    entries: VecDeque<LogEntry>,
    closed: bool,
}

struct BufferState {
    capacity: usize,
    policy: OverflowPolicy,
    metrics: Arc<Metrics>,
    queue: Mutex<Queue>,
    not_empty: Notify,
    not_full: Notify,
}

impl BufferState {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Closes the queue and wakes everyone waiting on it.
    fn close(&self) -> MutexGuard<'_, Queue> {
        let mut queue = self.lock();
        queue.closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        queue
    }
}

pub struct OverflowBuffer {
    state: Arc<BufferState>,
    inner: Arc<dyn LogClient>,
    abort: CancellationToken,
    stopped: AtomicBool,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl OverflowBuffer {
    /// Builds the wrapped client through `new_client` and starts the drain
    /// task on the current tokio runtime.
    pub fn new(
        config: BufferConfig,
        retry: RetryPolicy,
        transport_config: &TransportConfig,
        new_client: NewClientFn,
        metrics: Arc<Metrics>,
    ) -> Result<Self, ClientError> {
        if config.capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "buffer capacity must be greater than 0".to_string(),
            ));
        }
        let inner: Arc<dyn LogClient> = Arc::from(new_client(transport_config)?);

        let state = Arc::new(BufferState {
            capacity: config.capacity,
            policy: config.overflow_policy,
            metrics,
            queue: Mutex::new(Queue {
                entries: VecDeque::with_capacity(config.capacity.min(1_024)),
                closed: false,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        });
        let abort = CancellationToken::new();
        let drain = tokio::spawn(run_drain(
            Arc::clone(&state),
            Arc::clone(&inner),
            retry,
            abort.clone(),
        ));

        debug!(
            "Overflow buffer started with capacity {} ({:?})",
            config.capacity, config.overflow_policy
        );

        Ok(Self {
            state,
            inner,
            abort,
            stopped: AtomicBool::new(false),
            drain: Mutex::new(Some(drain)),
        })
    }

    /// Entries accepted but not yet picked up by the drain task.
    #[must_use]
    pub fn queued_entries(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn take_drain(&self) -> Option<JoinHandle<()>> {
        self.drain
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl LogClient for OverflowBuffer {
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError> {
        validate_labels(&labels)?;
        let entry = LogEntry::new(labels, timestamp, line);

        loop {
            let mut room = pin!(self.state.not_full.notified());
            room.as_mut().enable();
            {
                let mut queue = self.state.lock();
                if queue.closed {
                    return Err(ClientError::Stopped);
                }
                if queue.entries.len() < self.state.capacity {
                    queue.entries.push_back(entry);
                    self.state.not_empty.notify_one();
                    return Ok(());
                }
                if self.state.policy == OverflowPolicy::DropOldest {
                    queue.entries.pop_front();
                    queue.entries.push_back(entry);
                    self.state.metrics.inc_dropped(DropReason::Overflow, 1);
                    warn!(
                        "Buffer full ({} entries), dropped the oldest entry",
                        self.state.capacity
                    );
                    self.state.not_empty.notify_one();
                    return Ok(());
                }
            }
            room.await;
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort.cancel();
        {
            let mut queue = self.state.close();
            let abandoned = queue.entries.len();
            if abandoned > 0 {
                warn!("Abandoning {abandoned} buffered entries on stop");
                self.state
                    .metrics
                    .inc_dropped(DropReason::Shutdown, abandoned as u64);
                queue.entries.clear();
            }
        }

        let drain = self.take_drain();
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(drain) = drain {
                        if let Err(e) = drain.await {
                            error!("Buffer drain task failed: {e}");
                        }
                    }
                    inner.stop();
                });
            }
            Err(_) => {
                if let Some(drain) = drain {
                    drain.abort();
                }
                inner.stop();
            }
        }
    }

    async fn stop_wait(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.state.close());

        if let Some(drain) = self.take_drain() {
            if let Err(e) = drain.await {
                error!("Buffer drain task failed: {e}");
            }
        }
        self.inner.stop_wait().await;
        debug!("Overflow buffer stopped");
    }
}

impl Drop for OverflowBuffer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_drain(
    state: Arc<BufferState>,
    inner: Arc<dyn LogClient>,
    retry: RetryPolicy,
    abort: CancellationToken,
) {
    loop {
        let mut pending = pin!(state.not_empty.notified());
        pending.as_mut().enable();
        let next = {
            let mut queue = state.lock();
            match queue.entries.pop_front() {
                Some(entry) => Some(entry),
                None if queue.closed => break,
                None => None,
            }
        };
        let Some(entry) = next else {
            pending.await;
            continue;
        };
        state.not_full.notify_one();

        let exhausted = || {
            if abort.is_cancelled() {
                DropReason::Shutdown
            } else {
                DropReason::RetriesExhausted
            }
        };
        match handle_with_retry(inner.as_ref(), &entry, &retry, &abort).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                error!("Dropping buffered entry: {e}");
                state.metrics.inc_dropped(exhausted(), 1);
            }
            Err(ClientError::PartialDelivery { failed, source }) => {
                error!("Buffered entry missed {} tenants: {source}", failed.len());
                state.metrics.inc_dropped(exhausted(), failed.len() as u64);
            }
            Err(e) => {
                warn!("Buffered entry was refused: {e}");
                state.metrics.inc_dropped(DropReason::Rejected, 1);
            }
        }
    }
    debug!("Buffer drain exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::client::ClientResult;
    use crate::constants::{MULTI_TENANT_CLIENT_LABEL, RESERVED_LABEL_TENANT_ID};
    use crate::errors::TransportError;
    use crate::multi_tenant::MultiTenantClient;
    use crate::test_support::{at_secs, labels, RecordingClient, Shared};
    use prometheus::Registry;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tracing_test::traced_test;

    fn factory(client: &Arc<RecordingClient>) -> NewClientFn {
        let client = Arc::clone(client);
        Arc::new(move |_: &TransportConfig| -> ClientResult {
            Ok(Box::new(Shared(Arc::clone(&client))))
        })
    }

    fn buffer(
        capacity: usize,
        overflow_policy: OverflowPolicy,
        inner: &Arc<RecordingClient>,
        metrics: &Arc<Metrics>,
    ) -> OverflowBuffer {
        let config = BufferConfig {
            enabled: true,
            capacity,
            overflow_policy,
        };
        let retry = RetryPolicy {
            max_retries: 3,
            min_backoff_ms: 1,
            max_backoff_ms: 5,
        };
        OverflowBuffer::new(
            config,
            retry,
            &TransportConfig::default(),
            factory(inner),
            Arc::clone(metrics),
        )
        .expect("buffer should build")
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new(&Registry::new()).unwrap())
    }

    async fn send(client: &OverflowBuffer, line: &str) -> Result<(), ClientError> {
        client
            .handle(labels(&[("job", "api")]), at_secs(1), line.to_string())
            .await
    }

    /// Waits until the drain task has taken every queued entry.
    async fn drained(buffer: &OverflowBuffer) {
        for _ in 0..200 {
            if buffer.queued_entries() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("drain did not pick up the queued entries");
    }

    #[tokio::test]
    async fn test_stop_wait_drains_everything() {
        let inner = Arc::new(RecordingClient::new());
        let metrics = metrics();
        let buffer = buffer(16, OverflowPolicy::Block, &inner, &metrics);

        for i in 0..5 {
            send(&buffer, &format!("line {i}")).await.unwrap();
        }
        buffer.stop_wait().await;

        assert_eq!(
            inner.lines(),
            vec!["line 0", "line 1", "line 2", "line 3", "line 4"]
        );
        assert!(inner.stopped_waiting());
        assert!(matches!(
            send(&buffer, "late").await,
            Err(ClientError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_room() {
        let gate = Arc::new(Semaphore::new(0));
        let inner = Arc::new(RecordingClient::gated(Arc::clone(&gate)));
        let metrics = metrics();
        let buffer = Arc::new(buffer(1, OverflowPolicy::Block, &inner, &metrics));

        send(&buffer, "A").await.unwrap();
        drained(&buffer).await;
        send(&buffer, "B").await.unwrap();

        let blocked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { send(&buffer, "C").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        gate.add_permits(3);
        blocked.await.unwrap().expect("blocked handle should succeed");
        buffer.stop_wait().await;

        assert_eq!(inner.lines(), vec!["A", "B", "C"]);
        assert_eq!(metrics.dropped(DropReason::Overflow), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_drop_oldest_policy_discards_oldest() {
        let gate = Arc::new(Semaphore::new(0));
        let inner = Arc::new(RecordingClient::gated(Arc::clone(&gate)));
        let metrics = metrics();
        let buffer = buffer(2, OverflowPolicy::DropOldest, &inner, &metrics);

        send(&buffer, "A").await.unwrap();
        drained(&buffer).await;
        for line in ["B", "C", "D"] {
            send(&buffer, line).await.unwrap();
        }
        assert_eq!(buffer.queued_entries(), 2);
        assert_eq!(metrics.dropped(DropReason::Overflow), 1);
        assert!(logs_contain("dropped the oldest entry"));

        gate.add_permits(3);
        buffer.stop_wait().await;

        assert_eq!(inner.lines(), vec!["A", "C", "D"]);
    }

    #[tokio::test]
    async fn test_stop_abandons_queue_and_releases_producers() {
        let gate = Arc::new(Semaphore::new(0));
        let inner = Arc::new(RecordingClient::gated(Arc::clone(&gate)));
        let metrics = metrics();
        let buffer = Arc::new(buffer(1, OverflowPolicy::Block, &inner, &metrics));

        send(&buffer, "A").await.unwrap();
        drained(&buffer).await;
        send(&buffer, "B").await.unwrap();
        let blocked = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { send(&buffer, "C").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        buffer.stop();
        assert!(matches!(
            blocked.await.unwrap(),
            Err(ClientError::Stopped)
        ));
        assert_eq!(metrics.dropped(DropReason::Shutdown), 1);

        // Let the in-flight entry through so the drain task can exit.
        gate.add_permits(1);
        for _ in 0..100 {
            if inner.stopped() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(inner.stopped());
        assert_eq!(inner.lines(), vec!["A"]);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried() {
        let inner = Arc::new(RecordingClient::new());
        inner.fail_next(ClientError::Submit(TransportError::Full));
        let metrics = metrics();
        let buffer = buffer(4, OverflowPolicy::Block, &inner, &metrics);

        send(&buffer, "A").await.unwrap();
        buffer.stop_wait().await;

        assert_eq!(inner.lines(), vec!["A"]);
        assert_eq!(metrics.dropped(DropReason::RetriesExhausted), 0);
    }

    #[tokio::test]
    async fn test_invalid_entry_is_rejected_before_queueing() {
        let inner = Arc::new(RecordingClient::new());
        let metrics = metrics();
        let buffer = buffer(4, OverflowPolicy::Block, &inner, &metrics);

        let result = buffer
            .handle(LabelSet::new(), at_secs(1), "x".to_string())
            .await;
        assert!(matches!(result, Err(ClientError::InvalidEntry(_))));
        assert_eq!(buffer.queued_entries(), 0);
        buffer.stop_wait().await;
    }

    #[tokio::test]
    async fn test_inner_construction_failure() {
        let failing: NewClientFn = Arc::new(|_: &TransportConfig| -> ClientResult {
            Err(ClientError::Construction(TransportError::Closed))
        });

        let result = OverflowBuffer::new(
            BufferConfig::default(),
            RetryPolicy::default(),
            &TransportConfig::default(),
            failing,
            metrics(),
        );
        assert!(matches!(result, Err(ClientError::Construction(_))));
    }

    #[tokio::test]
    async fn test_fan_out_retry_delivers_each_tenant_once() {
        let inner = Arc::new(RecordingClient::new());
        inner.fail_next(ClientError::Submit(TransportError::Full));
        let metrics = metrics();
        let retry = RetryPolicy {
            max_retries: 3,
            min_backoff_ms: 1,
            max_backoff_ms: 5,
        };
        let fan_out: NewClientFn = {
            let inner = Arc::clone(&inner);
            let retry = retry.clone();
            Arc::new(move |_: &TransportConfig| -> ClientResult {
                Ok(Box::new(MultiTenantClient::new(
                    Box::new(Shared(Arc::clone(&inner))),
                    false,
                    retry.clone(),
                )))
            })
        };
        let buffer = OverflowBuffer::new(
            BufferConfig {
                enabled: true,
                capacity: 4,
                overflow_policy: OverflowPolicy::Block,
            },
            retry,
            &TransportConfig::default(),
            fan_out,
            Arc::clone(&metrics),
        )
        .expect("buffer should build");

        buffer
            .handle(
                labels(&[("job", "api"), (MULTI_TENANT_CLIENT_LABEL, "a;b")]),
                at_secs(1),
                "A".to_string(),
            )
            .await
            .unwrap();
        buffer.stop_wait().await;

        let tenants: Vec<String> = inner
            .entries()
            .into_iter()
            .map(|e| e.labels[RESERVED_LABEL_TENANT_ID].clone())
            .collect();
        assert_eq!(tenants, vec!["b", "a"]);
        assert_eq!(metrics.dropped(DropReason::RetriesExhausted), 0);
    }

    #[tokio::test]
    async fn test_partial_delivery_counts_missed_tenants() {
        let inner = Arc::new(RecordingClient::new());
        let metrics = metrics();
        let fan_out: NewClientFn = {
            let inner = Arc::clone(&inner);
            Arc::new(move |_: &TransportConfig| -> ClientResult {
                inner.fail_next(ClientError::Submit(TransportError::Full));
                inner.fail_next(ClientError::Submit(TransportError::Full));
                let retry = RetryPolicy {
                    max_retries: 1,
                    min_backoff_ms: 1,
                    max_backoff_ms: 1,
                };
                Ok(Box::new(MultiTenantClient::new(
                    Box::new(Shared(Arc::clone(&inner))),
                    false,
                    retry,
                )))
            })
        };
        let buffer = OverflowBuffer::new(
            BufferConfig::default(),
            RetryPolicy::default(),
            &TransportConfig::default(),
            fan_out,
            Arc::clone(&metrics),
        )
        .expect("buffer should build");

        buffer
            .handle(
                labels(&[("job", "api"), (MULTI_TENANT_CLIENT_LABEL, "a;b;c")]),
                at_secs(1),
                "A".to_string(),
            )
            .await
            .unwrap();
        buffer.stop_wait().await;

        // "a" fails twice and gives up, "b" and "c" go through once each.
        assert_eq!(inner.lines(), vec!["A", "A"]);
        assert_eq!(metrics.dropped(DropReason::RetriesExhausted), 1);
        assert_eq!(metrics.dropped(DropReason::Rejected), 0);
    }

    /// Inner client whose `handle` panics, taking the drain task down.
    #[derive(Default)]
    struct PanickingClient {
        stopped: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LogClient for PanickingClient {
        async fn handle(
            &self,
            _labels: LabelSet,
            _timestamp: SystemTime,
            _line: String,
        ) -> Result<(), ClientError> {
            panic!("inner client failed");
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }

        async fn stop_wait(&self) {}
    }

    #[tokio::test]
    async fn test_stop_survives_a_failed_drain_task() {
        let inner = Arc::new(PanickingClient::default());
        let new_inner: NewClientFn = {
            let inner = Arc::clone(&inner);
            Arc::new(move |_: &TransportConfig| -> ClientResult {
                Ok(Box::new(Shared(Arc::clone(&inner))))
            })
        };
        let buffer = OverflowBuffer::new(
            BufferConfig::default(),
            RetryPolicy::default(),
            &TransportConfig::default(),
            new_inner,
            metrics(),
        )
        .expect("buffer should build");

        send(&buffer, "A").await.unwrap();
        drained(&buffer).await;
        buffer.stop();

        for _ in 0..100 {
            if inner.stopped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(inner.stopped.load(Ordering::SeqCst));
    }
}
