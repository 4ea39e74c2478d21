// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport to the remote log store.
//!
//! The client stages only rely on the [`Transport`] trait. [`PushTransport`]
//! implements it against a Loki-compatible push endpoint:
//!
//! ```text
//!   submit() ──send──> [bounded queue] ──> worker
//!                                            │ batch by wait/size
//!                                            │ group by tenant
//!                                            v
//!                                      POST push JSON (retry 5xx/429)
//! ```
//!
//! `submit` waits for room in the queue but never on the network. Delivery
//! failures are handled by the worker and only show up in logs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::{RetryPolicy, TransportConfig};
use crate::constants::{RESERVED_LABEL_TENANT_ID, TENANT_HEADER, wait_check_frequency};
use crate::entry::{LabelSet, LogEntry};
use crate::errors::TransportError;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Queues an entry for sending, waiting while the queue is at capacity.
    ///
    /// A transport that sheds load instead returns [`TransportError::Full`]
    /// and leaves the entry with the caller.
    async fn submit(&self, entry: LogEntry) -> Result<(), TransportError>;
    /// Stops sending right away, abandoning queued entries.
    fn stop(&self);
    /// Sends everything already queued, then stops.
    async fn stop_wait(&self);
    /// Destination host, used to label metrics.
    fn host(&self) -> &str;
}

/// Builds a transport from its settings.
pub type NewTransportFn =
    Arc<dyn Fn(&TransportConfig) -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

pub struct PushTransport {
    host: String,
    tx: mpsc::Sender<LogEntry>,
    stop: CancellationToken,
    drain: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PushTransport {
    /// Validates the endpoint and spawns the sending worker on the current
    /// tokio runtime.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let host = config.host()?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let stop = CancellationToken::new();
        let drain = CancellationToken::new();

        let worker = PushWorker {
            client,
            config: config.clone(),
            retry: config.retry_policy(),
            stop: stop.clone(),
        };
        let handle = tokio::spawn(worker.run(rx, drain.clone()));

        debug!(host = %host, "Push transport started");

        Ok(Self {
            host,
            tx,
            stop,
            drain,
            worker: Mutex::new(Some(handle)),
        })
    }

    #[must_use]
    pub fn new_fn() -> NewTransportFn {
        Arc::new(|config: &TransportConfig| {
            PushTransport::new(config).map(|t| Arc::new(t) as Arc<dyn Transport>)
        })
    }
}

#[async_trait]
impl Transport for PushTransport {
    async fn submit(&self, entry: LogEntry) -> Result<(), TransportError> {
        if self.drain.is_cancelled() || self.stop.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            () = self.stop.cancelled() => Err(TransportError::Closed),
            sent = self.tx.send(entry) => sent.map_err(|_| TransportError::Closed),
        }
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    async fn stop_wait(&self) {
        self.drain.cancel();
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Push transport worker failed: {e}");
            }
        }
    }

    fn host(&self) -> &str {
        &self.host
    }
}

#[derive(Serialize)]
struct PushRequest {
    streams: Vec<PushStream>,
}

#[derive(Serialize)]
struct PushStream {
    stream: LabelSet,
    values: Vec<[String; 2]>,
}

/// Entries collected by the worker since the last send.
struct PendingBatch {
    entries: Vec<LogEntry>,
    bytes: usize,
    created_at: Option<Instant>,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            bytes: 0,
            created_at: None,
        }
    }

    fn add(&mut self, entry: LogEntry) {
        self.created_at.get_or_insert_with(Instant::now);
        self.bytes += entry.size_bytes();
        self.entries.push(entry);
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn take(&mut self) -> Vec<LogEntry> {
        self.bytes = 0;
        self.created_at = None;
        std::mem::take(&mut self.entries)
    }
}

struct PushWorker {
    client: reqwest::Client,
    config: TransportConfig,
    retry: RetryPolicy,
    stop: CancellationToken,
}

impl PushWorker {
    async fn run(self, mut rx: mpsc::Receiver<LogEntry>, drain: CancellationToken) {
        let batch_wait = self.config.batch_wait();
        let mut ticker = tokio::time::interval(wait_check_frequency(batch_wait));
        let mut pending = PendingBatch::new();
        let mut draining = false;

        loop {
            tokio::select! {
                biased;
                () = self.stop.cancelled() => {
                    debug!(pending = pending.entries.len(), "Push transport stopped");
                    return;
                }
                () = drain.cancelled(), if !draining => {
                    draining = true;
                    rx.close();
                }
                received = rx.recv() => match received {
                    Some(entry) => {
                        if !pending.is_empty()
                            && pending.bytes + entry.size_bytes() > self.config.batch_size_bytes
                        {
                            self.send_batch(pending.take()).await;
                        }
                        pending.add(entry);
                    }
                    None => {
                        if !pending.is_empty() {
                            self.send_batch(pending.take()).await;
                        }
                        debug!("Push transport drained");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    let due = pending
                        .created_at
                        .is_some_and(|created| created.elapsed() >= batch_wait);
                    if due {
                        self.send_batch(pending.take()).await;
                    }
                }
            }
        }
    }

    async fn send_batch(&self, entries: Vec<LogEntry>) {
        for (tenant, body) in build_requests(entries, &self.config) {
            let payload = match serde_json::to_vec(&body) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("Failed to serialize push request. Data dropped: {e}");
                    continue;
                }
            };
            self.send(tenant.as_deref(), payload).await;
        }
    }

    async fn send(&self, tenant: Option<&str>, payload: Vec<u8>) {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let mut request = self
                .client
                .post(&self.config.url)
                .header("Content-Type", "application/json")
                .body(payload.clone());
            if let Some(tenant) = tenant {
                request = request.header(TENANT_HEADER, tenant);
            }

            let time = Instant::now();
            let retryable = match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!(
                            "Pushed batch in {} ms (tenant: {:?})",
                            time.elapsed().as_millis(),
                            tenant
                        );
                        return;
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                        warn!("{status}: Push failed (attempt {attempts}): {body}");
                        true
                    } else {
                        error!("{status}: Push rejected. Data dropped: {body}");
                        false
                    }
                }
                Err(e) => {
                    warn!("Network error while pushing (attempt {attempts}): {e:?}");
                    true
                }
            };

            if !retryable {
                return;
            }
            if attempts > self.retry.max_retries {
                error!("Failed to push batch after {attempts} attempts. Data dropped");
                return;
            }

            tokio::select! {
                () = self.stop.cancelled() => return,
                () = tokio::time::sleep(self.retry.backoff(attempts)) => {}
            }
        }
    }
}

/// Groups entries into one push request per tenant.
///
/// The reserved tenant label selects the tenant and is removed from the
/// stream labels. External labels fill in names the entry does not set.
fn build_requests(
    entries: Vec<LogEntry>,
    config: &TransportConfig,
) -> BTreeMap<Option<String>, PushRequest> {
    let mut grouped: BTreeMap<Option<String>, BTreeMap<LabelSet, Vec<[String; 2]>>> =
        BTreeMap::new();

    for entry in entries {
        let value = [entry.unix_nanos().to_string(), entry.line];
        let mut labels = entry.labels;
        let tenant = labels
            .remove(RESERVED_LABEL_TENANT_ID)
            .or_else(|| config.tenant_id.clone());
        for (name, label_value) in &config.external_labels {
            labels
                .entry(name.clone())
                .or_insert_with(|| label_value.clone());
        }
        grouped
            .entry(tenant)
            .or_default()
            .entry(labels)
            .or_default()
            .push(value);
    }

    grouped
        .into_iter()
        .map(|(tenant, streams)| {
            let streams = streams
                .into_iter()
                .map(|(stream, values)| PushStream { stream, values })
                .collect();
            (tenant, PushRequest { streams })
        })
        .collect()
}
