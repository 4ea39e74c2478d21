// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recording doubles shared by the unit tests.

#![cfg(test)]
#![allow(clippy::unwrap_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::client::LogClient;
use crate::entry::{LabelSet, LogEntry};
use crate::errors::{ClientError, TransportError};
use crate::transport::Transport;

pub(crate) fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub(crate) fn at_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// Transport that keeps every accepted entry in memory.
pub(crate) struct RecordingTransport {
    host: String,
    entries: Mutex<Vec<LogEntry>>,
    full_failures: Mutex<usize>,
    stopped: AtomicBool,
    stopped_waiting: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            entries: Mutex::new(Vec::new()),
            full_failures: Mutex::new(0),
            stopped: AtomicBool::new(false),
            stopped_waiting: AtomicBool::new(false),
        }
    }

    /// The next `count` submits report a full queue.
    pub(crate) fn fail_full(&self, count: usize) {
        *self.full_failures.lock().unwrap() = count;
    }

    pub(crate) fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.line).collect()
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn stopped_waiting(&self) -> bool {
        self.stopped_waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn submit(&self, entry: LogEntry) -> Result<(), TransportError> {
        if self.stopped() || self.stopped_waiting() {
            return Err(TransportError::Closed);
        }
        let mut failures = self.full_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(TransportError::Full);
        }
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn stop_wait(&self) {
        self.stopped_waiting.store(true, Ordering::SeqCst);
    }

    fn host(&self) -> &str {
        &self.host
    }
}

/// Client that records what reaches it.
///
/// Optionally fails the first calls with a retryable error, or waits for a
/// permit on `gate` before accepting each entry.
pub(crate) struct RecordingClient {
    entries: Mutex<Vec<LogEntry>>,
    failures: Mutex<VecDeque<ClientError>>,
    gate: Option<Arc<Semaphore>>,
    stopped: AtomicBool,
    stopped_waiting: AtomicBool,
}

impl RecordingClient {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            gate: None,
            stopped: AtomicBool::new(false),
            stopped_waiting: AtomicBool::new(false),
        }
    }

    pub(crate) fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new()
        }
    }

    /// Queues an error returned by the next call instead of recording it.
    pub(crate) fn fail_next(&self, error: ClientError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn lines(&self) -> Vec<String> {
        self.entries().into_iter().map(|e| e.line).collect()
    }

    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn stopped_waiting(&self) -> bool {
        self.stopped_waiting.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LogClient for RecordingClient {
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.entries
            .lock()
            .unwrap()
            .push(LogEntry::new(labels, timestamp, line));
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn stop_wait(&self) {
        self.stopped_waiting.store(true, Ordering::SeqCst);
    }
}

/// Lets a test keep a handle on a client it hands over as a `Box`.
pub(crate) struct Shared<C>(pub(crate) Arc<C>);

#[async_trait]
impl<C: LogClient> LogClient for Shared<C> {
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError> {
        self.0.handle(labels, timestamp, line).await
    }

    fn stop(&self) {
        self.0.stop();
    }

    async fn stop_wait(&self) {
        self.0.stop_wait().await;
    }
}
