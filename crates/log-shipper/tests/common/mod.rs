// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helpers shared by the integration tests

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use log_shipper::{LabelSet, LogEntry, NewTransportFn, Transport, TransportConfig, TransportError};

/// Builds a label set from name/value pairs
pub fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn at_secs(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// In-memory transport recording every submitted entry
pub struct MemoryTransport {
    host: String,
    entries: Mutex<Vec<LogEntry>>,
    stopped: AtomicBool,
}

impl MemoryTransport {
    pub fn new(host: &str) -> Arc<Self> {
        Arc::new(Self {
            host: host.to_string(),
            entries: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }

    /// Entries routed to `tenant` through the reserved tenant label
    pub fn tenant_lines(&self, tenant: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.labels.get("__tenant_id__").map(String::as_str) == Some(tenant))
            .map(|e| e.line)
            .collect()
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Constructor handing out this transport for every pipeline built
    pub fn factory(self: &Arc<Self>) -> NewTransportFn {
        let transport = Arc::clone(self);
        Arc::new(
            move |_: &TransportConfig| -> Result<Arc<dyn Transport>, TransportError> {
                Ok(Arc::clone(&transport) as Arc<dyn Transport>)
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn submit(&self, entry: LogEntry) -> Result<(), TransportError> {
        if self.stopped() {
            return Err(TransportError::Closed);
        }
        self.entries.lock().unwrap().push(entry);
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn stop_wait(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn host(&self) -> &str {
        &self.host
    }
}
