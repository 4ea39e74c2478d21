// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use crate::client::LogClient;
use crate::config::RetryPolicy;
use crate::constants::{FULL_QUEUE_MAX_BACKOFF_MS, FULL_QUEUE_MIN_BACKOFF_MS};
use crate::entry::{validate_labels, LabelSet, LogEntry};
use crate::errors::{ClientError, TransportError};
use crate::metrics::Metrics;
use crate::transport::Transport;

/// Innermost client: submits entries to the transport and counts them.
///
/// The forwarded counter moves when the transport *accepts* an entry, not
/// when the remote store acknowledges it. A transport reporting a full queue
/// is waited out, so `handle` only fails for an invalid entry or a stopped
/// transport.
pub struct MeteredClient {
    transport: Arc<dyn Transport>,
    metrics: Arc<Metrics>,
    wait: RetryPolicy,
}

impl MeteredClient {
    pub fn new(transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self {
            transport,
            metrics,
            wait: RetryPolicy {
                max_retries: u32::MAX,
                min_backoff_ms: FULL_QUEUE_MIN_BACKOFF_MS,
                max_backoff_ms: FULL_QUEUE_MAX_BACKOFF_MS,
            },
        }
    }
}

#[async_trait]
impl LogClient for MeteredClient {
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError> {
        validate_labels(&labels)?;
        let entry = LogEntry::new(labels, timestamp, line);

        let mut attempts: u32 = 0;
        loop {
            match self.transport.submit(entry.clone()).await {
                Ok(()) => break,
                Err(TransportError::Full) => {
                    attempts = attempts.saturating_add(1);
                    if attempts == 1 {
                        debug!("Transport to {} is full, waiting", self.transport.host());
                    }
                    tokio::time::sleep(self.wait.backoff(attempts)).await;
                }
                Err(e) => return Err(ClientError::Submit(e)),
            }
        }
        self.metrics.inc_forwarded(self.transport.host());
        Ok(())
    }

    fn stop(&self) {
        self.transport.stop();
    }

    async fn stop_wait(&self) {
        self.transport.stop_wait().await;
    }
}
