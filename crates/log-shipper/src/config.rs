// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline configuration.
//!
//! Every struct deserializes with serde and falls back to the defaults in
//! [`crate::constants`] for missing fields. Durations are carried as
//! milliseconds and exposed as [`Duration`] through accessors.

use std::time::Duration;

use serde::Deserialize;

use crate::constants;
use crate::entry::{validate_labels, LabelSet};
use crate::errors::{ClientError, TransportError};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub transport: TransportConfig,
}

impl Config {
    /// Rejects settings no pipeline can be built from.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.client.number_of_batch_ids == 0 {
            return Err(ClientError::InvalidConfig(
                "number_of_batch_ids must be greater than 0".to_string(),
            ));
        }
        if self.client.slot_queue_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "slot_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.client.sort_by_timestamp && self.client.batch_wait_ms == 0 {
            return Err(ClientError::InvalidConfig(
                "batch_wait_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(label) = &self.client.batch_id_label {
            let mut named = LabelSet::new();
            named.insert(label.clone(), String::new());
            validate_labels(&named).map_err(|_| {
                ClientError::InvalidConfig(format!("invalid batch_id_label {label:?}"))
            })?;
        }
        if self.client.buffer.enabled && self.client.buffer.capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "buffer capacity must be greater than 0".to_string(),
            ));
        }
        if self.transport.queue_capacity == 0 {
            return Err(ClientError::InvalidConfig(
                "transport queue_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Route entries through the sorted client.
    pub sort_by_timestamp: bool,
    /// Size of the rolling batch-id pool used by the sorted client.
    pub number_of_batch_ids: u64,
    /// Maximum age of a batch before it is flushed, in milliseconds.
    pub batch_wait_ms: u64,
    /// A batch is sealed before it grows past this many bytes of log lines.
    pub batch_size_bytes: usize,
    /// Label stamped with the batch slot on sorted entries. `None` disables it.
    pub batch_id_label: Option<String>,
    /// Sealed batches a slot holds before sealing waits for its flusher.
    pub slot_queue_capacity: usize,
    /// Drop already-routed entries and strip multi-tenant routing.
    pub remove_tenant_id: bool,
    pub retry: RetryPolicy,
    pub buffer: BufferConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sort_by_timestamp: false,
            number_of_batch_ids: constants::DEFAULT_NUMBER_OF_BATCH_IDS,
            batch_wait_ms: constants::DEFAULT_BATCH_WAIT_MS,
            batch_size_bytes: constants::DEFAULT_BATCH_SIZE_BYTES,
            batch_id_label: Some(constants::DEFAULT_BATCH_ID_LABEL.to_string()),
            slot_queue_capacity: constants::DEFAULT_SLOT_QUEUE_CAPACITY,
            remove_tenant_id: false,
            retry: RetryPolicy::default(),
            buffer: BufferConfig::default(),
        }
    }
}

impl ClientConfig {
    #[must_use]
    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }
}

/// Bounded retries with exponential backoff for retryable delivery errors.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: constants::FLUSH_RETRY_COUNT,
            min_backoff_ms: constants::DEFAULT_MIN_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (starting at 1).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.min_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

/// What the overflow buffer does when its queue is full.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// `handle` waits until the drain frees room. Nothing is lost.
    #[default]
    Block,
    /// The oldest queued entry is discarded to make room.
    DropOldest,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    pub enabled: bool,
    pub capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: constants::DEFAULT_BUFFER_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

/// Settings of the push transport. Opaque to the client stages.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Full push endpoint, e.g. `http://loki:3100/loki/api/v1/push`.
    pub url: String,
    /// Tenant used for entries that carry no tenant label.
    pub tenant_id: Option<String>,
    /// Labels added to every stream unless the entry already sets them.
    pub external_labels: LabelSet,
    pub batch_wait_ms: u64,
    pub batch_size_bytes: usize,
    pub queue_capacity: usize,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            tenant_id: None,
            external_labels: LabelSet::new(),
            batch_wait_ms: constants::DEFAULT_BATCH_WAIT_MS,
            batch_size_bytes: constants::DEFAULT_BATCH_SIZE_BYTES,
            queue_capacity: constants::DEFAULT_TRANSPORT_QUEUE_CAPACITY,
            timeout_ms: constants::DEFAULT_TRANSPORT_TIMEOUT_MS,
            max_retries: constants::DEFAULT_TRANSPORT_MAX_RETRIES,
            min_backoff_ms: constants::DEFAULT_TRANSPORT_MIN_BACKOFF_MS,
            max_backoff_ms: constants::DEFAULT_TRANSPORT_MAX_BACKOFF_MS,
        }
    }
}

impl TransportConfig {
    /// Host of the push endpoint, used as the `host` metric label.
    pub fn host(&self) -> Result<String, TransportError> {
        let url = reqwest::Url::parse(&self.url)
            .map_err(|_| TransportError::InvalidUrl(self.url.clone()))?;
        url.host_str()
            .map(ToString::to_string)
            .ok_or_else(|| TransportError::InvalidUrl(self.url.clone()))
    }

    #[must_use]
    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.batch_wait_ms)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Same schedule as [`RetryPolicy`], with the transport's own bounds.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            min_backoff_ms: self.min_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
        }
    }
}
