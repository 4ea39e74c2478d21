// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Well-known label keys and default limits shared across the pipeline.

use std::time::Duration;

/// Label marking an entry as already routed to a tenant.
///
/// The push transport turns it into the `X-Scope-OrgID` header and never ships
/// it as a stream label. An inbound entry carrying it is treated as a
/// loop-back re-emission by [`crate::tenant::RemoveTenantIdClient`].
pub const RESERVED_LABEL_TENANT_ID: &str = "__tenant_id__";

/// Label holding a `;` separated list of tenants an entry must be copied to.
pub const MULTI_TENANT_CLIENT_LABEL: &str = "__multitenant_id__";

/// Default label stamped with the batch slot by the sorted client.
pub const DEFAULT_BATCH_ID_LABEL: &str = "id";

/// Header carrying the tenant of a push request.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

/// Lower bound for the sorted client's batch age check period.
pub const MIN_WAIT_CHECK_FREQUENCY: Duration = Duration::from_millis(10);

/// The batch age is checked this many times per batch wait period.
pub const WAIT_CHECK_FREQUENCY_DELIMITER: u32 = 10;

pub const DEFAULT_NUMBER_OF_BATCH_IDS: u64 = 10;
pub const DEFAULT_BATCH_WAIT_MS: u64 = 1_000;
pub const DEFAULT_BATCH_SIZE_BYTES: usize = 1_024 * 1_024;

/// Retries of a single entry before the rest of its batch is dropped.
pub const FLUSH_RETRY_COUNT: u32 = 3;
pub const DEFAULT_MIN_BACKOFF_MS: u64 = 100;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 5_000;

pub const DEFAULT_BUFFER_CAPACITY: usize = 10_000;

/// Sealed batches a slot may hold before sealing waits for its flusher.
pub const DEFAULT_SLOT_QUEUE_CAPACITY: usize = 4;

/// Backoff bounds while a transport reports a full queue.
pub const FULL_QUEUE_MIN_BACKOFF_MS: u64 = 10;
pub const FULL_QUEUE_MAX_BACKOFF_MS: u64 = 1_000;

pub const DEFAULT_TRANSPORT_QUEUE_CAPACITY: usize = 1_024;
pub const DEFAULT_TRANSPORT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TRANSPORT_MAX_RETRIES: u32 = 10;
pub const DEFAULT_TRANSPORT_MIN_BACKOFF_MS: u64 = 500;
pub const DEFAULT_TRANSPORT_MAX_BACKOFF_MS: u64 = 5 * 60 * 1_000;

/// How often a batch should be checked for its flush deadline.
///
/// Ten checks per `batch_wait`, but never more often than
/// [`MIN_WAIT_CHECK_FREQUENCY`].
#[must_use]
pub fn wait_check_frequency(batch_wait: Duration) -> Duration {
    (batch_wait / WAIT_CHECK_FREQUENCY_DELIMITER).max(MIN_WAIT_CHECK_FREQUENCY)
}
