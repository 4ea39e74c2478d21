// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::LogClient;
use crate::config::RetryPolicy;
use crate::entry::LogEntry;
use crate::errors::ClientError;

/// Hands `entry` to `client`, backing off and retrying while the error is
/// retryable.
///
/// Returns the last error once `policy.max_retries` is spent or `abort` is
/// cancelled. A retryable error in the result therefore means "gave up", a
/// non-retryable one means the entry was refused on the first try.
pub(crate) async fn handle_with_retry(
    client: &dyn LogClient,
    entry: &LogEntry,
    policy: &RetryPolicy,
    abort: &CancellationToken,
) -> Result<(), ClientError> {
    let mut attempts = 0;

    loop {
        let result = client
            .handle(entry.labels.clone(), entry.timestamp, entry.line.clone())
            .await;

        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempts < policy.max_retries => {
                attempts += 1;
                debug!("Retrying entry (attempt {attempts}): {e}");
                if !back_off(policy, attempts, abort).await {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sleeps before retry number `attempt`. Returns `false` when `abort` fires
/// first.
pub(crate) async fn back_off(
    policy: &RetryPolicy,
    attempt: u32,
    abort: &CancellationToken,
) -> bool {
    tokio::select! {
        () = abort.cancelled() => false,
        () = tokio::time::sleep(policy.backoff(attempt)) => true,
    }
}
