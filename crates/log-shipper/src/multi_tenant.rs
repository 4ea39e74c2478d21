// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::SystemTime;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::LogClient;
use crate::config::RetryPolicy;
use crate::constants::{MULTI_TENANT_CLIENT_LABEL, RESERVED_LABEL_TENANT_ID};
use crate::entry::{parse_tenants, LabelSet};
use crate::errors::ClientError;
use crate::retry::back_off;

/// Copies an entry once per tenant listed in [`MULTI_TENANT_CLIENT_LABEL`].
///
/// Each copy carries [`RESERVED_LABEL_TENANT_ID`] set to its tenant. With
/// `preserve_label` the multi-tenant label stays on the copies, otherwise it
/// is removed. Entries without the label pass through untouched.
///
/// A copy is never handed over twice. When some copies are accepted and
/// others fail with a retryable error, only the failed copies are retried
/// here, per `retry`. A retryable error is returned only when no copy was
/// accepted, so the caller may safely send the whole entry again.
pub struct MultiTenantClient {
    inner: Box<dyn LogClient>,
    preserve_label: bool,
    retry: RetryPolicy,
    abort: CancellationToken,
}

impl MultiTenantClient {
    pub fn new(inner: Box<dyn LogClient>, preserve_label: bool, retry: RetryPolicy) -> Self {
        Self {
            inner,
            preserve_label,
            retry,
            abort: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl LogClient for MultiTenantClient {
    async fn handle(
        &self,
        mut labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError> {
        let tenants = labels
            .get(MULTI_TENANT_CLIENT_LABEL)
            .map(|ids| parse_tenants(ids));
        let Some(tenants) = tenants else {
            return self.inner.handle(labels, timestamp, line).await;
        };
        if !self.preserve_label {
            labels.remove(MULTI_TENANT_CLIENT_LABEL);
        }
        if tenants.is_empty() {
            return self.inner.handle(labels, timestamp, line).await;
        }

        let mut pending = tenants;
        let mut accepted = 0;
        let mut refused = None;
        let mut attempts = 0;

        loop {
            let mut failed = Vec::new();
            let mut last_error = None;
            for tenant in pending {
                let mut tenant_labels = labels.clone();
                tenant_labels.insert(RESERVED_LABEL_TENANT_ID.to_string(), tenant.clone());
                match self
                    .inner
                    .handle(tenant_labels, timestamp, line.clone())
                    .await
                {
                    Ok(()) => accepted += 1,
                    Err(e) if e.is_retryable() => {
                        failed.push(tenant);
                        last_error = Some(e);
                    }
                    Err(e) => {
                        warn!("Failed to forward entry to tenant {tenant}: {e}");
                        refused.get_or_insert(e);
                    }
                }
            }

            let Some(error) = last_error else {
                break;
            };
            if accepted == 0 && refused.is_none() {
                return Err(error);
            }

            attempts += 1;
            if attempts > self.retry.max_retries
                || !back_off(&self.retry, attempts, &self.abort).await
            {
                error!("Giving up on tenants {failed:?} after {attempts} attempts: {error}");
                return Err(ClientError::PartialDelivery {
                    failed,
                    source: Box::new(error),
                });
            }
            debug!("Retrying entry for tenants {failed:?} (attempt {attempts})");
            pending = failed;
        }

        match refused {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stop(&self) {
        self.abort.cancel();
        self.inner.stop();
    }

    async fn stop_wait(&self) {
        self.inner.stop_wait().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::test_support::{at_secs, labels, RecordingClient, Shared};
    use std::sync::Arc;

    fn retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_backoff_ms: 1,
            max_backoff_ms: 5,
        }
    }

    fn client(preserve_label: bool) -> (MultiTenantClient, Arc<RecordingClient>) {
        let inner = Arc::new(RecordingClient::new());
        let client = MultiTenantClient::new(
            Box::new(Shared(Arc::clone(&inner))),
            preserve_label,
            retry(3),
        );
        (client, inner)
    }

    fn tenants(inner: &RecordingClient) -> Vec<String> {
        inner
            .entries()
            .into_iter()
            .map(|e| e.labels[RESERVED_LABEL_TENANT_ID].clone())
            .collect()
    }

    fn routed(ids: &str) -> LabelSet {
        labels(&[("job", "api"), (MULTI_TENANT_CLIENT_LABEL, ids)])
    }

    #[tokio::test]
    async fn test_passthrough_without_label() {
        let (client, inner) = client(false);

        client
            .handle(labels(&[("job", "api")]), at_secs(1), "line".to_string())
            .await
            .unwrap();

        assert_eq!(inner.entries()[0].labels, labels(&[("job", "api")]));
    }

    #[tokio::test]
    async fn test_fan_out_strips_label() {
        let (client, inner) = client(false);

        client
            .handle(
                labels(&[("job", "api"), (MULTI_TENANT_CLIENT_LABEL, "a; b")]),
                at_secs(1),
                "line".to_string(),
            )
            .await
            .unwrap();

        let entries = inner.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0].labels,
            labels(&[("job", "api"), (RESERVED_LABEL_TENANT_ID, "a")])
        );
        assert_eq!(
            entries[1].labels,
            labels(&[("job", "api"), (RESERVED_LABEL_TENANT_ID, "b")])
        );
    }

    #[tokio::test]
    async fn test_fan_out_preserves_label() {
        let (client, inner) = client(true);

        client
            .handle(
                labels(&[("job", "api"), (MULTI_TENANT_CLIENT_LABEL, "a")]),
                at_secs(1),
                "line".to_string(),
            )
            .await
            .unwrap();

        assert_eq!(
            inner.entries()[0].labels,
            labels(&[
                ("job", "api"),
                (MULTI_TENANT_CLIENT_LABEL, "a"),
                (RESERVED_LABEL_TENANT_ID, "a"),
            ])
        );
    }

    #[tokio::test]
    async fn test_empty_tenant_list_forwards_once() {
        let (client, inner) = client(false);

        client
            .handle(
                labels(&[("job", "api"), (MULTI_TENANT_CLIENT_LABEL, " ; ")]),
                at_secs(1),
                "line".to_string(),
            )
            .await
            .unwrap();

        let entries = inner.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].labels, labels(&[("job", "api")]));
    }

    #[tokio::test]
    async fn test_only_the_failed_copy_is_retried() {
        let (client, inner) = client(false);
        inner.fail_next(ClientError::Submit(TransportError::Full));

        client
            .handle(routed("a;b"), at_secs(1), "line".to_string())
            .await
            .expect("the failed copy should be retried");

        assert_eq!(tenants(&inner), vec!["b", "a"]);
    }

    #[tokio::test]
    async fn test_exhausted_copy_reports_partial_delivery() {
        let inner = Arc::new(RecordingClient::new());
        let client =
            MultiTenantClient::new(Box::new(Shared(Arc::clone(&inner))), false, retry(1));
        inner.fail_next(ClientError::Submit(TransportError::Full));
        inner.fail_next(ClientError::Submit(TransportError::Full));

        let err = client
            .handle(routed("a;b"), at_secs(1), "line".to_string())
            .await
            .unwrap_err();

        assert!(!err.is_retryable());
        assert!(matches!(
            &err,
            ClientError::PartialDelivery { failed, .. } if failed == &vec!["a".to_string()]
        ));
        assert_eq!(tenants(&inner), vec!["b"]);
    }

    #[tokio::test]
    async fn test_no_accepted_copy_leaves_retry_to_the_caller() {
        let (client, inner) = client(false);
        inner.fail_next(ClientError::Submit(TransportError::Full));
        inner.fail_next(ClientError::Submit(TransportError::Full));

        let err = client
            .handle(routed("a;b"), at_secs(1), "line".to_string())
            .await
            .unwrap_err();

        assert!(err.is_retryable());
        assert!(inner.entries().is_empty());
    }

    #[tokio::test]
    async fn test_refused_copy_does_not_block_the_others() {
        let (client, inner) = client(false);
        inner.fail_next(ClientError::InvalidEntry("bad".to_string()));

        let err = client
            .handle(routed("a;b"), at_secs(1), "line".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::InvalidEntry(_)));
        assert_eq!(tenants(&inner), vec!["b"]);
    }

    #[tokio::test]
    async fn test_stop_interrupts_copy_retries() {
        let inner = Arc::new(RecordingClient::new());
        let client = MultiTenantClient::new(
            Box::new(Shared(Arc::clone(&inner))),
            false,
            RetryPolicy {
                max_retries: 3,
                min_backoff_ms: 60_000,
                max_backoff_ms: 60_000,
            },
        );
        inner.fail_next(ClientError::Submit(TransportError::Full));
        client.stop();

        let err = client
            .handle(routed("a;b"), at_secs(1), "line".to_string())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::PartialDelivery { .. }));
        assert_eq!(tenants(&inner), vec!["b"]);
        assert!(inner.stopped());
    }
}
