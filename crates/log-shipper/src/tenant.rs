// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use crate::client::LogClient;
use crate::constants::{MULTI_TENANT_CLIENT_LABEL, RESERVED_LABEL_TENANT_ID};
use crate::entry::LabelSet;
use crate::errors::ClientError;
use crate::metrics::{DropReason, Metrics};

/// Single-tenant guard in front of a client.
///
/// An entry that already carries [`RESERVED_LABEL_TENANT_ID`] was routed
/// once and re-emitted; forwarding it again would loop, so it is dropped and
/// counted. Every other entry loses its multi-tenant routing label.
pub struct RemoveTenantIdClient {
    inner: Box<dyn LogClient>,
    metrics: Arc<Metrics>,
}

impl RemoveTenantIdClient {
    pub fn new(inner: Box<dyn LogClient>, metrics: Arc<Metrics>) -> Self {
        Self { inner, metrics }
    }
}

#[async_trait]
impl LogClient for RemoveTenantIdClient {
    async fn handle(
        &self,
        mut labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError> {
        if labels.contains_key(RESERVED_LABEL_TENANT_ID) {
            debug!("Dropping entry already routed to a tenant");
            self.metrics.inc_dropped(DropReason::ReservedLabel, 1);
            return Ok(());
        }
        labels.remove(MULTI_TENANT_CLIENT_LABEL);
        self.inner.handle(labels, timestamp, line).await
    }

    fn stop(&self) {
        self.inner.stop();
    }

    async fn stop_wait(&self) {
        self.inner.stop_wait().await;
    }
}
