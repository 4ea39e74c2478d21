// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The client contract and the factory assembling a pipeline from config.
//!
//! Every stage implements [`LogClient`] and owns the stage it wraps, so the
//! stages compose in any order:
//!
//! ```text
//!   OverflowBuffer            (client.buffer.enabled)
//!     RemoveTenantIdClient    (client.remove_tenant_id)
//!       SortedClient          (client.sort_by_timestamp)
//!         MultiTenantClient   (always, label not preserved)
//!           MeteredClient     (always)
//!             Transport
//! ```

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

use crate::buffer::OverflowBuffer;
use crate::config::{Config, TransportConfig};
use crate::entry::LabelSet;
use crate::errors::ClientError;
use crate::metered::MeteredClient;
use crate::metrics::Metrics;
use crate::multi_tenant::MultiTenantClient;
use crate::sorted::{SortedClient, SortedClientConfig};
use crate::tenant::RemoveTenantIdClient;
use crate::transport::{NewTransportFn, PushTransport};

#[async_trait]
pub trait LogClient: Send + Sync {
    /// Accepts one entry.
    ///
    /// Errors only signal local problems (an invalid entry, a stopped
    /// client). Stages that buffer retry transient delivery failures
    /// themselves and report success once the entry is accepted.
    async fn handle(
        &self,
        labels: LabelSet,
        timestamp: SystemTime,
        line: String,
    ) -> Result<(), ClientError>;

    /// Stops without waiting. Entries not yet handed to the transport may be
    /// lost.
    fn stop(&self);

    /// Hands every accepted entry to the transport, then stops it.
    async fn stop_wait(&self);
}

pub type ClientResult = Result<Box<dyn LogClient>, ClientError>;

/// Builds the client a buffering stage wraps.
pub type NewClientFn = Arc<dyn Fn(&TransportConfig) -> ClientResult + Send + Sync>;

/// Builds the pipeline described by `config` on top of [`PushTransport`].
///
/// Must be called from within a tokio runtime: the buffering stages and the
/// transport spawn their background tasks here.
pub fn new_client(
    config: &Config,
    metrics: Arc<Metrics>,
) -> Result<Box<dyn LogClient>, ClientError> {
    new_client_with_transport(config, metrics, PushTransport::new_fn())
}

/// Same as [`new_client`] with a caller supplied transport constructor.
pub fn new_client_with_transport(
    config: &Config,
    metrics: Arc<Metrics>,
    new_transport: NewTransportFn,
) -> Result<Box<dyn LogClient>, ClientError> {
    config.validate()?;

    let direct = {
        let metrics = Arc::clone(&metrics);
        let retry = config.client.retry.clone();
        Arc::new(move |transport_config: &TransportConfig| -> ClientResult {
            let transport = new_transport(transport_config).map_err(ClientError::Construction)?;
            let metered = MeteredClient::new(transport, Arc::clone(&metrics));
            Ok(Box::new(MultiTenantClient::new(
                Box::new(metered),
                false,
                retry.clone(),
            )))
        })
    };

    let mut new_chain: NewClientFn = direct;

    if config.client.sort_by_timestamp {
        let sorted_config = SortedClientConfig::from(&config.client);
        let metrics = Arc::clone(&metrics);
        let inner = new_chain;
        new_chain = Arc::new(move |transport_config: &TransportConfig| -> ClientResult {
            let client = SortedClient::new(
                sorted_config.clone(),
                transport_config,
                Arc::clone(&inner),
                Arc::clone(&metrics),
            )?;
            Ok(Box::new(client))
        });
    }

    if config.client.remove_tenant_id {
        let metrics = Arc::clone(&metrics);
        let inner = new_chain;
        new_chain = Arc::new(move |transport_config: &TransportConfig| -> ClientResult {
            let client = inner(transport_config)?;
            Ok(Box::new(RemoveTenantIdClient::new(client, Arc::clone(&metrics))))
        });
    }

    let client = if config.client.buffer.enabled {
        Box::new(OverflowBuffer::new(
            config.client.buffer.clone(),
            config.client.retry.clone(),
            &config.transport,
            new_chain,
            metrics,
        )?) as Box<dyn LogClient>
    } else {
        new_chain(&config.transport)?
    };

    debug!(
        sort_by_timestamp = config.client.sort_by_timestamp,
        buffer = config.client.buffer.enabled,
        remove_tenant_id = config.client.remove_tenant_id,
        "Log client created"
    );

    Ok(client)
}
