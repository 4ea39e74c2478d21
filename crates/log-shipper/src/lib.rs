// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client pipeline shipping labeled log lines to a Loki-compatible backend.
//!
//! A pipeline is a stack of [`LogClient`] stages assembled by [`new_client`]
//! from a [`Config`]: optional buffering and timestamp sorting on top of
//! tenant routing and a metered [`Transport`].

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod buffer;
pub mod client;
pub mod config;
pub mod constants;
pub mod entry;
pub mod errors;
pub mod metered;
pub mod metrics;
pub mod multi_tenant;
pub(crate) mod retry;
pub mod sorted;
pub mod tenant;
mod test_support;
pub mod transport;

pub use buffer::OverflowBuffer;
pub use client::{new_client, new_client_with_transport, LogClient, NewClientFn};
pub use config::{BufferConfig, ClientConfig, Config, OverflowPolicy, RetryPolicy, TransportConfig};
pub use entry::{LabelSet, LogEntry};
pub use errors::{ClientError, TransportError};
pub use metered::MeteredClient;
pub use metrics::{DropReason, Metrics};
pub use multi_tenant::MultiTenantClient;
pub use sorted::{SlotPhase, SortedClient, SortedClientConfig};
pub use tenant::RemoveTenantIdClient;
pub use transport::{NewTransportFn, PushTransport, Transport};
