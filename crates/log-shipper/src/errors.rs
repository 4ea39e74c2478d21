// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised by a [`crate::transport::Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The send queue is at capacity. The entry was not accepted and may be
    /// submitted again later.
    #[error("transport queue is full")]
    Full,

    #[error("transport is stopped")]
    Closed,

    #[error("invalid push url '{0}'")]
    InvalidUrl(String),

    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Errors returned by [`crate::client::LogClient`] implementations and the
/// pipeline constructors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to create transport: {0}")]
    Construction(#[source] TransportError),

    #[error("Invalid log entry: {0}")]
    InvalidEntry(String),

    #[error("Failed to submit log entry: {0}")]
    Submit(#[source] TransportError),

    /// Some tenant copies of an entry were accepted, the listed ones never
    /// were. Not retryable: sending the entry again would duplicate the
    /// accepted copies.
    #[error("Failed to deliver entry to tenants {failed:?}: {source}")]
    PartialDelivery {
        failed: Vec<String>,
        #[source]
        source: Box<ClientError>,
    },

    #[error("Client is stopped")]
    Stopped,
}

impl ClientError {
    /// Whether delivering the same entry again may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Submit(TransportError::Full))
    }
}
