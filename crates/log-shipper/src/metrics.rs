// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Prometheus counters produced by the pipeline.
//!
//! [`Metrics`] registers into a caller-provided [`Registry`] and is handed to
//! every stage that counts something, so no stage reaches for a global
//! registry.

use prometheus::{IntCounterVec, Opts, Registry};

/// Why an entry left the pipeline without reaching the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The entry already carried the reserved tenant label.
    ReservedLabel,
    /// Discarded by the overflow buffer in drop-oldest mode.
    Overflow,
    /// The transport stayed saturated through every retry.
    RetriesExhausted,
    /// The downstream stage refused the entry for good.
    Rejected,
    /// Still queued when the pipeline was stopped without waiting.
    Shutdown,
}

impl DropReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DropReason::ReservedLabel => "reserved_label",
            DropReason::Overflow => "overflow",
            DropReason::RetriesExhausted => "retries_exhausted",
            DropReason::Rejected => "rejected",
            DropReason::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Metrics {
    /// Entries accepted by the transport, by destination host.
    pub forwarded_logs: IntCounterVec,
    /// Entries dropped by policy, by reason.
    pub dropped_logs: IntCounterVec,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let forwarded_logs = IntCounterVec::new(
            Opts::new(
                "log_shipper_forwarded_logs_total",
                "Log entries handed to the transport",
            ),
            &["host"],
        )?;
        let dropped_logs = IntCounterVec::new(
            Opts::new(
                "log_shipper_dropped_logs_total",
                "Log entries dropped before reaching the transport",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(forwarded_logs.clone()))?;
        registry.register(Box::new(dropped_logs.clone()))?;

        Ok(Self {
            forwarded_logs,
            dropped_logs,
        })
    }

    pub fn inc_forwarded(&self, host: &str) {
        self.forwarded_logs.with_label_values(&[host]).inc();
    }

    pub fn inc_dropped(&self, reason: DropReason, count: u64) {
        if count > 0 {
            self.dropped_logs
                .with_label_values(&[reason.as_str()])
                .inc_by(count);
        }
    }

    #[must_use]
    pub fn forwarded(&self, host: &str) -> u64 {
        self.forwarded_logs.with_label_values(&[host]).get()
    }

    #[must_use]
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped_logs.with_label_values(&[reason.as_str()]).get()
    }
}
