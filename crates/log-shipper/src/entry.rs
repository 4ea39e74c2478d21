// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log entries and label sets as they travel through the pipeline.

use std::collections::BTreeMap;
use std::time::SystemTime;

use crate::errors::ClientError;

/// Labels identifying the stream an entry belongs to.
///
/// A `BTreeMap` keeps serialization deterministic, so two equal label sets
/// always produce the same stream key.
pub type LabelSet = BTreeMap<String, String>;

/// One labeled, timestamped log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub labels: LabelSet,
    pub timestamp: SystemTime,
    pub line: String,
}

impl LogEntry {
    #[must_use]
    pub fn new(labels: LabelSet, timestamp: SystemTime, line: String) -> Self {
        Self {
            labels,
            timestamp,
            line,
        }
    }

    /// Size accounted against batch limits.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.line.len()
    }

    /// Timestamp as unix nanoseconds. Pre-epoch timestamps clamp to zero.
    #[must_use]
    pub fn unix_nanos(&self) -> u128 {
        self.timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default()
    }
}

/// Checks that a label set can be shipped.
///
/// A valid set is non-empty and every name:
/// - starts with an ASCII letter or underscore
/// - contains only ASCII alphanumerics or underscores
pub fn validate_labels(labels: &LabelSet) -> Result<(), ClientError> {
    if labels.is_empty() {
        return Err(ClientError::InvalidEntry("label set is empty".to_string()));
    }

    for name in labels.keys() {
        let mut chars = name.chars();
        let valid_start = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if !valid_start || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ClientError::InvalidEntry(format!(
                "invalid label name '{name}'"
            )));
        }
    }

    Ok(())
}

/// Splits a multi-tenant label value into tenant ids.
///
/// Tenants are `;` separated; surrounding whitespace and empty items are
/// ignored.
#[must_use]
pub fn parse_tenants(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|tenant| !tenant.is_empty())
        .map(ToString::to_string)
        .collect()
}
