// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::time::Instant;

use crate::entry::LogEntry;

/// Entries accumulating under one batch id, kept in timestamp order.
#[derive(Debug)]
pub(crate) struct Batch {
    id: u64,
    entries: Vec<LogEntry>,
    bytes: usize,
    created_at: Option<Instant>,
}

impl Batch {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            entries: Vec::new(),
            bytes: 0,
            created_at: None,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts after every entry with a timestamp lower or equal, so equal
    /// timestamps keep their arrival order.
    pub(crate) fn add(&mut self, entry: LogEntry) {
        self.created_at.get_or_insert_with(Instant::now);
        self.bytes += entry.size_bytes();
        let position = self
            .entries
            .partition_point(|queued| queued.timestamp <= entry.timestamp);
        self.entries.insert(position, entry);
    }

    /// Whether adding `size` more bytes would push a non-empty batch past
    /// `limit`.
    pub(crate) fn would_exceed(&self, size: usize, limit: usize) -> bool {
        !self.is_empty() && self.bytes + size > limit
    }

    /// Whether the oldest entry has waited `batch_wait` or longer.
    pub(crate) fn is_due(&self, batch_wait: Duration) -> bool {
        self.created_at
            .is_some_and(|created| created.elapsed() >= batch_wait)
    }

    pub(crate) fn seal(self) -> SealedBatch {
        SealedBatch {
            id: self.id,
            entries: self.entries,
        }
    }
}

/// A batch that no longer accepts entries. Its order is final.
#[derive(Debug)]
pub(crate) struct SealedBatch {
    id: u64,
    entries: Vec<LogEntry>,
}

impl SealedBatch {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
