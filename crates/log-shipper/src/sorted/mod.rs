// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timestamp sorting stage.

mod batch;
mod client;

pub use client::{SlotPhase, SortedClient, SortedClientConfig};
