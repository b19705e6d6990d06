// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::path::Path;

use anyhow::Context;
use nodewarden_core::storage::{MemoryStore, SeedData};

/// Builds the record store, seeded from `path` when given.
pub async fn load_store(path: Option<&Path>) -> anyhow::Result<MemoryStore> {
    let Some(path) = path else {
        tracing::warn!("[service] no seed file, starting with an empty store");
        return Ok(MemoryStore::new());
    };

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading seed file {}", path.display()))?;
    let seed: SeedData = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing seed file {}", path.display()))?;

    tracing::info!(
        "[service] seeded {} environments, {} settings, {} nodes, {} queries",
        seed.environments.len(),
        seed.settings.len(),
        seed.nodes.len(),
        seed.queries.len()
    );
    Ok(MemoryStore::from_seed(seed))
}
