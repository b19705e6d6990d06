// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Destinations for reconstructed carve archives.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::CoreError;
use crate::storage::Store;

#[async_trait]
pub trait CarveBackend: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Persists `archive` under `key` and returns where it landed.
    async fn store(&self, key: &str, archive: Vec<u8>) -> Result<String, CoreError>;
}

/// Writes archives below a local directory as `{root}/{key}.tar`.
pub struct LocalCarver {
    root: PathBuf,
}

impl LocalCarver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, CoreError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(CoreError::ReconstructionError(format!(
                "invalid archive key: {key}"
            )));
        }
        Ok(self.root.join(format!("{key}.tar")))
    }
}

#[async_trait]
impl CarveBackend for LocalCarver {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn store(&self, key: &str, archive: Vec<u8>) -> Result<String, CoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::ReconstructionError(e.to_string()))?;
        }
        tokio::fs::write(&path, archive)
            .await
            .map_err(|e| CoreError::ReconstructionError(e.to_string()))?;
        Ok(path.display().to_string())
    }
}

/// Keeps archives as blobs in the record store.
pub struct DbCarver {
    store: Arc<dyn Store>,
}

impl DbCarver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CarveBackend for DbCarver {
    fn kind(&self) -> &'static str {
        "db"
    }

    async fn store(&self, key: &str, archive: Vec<u8>) -> Result<String, CoreError> {
        self.store
            .put_carve_archive(key, archive)
            .await
            .map_err(|e| CoreError::ReconstructionError(e.to_string()))?;
        Ok(format!("db://{key}"))
    }
}
