// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! File carving: chunked archive uploads from nodes.
//!
//! A node answers a carve query by calling init once, which opens a session,
//! and then sending every block of the archive in any order, possibly in
//! parallel. Sessions live in this process: each one sits behind its own async
//! mutex and tracks received sequence numbers in a bitset. The writer that
//! sets the last missing bit claims reconstruction while still holding the
//! lock, so the archive is assembled and handed to the [`CarveBackend`]
//! exactly once no matter how the blocks race.
//!
//! ```text
//! requested --first block--> in progress --last block--> completed
//!     |                           |              \-----> failed (backend)
//!     \----------- sweep ---------+--------------------> failed (expired)
//! ```

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_lc_rs::digest;
use chrono::{DateTime, TimeDelta, Utc};
use data_encoding::HEXLOWER;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::cache::Periodic;
use crate::carvers::CarveBackend;
use crate::constants::{GZIP_MAGIC, MAX_CARVE_BLOCKS, MAX_INFLATED_CARVE_SIZE};
use crate::errors::CoreError;
use crate::nodes::Node;
use crate::queries::QueryType;
use crate::settings::SettingsCache;
use crate::storage::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CarveStatus {
    #[serde(rename = "requested")]
    Requested,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

impl CarveStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Persisted view of a carve session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarvedFile {
    pub session_id: String,
    pub carve_id: String,
    /// Name of the carve query being answered.
    pub request_id: String,
    /// Node uuid.
    pub node: String,
    /// Environment uuid.
    pub environment: String,
    pub path: String,
    pub total_blocks: u32,
    pub block_size: u64,
    pub total_size: u64,
    pub status: CarveStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub received_blocks: u32,
    #[serde(default)]
    pub archive_location: Option<String>,
    #[serde(default)]
    pub archive_sha256: Option<String>,
    #[serde(default)]
    pub failure: Option<String>,
}

impl CarvedFile {
    /// Backend key of the reconstructed archive.
    pub fn archive_key(&self) -> String {
        format!("{}/{}/{}", self.environment, self.node, self.session_id)
    }
}

/// What a node announces when it starts a carve. Counts are taken as signed
/// so that negative wire values are rejected instead of wrapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarveInit {
    pub carve_id: String,
    pub request_id: String,
    pub block_count: i64,
    pub block_size: i64,
    pub carve_size: i64,
    /// Used when the request does not name a carve query with a path.
    pub path: Option<String>,
}

/// Fixed-size set of received block sequence numbers.
#[derive(Debug, Clone)]
pub struct BlockTracker {
    words: Vec<u64>,
    total: u32,
    received: u32,
}

impl BlockTracker {
    pub fn new(total: u32) -> Self {
        let words = usize::try_from(total.div_ceil(64)).unwrap_or_default();
        Self {
            words: vec![0; words],
            total,
            received: 0,
        }
    }

    /// Marks `seq` received. Returns `false` if it already was.
    pub fn insert(&mut self, seq: u32) -> bool {
        let Some(word) = self.words.get_mut((seq / 64) as usize) else {
            return false;
        };
        let bit = 1u64 << (seq % 64);
        if *word & bit != 0 {
            return false;
        }
        *word |= bit;
        self.received += 1;
        true
    }

    pub fn contains(&self, seq: u32) -> bool {
        self.words
            .get((seq / 64) as usize)
            .is_some_and(|word| word & (1u64 << (seq % 64)) != 0)
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }
}

/// Result of an accepted block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    Pending {
        /// Uuid of the node uploading the carve.
        node: String,
        received: u32,
        total: u32,
    },
    Completed(CarvedFile),
}

impl BlockOutcome {
    /// Uuid of the node the block came from.
    pub fn node(&self) -> &str {
        match self {
            Self::Pending { node, .. } => node,
            Self::Completed(file) => &file.node,
        }
    }
}

struct CarveSession {
    file: CarvedFile,
    tracker: BlockTracker,
    blocks: BTreeMap<u32, Vec<u8>>,
    /// Sum of the stored block lengths.
    bytes: u64,
    assembling: bool,
}

type SessionMap = HashMap<String, Arc<tokio::sync::Mutex<CarveSession>>>;

pub struct CarveEngine {
    store: Arc<dyn Store>,
    backend: Arc<dyn CarveBackend>,
    decompress: bool,
    inflate_limit: u64,
    sessions: parking_lot::Mutex<SessionMap>,
}

impl CarveEngine {
    pub fn new(store: Arc<dyn Store>, backend: Arc<dyn CarveBackend>, decompress: bool) -> Self {
        Self {
            store,
            backend,
            decompress,
            inflate_limit: MAX_INFLATED_CARVE_SIZE,
            sessions: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Largest archive a gzip upload may inflate to before the session fails.
    pub fn with_inflate_limit(mut self, limit: u64) -> Self {
        self.inflate_limit = limit;
        self
    }

    /// Opens a session for `node` and returns it in `requested` state.
    #[tracing::instrument(
        skip(self, node, init),
        fields(node = %node.uuid, request = %init.request_id)
    )]
    pub async fn init_carve(&self, node: &Node, init: CarveInit) -> Result<CarvedFile, CoreError> {
        let total_blocks = u32::try_from(init.block_count)
            .ok()
            .filter(|n| (1..=MAX_CARVE_BLOCKS).contains(n))
            .ok_or_else(|| {
                CoreError::ValidationError(format!("invalid block count {}", init.block_count))
            })?;
        let block_size = u64::try_from(init.block_size)
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| {
                CoreError::ValidationError(format!("invalid block size {}", init.block_size))
            })?;
        let total_size = u64::try_from(init.carve_size).map_err(|_| {
            CoreError::ValidationError(format!("invalid carve size {}", init.carve_size))
        })?;

        let path = match self.store.query(&init.request_id).await? {
            Some(query) if query.query_type == QueryType::Carve => query.path,
            _ => None,
        }
        .or(init.path)
        .unwrap_or_default();

        let file = CarvedFile {
            session_id: uuid::Uuid::new_v4().to_string(),
            carve_id: init.carve_id,
            request_id: init.request_id,
            node: node.uuid.clone(),
            environment: node.environment.clone(),
            path,
            total_blocks,
            block_size,
            total_size,
            status: CarveStatus::Requested,
            started_at: Utc::now(),
            completed_at: None,
            received_blocks: 0,
            archive_location: None,
            archive_sha256: None,
            failure: None,
        };

        self.store.upsert_carve(file.clone()).await?;

        let session = CarveSession {
            file: file.clone(),
            tracker: BlockTracker::new(total_blocks),
            blocks: BTreeMap::new(),
            bytes: 0,
            assembling: false,
        };
        self.sessions
            .lock()
            .insert(file.session_id.clone(), Arc::new(tokio::sync::Mutex::new(session)));

        tracing::info!(
            "[core] carve session {} opened for {} blocks",
            file.session_id,
            file.total_blocks
        );
        Ok(file)
    }

    /// Stores one block. The call that supplies the last missing block
    /// reconstructs the archive and returns [`BlockOutcome::Completed`].
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotFound`] - no live session with that id
    /// - [`CoreError::ValidationError`] - environment or request mismatch, `seq`
    ///   out of range, a block larger than announced, more bytes than the
    ///   announced carve size, or the session is failed or being assembled
    /// - [`CoreError::ReconstructionError`] - the archive could not be rebuilt or
    ///   stored; the session is now failed
    /// - [`CoreError::StorageError`] - the session record could not be written.
    ///   A completed archive stays claimed and a retried block records it.
    pub async fn write_block(
        &self,
        environment: &str,
        session_id: &str,
        request_id: &str,
        seq: i64,
        payload: Vec<u8>,
    ) -> Result<BlockOutcome, CoreError> {
        let session = self
            .sessions
            .lock()
            .get(session_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("carve session {session_id}")))?;

        let mut guard = session.lock().await;

        if guard.file.environment != environment || guard.file.request_id != request_id {
            return Err(CoreError::ValidationError(
                "carve session does not match request".to_string(),
            ));
        }
        if guard.file.status == CarveStatus::Completed {
            // archive already stored, only the record is missing
            let file = guard.file.clone();
            self.store.upsert_carve(file.clone()).await?;
            drop(guard);
            self.sessions.lock().remove(session_id);
            tracing::info!("[core] carve session {} recorded on retry", session_id);
            return Ok(BlockOutcome::Completed(file));
        }
        if guard.file.status.is_terminal() || guard.assembling {
            return Err(CoreError::ValidationError(format!(
                "carve session {session_id} no longer accepts blocks"
            )));
        }
        let seq = u32::try_from(seq)
            .ok()
            .filter(|s| *s < guard.file.total_blocks)
            .ok_or_else(|| CoreError::ValidationError(format!("block {seq} out of range")))?;

        let len = payload.len() as u64;
        if len > guard.file.block_size {
            return Err(CoreError::ValidationError(format!(
                "block {seq} has {len} bytes, block size is {}",
                guard.file.block_size
            )));
        }
        let replaced = guard.blocks.get(&seq).map_or(0, |b| b.len() as u64);
        let bytes = guard.bytes.saturating_sub(replaced).saturating_add(len);
        if bytes > guard.file.total_size {
            return Err(CoreError::ValidationError(format!(
                "carve {session_id} exceeds its size of {} bytes",
                guard.file.total_size
            )));
        }

        if !guard.tracker.insert(seq) {
            tracing::debug!("[core] carve {} block {} received again", session_id, seq);
        }
        guard.blocks.insert(seq, payload);
        guard.bytes = bytes;
        guard.file.received_blocks = guard.tracker.received();
        if guard.file.status == CarveStatus::Requested {
            guard.file.status = CarveStatus::InProgress;
        }

        if !guard.tracker.is_complete() {
            self.store.upsert_carve(guard.file.clone()).await?;
            return Ok(BlockOutcome::Pending {
                node: guard.file.node.clone(),
                received: guard.file.received_blocks,
                total: guard.file.total_blocks,
            });
        }

        // claimed: later writers see `assembling` and are turned away
        guard.assembling = true;
        let blocks = std::mem::take(&mut guard.blocks);
        let file = guard.file.clone();
        drop(guard);

        let stored = self.reconstruct(&file, blocks).await;

        let mut guard = session.lock().await;
        guard.assembling = false;
        match stored {
            Ok((location, sha256)) => {
                guard.file.status = CarveStatus::Completed;
                guard.file.completed_at = Some(Utc::now());
                guard.file.archive_location = Some(location);
                guard.file.archive_sha256 = Some(sha256);
                let file = guard.file.clone();
                // on error the completed session stays live until recorded
                self.store.upsert_carve(file.clone()).await?;
                drop(guard);

                self.sessions.lock().remove(session_id);
                tracing::info!(
                    "[core] carve session {} completed: {:?}",
                    session_id,
                    file.archive_location
                );
                Ok(BlockOutcome::Completed(file))
            }
            Err(e) => {
                guard.file.status = CarveStatus::Failed;
                guard.file.failure = Some(e.to_string());
                let file = guard.file.clone();
                drop(guard);

                tracing::error!("[core] carve session {} failed: {}", session_id, e);
                if let Err(store_err) = self.store.upsert_carve(file).await {
                    tracing::warn!("[core] unable to record carve failure: {}", store_err);
                }
                Err(e)
            }
        }
    }

    async fn reconstruct(
        &self,
        file: &CarvedFile,
        blocks: BTreeMap<u32, Vec<u8>>,
    ) -> Result<(String, String), CoreError> {
        let decompress = self.decompress.then_some(self.inflate_limit);
        let (archive, sha256) = tokio::task::spawn_blocking(move || assemble(blocks, decompress))
            .await
            .map_err(|e| CoreError::ReconstructionError(e.to_string()))??;

        let location = self
            .backend
            .store(&file.archive_key(), archive)
            .await
            .map_err(|e| match e {
                CoreError::ReconstructionError(_) => e,
                other => CoreError::ReconstructionError(other.to_string()),
            })?;
        Ok((location, sha256))
    }

    /// Fails every open session started more than `timeout` before `now` and
    /// forgets terminal sessions once their record is written. Returns how
    /// many sessions expired in this pass.
    ///
    /// A session whose record cannot be written stays live and is written
    /// again on the next pass.
    pub async fn sweep(&self, now: DateTime<Utc>, timeout: Duration) -> usize {
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
        let sessions: Vec<(String, Arc<tokio::sync::Mutex<CarveSession>>)> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();

        let mut expired = 0;
        for (id, session) in sessions {
            let mut guard = session.lock().await;
            if guard.assembling {
                continue;
            }
            let stale = now.signed_duration_since(guard.file.started_at) > timeout;

            match guard.file.status {
                CarveStatus::Completed => {}
                CarveStatus::Failed if stale => {}
                CarveStatus::Requested | CarveStatus::InProgress if stale => {
                    guard.file.status = CarveStatus::Failed;
                    guard.file.failure = Some("expired".to_string());
                    guard.blocks.clear();
                    guard.bytes = 0;
                    tracing::info!("[core] carve session {} expired", id);
                    expired += 1;
                }
                _ => continue,
            }

            if let Err(e) = self.store.upsert_carve(guard.file.clone()).await {
                tracing::warn!("[core] unable to record carve session {}: {}", id, e);
                continue;
            }
            drop(guard);
            self.sessions.lock().remove(&id);
        }
        expired
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Concatenates blocks in sequence order. With `inflate_limit` set, a gzip
/// archive is inflated up to that many bytes.
fn assemble(
    blocks: BTreeMap<u32, Vec<u8>>,
    inflate_limit: Option<u64>,
) -> Result<(Vec<u8>, String), CoreError> {
    let size = blocks.values().map(Vec::len).sum();
    let mut archive = Vec::with_capacity(size);
    for block in blocks.into_values() {
        archive.extend_from_slice(&block);
    }

    let limit = inflate_limit.filter(|_| archive.starts_with(&GZIP_MAGIC));
    if let Some(limit) = limit {
        let mut inflated = Vec::new();
        GzDecoder::new(archive.as_slice())
            .take(limit.saturating_add(1))
            .read_to_end(&mut inflated)
            .map_err(|e| CoreError::ReconstructionError(format!("gunzip: {e}")))?;
        if inflated.len() as u64 > limit {
            return Err(CoreError::ReconstructionError(format!(
                "archive inflates past {limit} bytes"
            )));
        }
        archive = inflated;
    }

    let sha256 = HEXLOWER.encode(digest::digest(&digest::SHA256, &archive).as_ref());
    Ok((archive, sha256))
}

/// Runs [`CarveEngine::sweep`] on the `carve_sweep` interval.
pub struct CarveSweeper {
    engine: Arc<CarveEngine>,
    settings: Arc<SettingsCache>,
}

impl CarveSweeper {
    pub fn new(engine: Arc<CarveEngine>, settings: Arc<SettingsCache>) -> Self {
        Self { engine, settings }
    }
}

#[async_trait]
impl Periodic for CarveSweeper {
    fn name(&self) -> &'static str {
        "carve sweep"
    }

    fn interval(&self) -> Duration {
        self.settings.carve_sweep_interval()
    }

    async fn run_once(&self) -> Result<(), CoreError> {
        let expired = self
            .engine
            .sweep(Utc::now(), self.settings.carve_expiration())
            .await;
        if expired > 0 {
            tracing::info!("[core] expired {} carve sessions", expired);
        }
        Ok(())
    }
}
