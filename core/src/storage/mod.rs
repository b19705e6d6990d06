// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! The storage capability the engine depends on.
//!
//! The backing store is a transactional record store addressed by primary key
//! and simple filters. Two operations carry atomicity requirements beyond a
//! plain read or write:
//!
//! - [`Store::tally_query`] increments a counter and decides completion in one
//!   step, so exactly one caller observes `completed_now`
//! - [`Store::insert_setting_if_missing`] never overwrites an existing value
//!
//! Everything else is per-row read-modify-write with last-writer-wins.

mod memory;

pub use memory::{MemoryStore, SeedData};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::carves::CarvedFile;
use crate::environments::Environment;
use crate::errors::CoreError;
use crate::nodes::Node;
use crate::queries::{DistributedQuery, QueryFilter, QueryOutcome, QueryTally, QueryTarget};
use crate::settings::SettingRecord;

/// Operator-driven terminal transitions of a distributed query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTransition {
    Complete,
    Delete,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Environments and settings
    async fn environments(&self) -> Result<Vec<Environment>, CoreError>;
    async fn settings(&self) -> Result<Vec<SettingRecord>, CoreError>;
    /// Returns `true` when the record was inserted.
    async fn insert_setting_if_missing(&self, record: SettingRecord) -> Result<bool, CoreError>;

    // Nodes
    async fn node_by_key(&self, environment: &str, node_key: &str)
    -> Result<Option<Node>, CoreError>;
    async fn node_by_uuid(&self, environment: &str, uuid: &str) -> Result<Option<Node>, CoreError>;
    async fn nodes(&self) -> Result<Vec<Node>, CoreError>;
    async fn insert_node(&self, node: Node) -> Result<(), CoreError>;
    async fn update_node(&self, node: Node) -> Result<(), CoreError>;
    async fn touch_node(
        &self,
        environment: &str,
        uuid: &str,
        seen_at: DateTime<Utc>,
        ip: Option<String>,
    ) -> Result<(), CoreError>;

    // Distributed queries
    async fn insert_query(
        &self,
        query: DistributedQuery,
        targets: Vec<QueryTarget>,
    ) -> Result<(), CoreError>;
    async fn query(&self, name: &str) -> Result<Option<DistributedQuery>, CoreError>;
    async fn queries(&self, filter: QueryFilter) -> Result<Vec<DistributedQuery>, CoreError>;
    /// Active, not completed, not deleted queries with their targets, oldest first.
    async fn open_queries(&self) -> Result<Vec<(DistributedQuery, Vec<QueryTarget>)>, CoreError>;
    async fn tally_query(&self, name: &str, outcome: QueryOutcome)
    -> Result<QueryTally, CoreError>;
    async fn transition_query(
        &self,
        name: &str,
        transition: QueryTransition,
    ) -> Result<(), CoreError>;

    // Carves
    async fn upsert_carve(&self, carve: CarvedFile) -> Result<(), CoreError>;
    async fn carve(&self, session_id: &str) -> Result<Option<CarvedFile>, CoreError>;
    async fn put_carve_archive(&self, key: &str, archive: Vec<u8>) -> Result<(), CoreError>;
}
