// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{QueryTransition, Store};
use crate::carves::CarvedFile;
use crate::environments::Environment;
use crate::errors::CoreError;
use crate::nodes::Node;
use crate::queries::{DistributedQuery, QueryFilter, QueryOutcome, QueryTally, QueryTarget};
use crate::settings::SettingRecord;

/// Initial records for a [`MemoryStore`], usually read from a JSON file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SeedData {
    pub environments: Vec<Environment>,
    pub settings: Vec<SettingRecord>,
    pub nodes: Vec<Node>,
    pub queries: Vec<SeedQuery>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SeedQuery {
    #[serde(flatten)]
    pub query: DistributedQuery,
    pub targets: Vec<QueryTarget>,
}

type NodeId = (String, String);

#[derive(Debug, Default)]
struct Tables {
    environments: BTreeMap<String, Environment>,
    settings: BTreeMap<(String, String), SettingRecord>,
    nodes: HashMap<NodeId, Node>,
    // (environment, node_key) -> node uuid
    node_keys: HashMap<(String, String), String>,
    queries: HashMap<String, (DistributedQuery, Vec<QueryTarget>)>,
    carves: HashMap<String, CarvedFile>,
    archives: HashMap<String, Vec<u8>>,
}

/// Process-local [`Store`] guarded by a single lock.
///
/// Used by tests and single-instance deployments. [`set_unavailable`] makes
/// every call fail with [`CoreError::StorageError`] to exercise outage paths.
///
/// [`set_unavailable`]: MemoryStore::set_unavailable
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: SeedData) -> Self {
        let store = Self::new();
        for environment in seed.environments {
            store.put_environment(environment);
        }
        for setting in seed.settings {
            store.put_setting(setting);
        }
        for node in seed.nodes {
            store.put_node(node);
        }
        {
            let mut tables = store.tables.write();
            for seeded in seed.queries {
                tables
                    .queries
                    .insert(seeded.query.name.clone(), (seeded.query, seeded.targets));
            }
        }
        store
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Inserts or replaces an environment (operator action).
    pub fn put_environment(&self, environment: Environment) {
        self.tables
            .write()
            .environments
            .insert(environment.uuid.clone(), environment);
    }

    /// Inserts or replaces a setting (operator action).
    pub fn put_setting(&self, record: SettingRecord) {
        self.tables
            .write()
            .settings
            .insert((record.service.clone(), record.name.clone()), record);
    }

    /// Inserts or replaces a node without going through enrollment.
    pub fn put_node(&self, node: Node) {
        let mut tables = self.tables.write();
        Self::write_node(&mut tables, node);
    }

    pub fn archive(&self, key: &str) -> Option<Vec<u8>> {
        self.tables.read().archives.get(key).cloned()
    }

    fn check(&self) -> Result<(), CoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoreError::StorageError("store unavailable".to_string()));
        }
        Ok(())
    }

    fn write_node(tables: &mut Tables, node: Node) {
        let id = (node.environment.clone(), node.uuid.clone());
        if let Some(previous) = tables.nodes.get(&id) {
            let stale = (previous.environment.clone(), previous.node_key.clone());
            tables.node_keys.remove(&stale);
        }
        tables.node_keys.insert(
            (node.environment.clone(), node.node_key.clone()),
            node.uuid.clone(),
        );
        tables.nodes.insert(id, node);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn environments(&self) -> Result<Vec<Environment>, CoreError> {
        self.check()?;
        Ok(self.tables.read().environments.values().cloned().collect())
    }

    async fn settings(&self) -> Result<Vec<SettingRecord>, CoreError> {
        self.check()?;
        Ok(self.tables.read().settings.values().cloned().collect())
    }

    async fn insert_setting_if_missing(&self, record: SettingRecord) -> Result<bool, CoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let key = (record.service.clone(), record.name.clone());
        if tables.settings.contains_key(&key) {
            return Ok(false);
        }
        tables.settings.insert(key, record);
        Ok(true)
    }

    async fn node_by_key(
        &self,
        environment: &str,
        node_key: &str,
    ) -> Result<Option<Node>, CoreError> {
        self.check()?;
        let tables = self.tables.read();
        let node = tables
            .node_keys
            .get(&(environment.to_string(), node_key.to_string()))
            .and_then(|uuid| tables.nodes.get(&(environment.to_string(), uuid.clone())))
            .cloned();
        Ok(node)
    }

    async fn node_by_uuid(&self, environment: &str, uuid: &str) -> Result<Option<Node>, CoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .nodes
            .get(&(environment.to_string(), uuid.to_string()))
            .cloned())
    }

    async fn nodes(&self) -> Result<Vec<Node>, CoreError> {
        self.check()?;
        Ok(self.tables.read().nodes.values().cloned().collect())
    }

    async fn insert_node(&self, node: Node) -> Result<(), CoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if tables
            .nodes
            .contains_key(&(node.environment.clone(), node.uuid.clone()))
        {
            return Err(CoreError::ValidationError(format!(
                "node {} already exists",
                node.uuid
            )));
        }
        Self::write_node(&mut tables, node);
        Ok(())
    }

    async fn update_node(&self, node: Node) -> Result<(), CoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if !tables
            .nodes
            .contains_key(&(node.environment.clone(), node.uuid.clone()))
        {
            return Err(CoreError::NotFound("node".to_string()));
        }
        Self::write_node(&mut tables, node);
        Ok(())
    }

    async fn touch_node(
        &self,
        environment: &str,
        uuid: &str,
        seen_at: DateTime<Utc>,
        ip: Option<String>,
    ) -> Result<(), CoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let node = tables
            .nodes
            .get_mut(&(environment.to_string(), uuid.to_string()))
            .ok_or_else(|| CoreError::NotFound("node".to_string()))?;
        node.last_seen = seen_at;
        if ip.is_some() {
            node.last_ip = ip;
        }
        Ok(())
    }

    async fn insert_query(
        &self,
        query: DistributedQuery,
        targets: Vec<QueryTarget>,
    ) -> Result<(), CoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        if tables.queries.contains_key(&query.name) {
            return Err(CoreError::ValidationError(format!(
                "query {} already exists",
                query.name
            )));
        }
        tables
            .queries
            .insert(query.name.clone(), (query, targets));
        Ok(())
    }

    async fn query(&self, name: &str) -> Result<Option<DistributedQuery>, CoreError> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .queries
            .get(name)
            .map(|(query, _)| query.clone()))
    }

    async fn queries(&self, filter: QueryFilter) -> Result<Vec<DistributedQuery>, CoreError> {
        self.check()?;
        let mut queries: Vec<DistributedQuery> = self
            .tables
            .read()
            .queries
            .values()
            .filter(|(query, _)| filter.matches(query))
            .map(|(query, _)| query.clone())
            .collect();
        queries.sort_by(|a, b| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        Ok(queries)
    }

    async fn open_queries(&self) -> Result<Vec<(DistributedQuery, Vec<QueryTarget>)>, CoreError> {
        self.check()?;
        let mut open: Vec<(DistributedQuery, Vec<QueryTarget>)> = self
            .tables
            .read()
            .queries
            .values()
            .filter(|(query, _)| query.is_open())
            .cloned()
            .collect();
        open.sort_by(|(a, _), (b, _)| (a.created_at, &a.name).cmp(&(b.created_at, &b.name)));
        Ok(open)
    }

    async fn tally_query(
        &self,
        name: &str,
        outcome: QueryOutcome,
    ) -> Result<QueryTally, CoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let (query, _) = tables
            .queries
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("query {name}")))?;

        match outcome {
            QueryOutcome::Success => query.executions += 1,
            QueryOutcome::Error => query.errors += 1,
        }

        let completed_now =
            !query.completed && !query.deleted && query.executions + query.errors >= query.expected;
        if completed_now {
            query.completed = true;
            query.active = false;
            query.completed_at = Some(Utc::now());
        }

        Ok(QueryTally {
            executions: query.executions,
            errors: query.errors,
            expected: query.expected,
            completed: query.completed,
            completed_now,
        })
    }

    async fn transition_query(
        &self,
        name: &str,
        transition: QueryTransition,
    ) -> Result<(), CoreError> {
        self.check()?;
        let mut tables = self.tables.write();
        let (query, _) = tables
            .queries
            .get_mut(name)
            .ok_or_else(|| CoreError::NotFound(format!("query {name}")))?;
        match transition {
            QueryTransition::Complete => {
                if !query.completed {
                    query.completed = true;
                    query.completed_at = Some(Utc::now());
                }
            }
            QueryTransition::Delete => query.deleted = true,
        }
        query.active = false;
        Ok(())
    }

    async fn upsert_carve(&self, carve: CarvedFile) -> Result<(), CoreError> {
        self.check()?;
        self.tables
            .write()
            .carves
            .insert(carve.session_id.clone(), carve);
        Ok(())
    }

    async fn carve(&self, session_id: &str) -> Result<Option<CarvedFile>, CoreError> {
        self.check()?;
        Ok(self.tables.read().carves.get(session_id).cloned())
    }

    async fn put_carve_archive(&self, key: &str, archive: Vec<u8>) -> Result<(), CoreError> {
        self.check()?;
        self.tables
            .write()
            .archives
            .insert(key.to_string(), archive);
        Ok(())
    }
}
