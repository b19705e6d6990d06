// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Distributed (on-demand) query lifecycle.
//!
//! # Delivery and counting
//!
//! Delivery and result counting are at-least-once:
//!
//! - [`QueryCoordinator::pending_for`] is recomputed on every read and keeps
//!   returning a query to a node that already answered it, until the query is
//!   completed or deleted
//! - [`QueryCoordinator::submit_result`] counts every submission, duplicates
//!   included
//!
//! The completion transition itself is exactly-once: the store increments and
//! compares in one atomic step and reports which call flipped `completed`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::environments::Environment;
use crate::errors::CoreError;
use crate::logging::{LogKind, Logger};
use crate::nodes::Node;
use crate::storage::{QueryTransition, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    #[default]
    Query,
    Carve,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedQuery {
    pub name: String,
    pub query: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default)]
    pub query_type: QueryType,
    /// Path pattern for carve queries.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expected: u64,
    #[serde(default)]
    pub executions: u64,
    #[serde(default)]
    pub errors: u64,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl DistributedQuery {
    /// Still deliverable to nodes.
    pub fn is_open(&self) -> bool {
        self.active && !self.completed && !self.deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    All,
    Environment,
    Platform,
    Uuid,
    Localname,
    Tag,
}

/// One selector attached to a query. A query matches a node when any of its
/// selectors does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTarget {
    pub kind: TargetKind,
    #[serde(default)]
    pub value: String,
}

impl QueryTarget {
    pub fn new(kind: TargetKind, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }

    pub fn matches(&self, node: &Node) -> bool {
        match self.kind {
            TargetKind::All => true,
            TargetKind::Environment => node.environment == self.value,
            TargetKind::Platform => node.platform.eq_ignore_ascii_case(&self.value),
            TargetKind::Uuid => node.uuid.eq_ignore_ascii_case(&self.value),
            TargetKind::Localname => {
                node.localname == self.value || node.hostname == self.value
            }
            TargetKind::Tag => node.tags.iter().any(|t| *t == self.value),
        }
    }
}

fn matches_any(targets: &[QueryTarget], node: &Node) -> bool {
    targets.iter().any(|t| t.matches(node))
}

/// Listing filter for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryFilter {
    #[default]
    All,
    Active,
    Completed,
    Deleted,
}

impl QueryFilter {
    pub fn matches(&self, query: &DistributedQuery) -> bool {
        match self {
            Self::All => true,
            Self::Active => query.is_open(),
            Self::Completed => query.completed && !query.deleted,
            Self::Deleted => query.deleted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOutcome {
    Success,
    Error,
}

/// Counters after one atomic increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryTally {
    pub executions: u64,
    pub errors: u64,
    pub expected: u64,
    pub completed: bool,
    /// `true` only for the increment that flipped `completed`.
    pub completed_now: bool,
}

/// Operator input for a new query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQuery {
    pub name: String,
    pub query: String,
    pub creator: String,
    pub query_type: QueryType,
    pub path: Option<String>,
}

/// One node's answer to one query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Agent execution status, non-zero means the query failed on the node.
    pub status: i64,
    pub message: Option<String>,
    pub rows: Value,
}

impl QueryResult {
    pub fn outcome(&self) -> QueryOutcome {
        if self.status == 0 {
            QueryOutcome::Success
        } else {
            QueryOutcome::Error
        }
    }
}

pub struct QueryCoordinator {
    store: Arc<dyn Store>,
    logger: Arc<dyn Logger>,
}

impl QueryCoordinator {
    pub fn new(store: Arc<dyn Store>, logger: Arc<dyn Logger>) -> Self {
        Self { store, logger }
    }

    /// Creates a query and fixes its expected count against the current node
    /// population. The count is never recomputed.
    #[tracing::instrument(skip(self, new, targets), fields(name = %new.name))]
    pub async fn create(
        &self,
        new: NewQuery,
        targets: Vec<QueryTarget>,
    ) -> Result<DistributedQuery, CoreError> {
        if new.name.trim().is_empty() || new.query.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "query name and text are required".to_string(),
            ));
        }
        if targets.is_empty() {
            return Err(CoreError::ValidationError(
                "at least one target is required".to_string(),
            ));
        }
        if new.query_type == QueryType::Carve && new.path.as_deref().unwrap_or("").is_empty() {
            return Err(CoreError::ValidationError(
                "carve queries need a path".to_string(),
            ));
        }

        let nodes = self.store.nodes().await?;
        let expected = nodes.iter().filter(|n| matches_any(&targets, n)).count();

        let query = DistributedQuery {
            name: new.name,
            query: new.query,
            creator: new.creator,
            query_type: new.query_type,
            path: new.path,
            expected: u64::try_from(expected).unwrap_or(u64::MAX),
            executions: 0,
            errors: 0,
            active: true,
            completed: false,
            deleted: false,
            created_at: Utc::now(),
            completed_at: None,
        };

        self.store.insert_query(query.clone(), targets).await?;
        tracing::info!(
            "[core] created query {} expecting {} nodes",
            query.name,
            query.expected
        );
        Ok(query)
    }

    pub async fn get(&self, name: &str) -> Result<DistributedQuery, CoreError> {
        self.store
            .query(name)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("query {name}")))
    }

    /// Open queries targeting `node`, oldest first.
    pub async fn pending_for(
        &self,
        node: &Node,
    ) -> Result<impl Iterator<Item = DistributedQuery>, CoreError> {
        let open = self.store.open_queries().await?;
        Ok(open
            .into_iter()
            .filter(move |(_, targets)| matches_any(targets, node))
            .map(|(query, _)| query))
    }

    /// Logs a node's result and counts it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::ValidationError`] - no query with that name
    /// - [`CoreError::LoggerError`] / [`CoreError::StorageError`] - transient
    #[tracing::instrument(skip(self, environment, node, result), fields(node = %node.uuid))]
    pub async fn submit_result(
        &self,
        environment: &Environment,
        node: &Node,
        name: &str,
        result: QueryResult,
    ) -> Result<QueryTally, CoreError> {
        if self.store.query(name).await?.is_none() {
            return Err(CoreError::ValidationError(format!("unknown query {name}")));
        }

        let outcome = result.outcome();
        let payload = json!({
            "name": name,
            "node": node.uuid,
            "hostname": node.hostname,
            "status": result.status,
            "message": result.message,
            "rows": result.rows,
        });
        self.logger
            .submit(LogKind::Query, &environment.name, &payload)
            .await?;

        let tally = self.store.tally_query(name, outcome).await?;

        if tally.completed_now {
            tracing::info!(
                "[core] query {} completed with {} executions and {} errors",
                name,
                tally.executions,
                tally.errors
            );
            let completion = json!({
                "name": name,
                "expected": tally.expected,
                "executions": tally.executions,
                "errors": tally.errors,
            });
            if let Err(e) = self
                .logger
                .submit(LogKind::Completion, &environment.name, &completion)
                .await
            {
                // the transition already happened, only the notice is lost
                tracing::warn!("[core] failed to log completion of {}: {}", name, e);
            }
        }

        Ok(tally)
    }

    /// Marks a query completed (operator action).
    pub async fn complete(&self, name: &str) -> Result<(), CoreError> {
        self.store
            .transition_query(name, QueryTransition::Complete)
            .await
    }

    /// Marks a query deleted (operator action). Deleted queries are never delivered.
    pub async fn delete(&self, name: &str) -> Result<(), CoreError> {
        self.store
            .transition_query(name, QueryTransition::Delete)
            .await
    }

    pub async fn list(&self, filter: QueryFilter) -> Result<Vec<DistributedQuery>, CoreError> {
        self.store.queries(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::tests::environment;
    use crate::logging::tests::RecordingLogger;
    use crate::nodes::tests::node;
    use crate::storage::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        logger: Arc<RecordingLogger>,
        coordinator: QueryCoordinator,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let logger = Arc::new(RecordingLogger::default());
        let coordinator = QueryCoordinator::new(store.clone(), logger.clone());
        Fixture {
            store,
            logger,
            coordinator,
        }
    }

    fn new_query(name: &str) -> NewQuery {
        NewQuery {
            name: name.to_string(),
            query: "SELECT * FROM osquery_info;".to_string(),
            creator: "admin".to_string(),
            query_type: QueryType::Query,
            path: None,
        }
    }

    fn ok_result() -> QueryResult {
        QueryResult {
            status: 0,
            message: None,
            rows: json!([{"version": "5.12.1"}]),
        }
    }

    #[test]
    fn test_target_matching() {
        let mut n = node("env-1", "HOST-1", "k");
        n.tags = vec!["web".to_string()];

        assert!(QueryTarget::new(TargetKind::All, "").matches(&n));
        assert!(QueryTarget::new(TargetKind::Uuid, "host-1").matches(&n));
        assert!(QueryTarget::new(TargetKind::Platform, "Ubuntu").matches(&n));
        assert!(QueryTarget::new(TargetKind::Tag, "web").matches(&n));
        assert!(QueryTarget::new(TargetKind::Environment, "env-1").matches(&n));
        assert!(QueryTarget::new(TargetKind::Localname, "host-1").matches(&n));
        assert!(!QueryTarget::new(TargetKind::Tag, "db").matches(&n));
        assert!(!QueryTarget::new(TargetKind::Platform, "windows").matches(&n));
    }

    #[tokio::test]
    async fn test_expected_fixed_at_creation() {
        let f = fixture();
        f.store.put_node(node("env-1", "HOST-1", "k1"));
        f.store.put_node(node("env-1", "HOST-2", "k2"));

        let query = f
            .coordinator
            .create(
                new_query("q1"),
                vec![QueryTarget::new(TargetKind::Uuid, "HOST-1")],
            )
            .await
            .unwrap();
        assert_eq!(query.expected, 1);

        f.store.put_node(node("env-1", "HOST-3", "k3"));
        assert_eq!(f.coordinator.get("q1").await.unwrap().expected, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_empty_targets() {
        let f = fixture();
        let all = vec![QueryTarget::new(TargetKind::All, "")];
        f.coordinator.create(new_query("q1"), all.clone()).await.unwrap();

        assert!(matches!(
            f.coordinator.create(new_query("q1"), all).await,
            Err(CoreError::ValidationError(_))
        ));
        assert!(matches!(
            f.coordinator.create(new_query("q2"), vec![]).await,
            Err(CoreError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_pending_for_filters_and_orders() {
        let f = fixture();
        let n = node("env-1", "HOST-1", "k1");
        f.store.put_node(n.clone());

        f.coordinator
            .create(new_query("first"), vec![QueryTarget::new(TargetKind::All, "")])
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.coordinator
            .create(
                new_query("second"),
                vec![QueryTarget::new(TargetKind::Platform, "ubuntu")],
            )
            .await
            .unwrap();
        f.coordinator
            .create(
                new_query("other"),
                vec![QueryTarget::new(TargetKind::Uuid, "HOST-9")],
            )
            .await
            .unwrap();
        f.coordinator
            .create(new_query("gone"), vec![QueryTarget::new(TargetKind::All, "")])
            .await
            .unwrap();
        f.coordinator.delete("gone").await.unwrap();

        let names: Vec<String> = f
            .coordinator
            .pending_for(&n)
            .await
            .unwrap()
            .map(|q| q.name)
            .collect();
        assert_eq!(names, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn test_pending_redelivered_after_answer() {
        let f = fixture();
        let env = environment("env-1", "prod");
        let n1 = node("env-1", "HOST-1", "k1");
        f.store.put_node(n1.clone());
        f.store.put_node(node("env-1", "HOST-2", "k2"));
        f.coordinator
            .create(new_query("q1"), vec![QueryTarget::new(TargetKind::All, "")])
            .await
            .unwrap();

        f.coordinator
            .submit_result(&env, &n1, "q1", ok_result())
            .await
            .unwrap();

        assert_eq!(f.coordinator.pending_for(&n1).await.unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_completion_fires_once() {
        let f = fixture();
        let env = environment("env-1", "prod");
        for i in 0..3 {
            f.store
                .put_node(node("env-1", &format!("HOST-{i}"), &format!("k{i}")));
        }
        f.coordinator
            .create(new_query("q1"), vec![QueryTarget::new(TargetKind::All, "")])
            .await
            .unwrap();

        let n = node("env-1", "HOST-0", "k0");
        let first = f.coordinator.submit_result(&env, &n, "q1", ok_result()).await.unwrap();
        assert!(!first.completed);
        let second = f
            .coordinator
            .submit_result(
                &env,
                &n,
                "q1",
                QueryResult {
                    status: 1,
                    message: Some("no such table".to_string()),
                    rows: Value::Null,
                },
            )
            .await
            .unwrap();
        assert!(!second.completed);
        assert_eq!(second.errors, 1);

        let third = f.coordinator.submit_result(&env, &n, "q1", ok_result()).await.unwrap();
        assert!(third.completed);
        assert!(third.completed_now);

        let fourth = f.coordinator.submit_result(&env, &n, "q1", ok_result()).await.unwrap();
        assert!(fourth.completed);
        assert!(!fourth.completed_now);
        assert_eq!(fourth.executions, 3);
        assert_eq!(fourth.errors, 1);

        assert_eq!(f.logger.count(LogKind::Query), 4);
        assert_eq!(f.logger.count(LogKind::Completion), 1);
        assert_eq!(f.coordinator.pending_for(&n).await.unwrap().count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_complete_once() {
        let f = fixture();
        let env = Arc::new(environment("env-1", "prod"));
        for i in 0..8 {
            f.store
                .put_node(node("env-1", &format!("HOST-{i}"), &format!("k{i}")));
        }
        f.coordinator
            .create(new_query("q1"), vec![QueryTarget::new(TargetKind::All, "")])
            .await
            .unwrap();

        let coordinator = Arc::new(f.coordinator);
        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = coordinator.clone();
            let env = env.clone();
            handles.push(tokio::spawn(async move {
                let n = node("env-1", &format!("HOST-{}", i % 8), "k");
                coordinator
                    .submit_result(&env, &n, "q1", ok_result())
                    .await
                    .unwrap()
            }));
        }

        let mut flipped = 0;
        for handle in handles {
            if handle.await.unwrap().completed_now {
                flipped += 1;
            }
        }

        assert_eq!(flipped, 1);
        assert_eq!(f.logger.count(LogKind::Completion), 1);
        assert_eq!(coordinator.get("q1").await.unwrap().executions, 16);
    }

    #[tokio::test]
    async fn test_submit_unknown_query() {
        let f = fixture();
        let env = environment("env-1", "prod");
        let n = node("env-1", "HOST-1", "k1");
        assert!(matches!(
            f.coordinator.submit_result(&env, &n, "missing", ok_result()).await,
            Err(CoreError::ValidationError(_))
        ));
        assert_eq!(f.logger.count(LogKind::Query), 0);
    }

    #[tokio::test]
    async fn test_list_filters() {
        let f = fixture();
        let all = vec![QueryTarget::new(TargetKind::All, "")];
        for name in ["a", "b", "c"] {
            f.coordinator.create(new_query(name), all.clone()).await.unwrap();
        }
        f.coordinator.complete("b").await.unwrap();
        f.coordinator.delete("c").await.unwrap();

        let names = |qs: Vec<DistributedQuery>| qs.into_iter().map(|q| q.name).collect::<Vec<_>>();
        assert_eq!(names(f.coordinator.list(QueryFilter::Active).await.unwrap()), vec!["a"]);
        assert_eq!(names(f.coordinator.list(QueryFilter::Completed).await.unwrap()), vec!["b"]);
        assert_eq!(names(f.coordinator.list(QueryFilter::Deleted).await.unwrap()), vec!["c"]);
        assert_eq!(f.coordinator.list(QueryFilter::All).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_carve_query_needs_path() {
        let f = fixture();
        let mut carve = new_query("carve-1");
        carve.query_type = QueryType::Carve;
        assert!(matches!(
            f.coordinator
                .create(carve, vec![QueryTarget::new(TargetKind::All, "")])
                .await,
            Err(CoreError::ValidationError(_))
        ));
    }
}
