// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Environments (tenants) and the directory that resolves them.
//!
//! Every node request names its environment in the first route segment. The
//! [`EnvironmentDirectory`] answers that lookup from a [`Snapshot`] keyed by
//! both environment uuid and name, republished by a [`PeriodicTask`] every
//! `refresh_envs` seconds.
//!
//! [`PeriodicTask`]: crate::cache::PeriodicTask

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;

use crate::cache::{Periodic, Snapshot};
use crate::constants::{
    DEFAULT_CARVE_BLOCK_PATH, DEFAULT_CARVE_INIT_PATH, DEFAULT_CERT_PATH, DEFAULT_CONFIG_PATH,
    DEFAULT_ENROLL_PATH, DEFAULT_FLAGS_PATH, DEFAULT_LOG_PATH, DEFAULT_QUERY_READ_PATH,
    DEFAULT_QUERY_WRITE_PATH, DEFAULT_SCRIPT_PATH, DEFAULT_VERIFY_PATH,
};
use crate::errors::CoreError;
use crate::scripts::ScriptAction;
use crate::settings::SettingsCache;
use crate::storage::Store;

/// Time-limited validity of the enroll or remove oneliners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationPolicy {
    pub enabled: bool,
    pub ttl_hours: i64,
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_hours: 24,
        }
    }
}

impl ExpirationPolicy {
    /// When the window opened at `from` closes, or `None` if it never does.
    pub fn expires_at(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        let ttl = TimeDelta::try_hours(self.ttl_hours).unwrap_or(TimeDelta::MAX);
        Some(from.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC))
    }

    pub fn is_expired(&self, from: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.expires_at(from).is_some_and(|at| now > at)
    }
}

/// Protocol endpoints a node can call inside an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Enroll,
    Config,
    Log,
    QueryRead,
    QueryWrite,
    CarveInit,
    CarveBlock,
    Flags,
    Cert,
    Verify,
    Script,
}

impl Endpoint {
    /// Stable name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Enroll => "enroll",
            Self::Config => "config",
            Self::Log => "log",
            Self::QueryRead => "query_read",
            Self::QueryWrite => "query_write",
            Self::CarveInit => "carve_init",
            Self::CarveBlock => "carve_block",
            Self::Flags => "flags",
            Self::Cert => "cert",
            Self::Verify => "verify",
            Self::Script => "script",
        }
    }

    /// Endpoints whose body carries data reported by the node.
    pub fn ingests(&self) -> bool {
        matches!(self, Self::Log | Self::QueryWrite | Self::CarveBlock)
    }
}

/// Route segment for every endpoint, configurable per environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPaths {
    pub enroll: String,
    pub config: String,
    pub log: String,
    pub query_read: String,
    pub query_write: String,
    pub carve_init: String,
    pub carve_block: String,
    pub flags: String,
    pub cert: String,
    pub verify: String,
    pub script: String,
}

impl Default for EndpointPaths {
    fn default() -> Self {
        Self {
            enroll: DEFAULT_ENROLL_PATH.to_string(),
            config: DEFAULT_CONFIG_PATH.to_string(),
            log: DEFAULT_LOG_PATH.to_string(),
            query_read: DEFAULT_QUERY_READ_PATH.to_string(),
            query_write: DEFAULT_QUERY_WRITE_PATH.to_string(),
            carve_init: DEFAULT_CARVE_INIT_PATH.to_string(),
            carve_block: DEFAULT_CARVE_BLOCK_PATH.to_string(),
            flags: DEFAULT_FLAGS_PATH.to_string(),
            cert: DEFAULT_CERT_PATH.to_string(),
            verify: DEFAULT_VERIFY_PATH.to_string(),
            script: DEFAULT_SCRIPT_PATH.to_string(),
        }
    }
}

impl EndpointPaths {
    /// Maps a route segment to the endpoint it is configured for.
    pub fn endpoint(&self, segment: &str) -> Option<Endpoint> {
        [
            (&self.enroll, Endpoint::Enroll),
            (&self.config, Endpoint::Config),
            (&self.log, Endpoint::Log),
            (&self.query_read, Endpoint::QueryRead),
            (&self.query_write, Endpoint::QueryWrite),
            (&self.carve_init, Endpoint::CarveInit),
            (&self.carve_block, Endpoint::CarveBlock),
            (&self.flags, Endpoint::Flags),
            (&self.cert, Endpoint::Cert),
            (&self.verify, Endpoint::Verify),
            (&self.script, Endpoint::Script),
        ]
        .into_iter()
        .find(|(path, _)| path.as_str() == segment)
        .map(|(_, endpoint)| endpoint)
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub uuid: String,
    pub name: String,
    /// Public hostname nodes use to reach the service.
    pub hostname: String,
    /// Enroll secret.
    pub secret: String,
    pub secret_rotated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub paths: EndpointPaths,
    pub enroll_secret_path: String,
    pub remove_secret_path: String,
    #[serde(default)]
    pub options: Value,
    #[serde(default)]
    pub schedule: Value,
    #[serde(default)]
    pub packs: Value,
    #[serde(default)]
    pub decorators: Value,
    #[serde(default)]
    pub atc: Value,
    #[serde(default)]
    pub flags: String,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub enroll_policy: ExpirationPolicy,
    #[serde(default)]
    pub remove_policy: ExpirationPolicy,
}

// Custom Debug implementation to keep the enroll secret out of logs
impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("secret", &"[REDACTED]")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Assembles the node configuration document from its parts, leaving out
    /// parts that are not set.
    pub fn configuration(&self) -> Value {
        let mut config = Map::new();
        for (key, part) in [
            ("options", &self.options),
            ("schedule", &self.schedule),
            ("packs", &self.packs),
            ("decorators", &self.decorators),
            ("auto_table_construction", &self.atc),
        ] {
            if !part.is_null() {
                config.insert(key.to_string(), part.clone());
            }
        }
        Value::Object(config)
    }

    /// Constant-time comparison against the enroll secret.
    pub fn verify_secret(&self, candidate: &str) -> bool {
        !candidate.is_empty() && bool::from(self.secret.as_bytes().ct_eq(candidate.as_bytes()))
    }

    /// Constant-time comparison against the quick-script secret path of `action`.
    pub fn verify_secret_path(&self, action: ScriptAction, candidate: &str) -> bool {
        let expected = match action {
            ScriptAction::Enroll => &self.enroll_secret_path,
            ScriptAction::Remove => &self.remove_secret_path,
        };
        !candidate.is_empty() && bool::from(expected.as_bytes().ct_eq(candidate.as_bytes()))
    }

    pub fn enroll_expired(&self, now: DateTime<Utc>) -> bool {
        self.enroll_policy.is_expired(self.secret_rotated_at, now)
    }

    pub fn remove_expired(&self, now: DateTime<Utc>) -> bool {
        self.remove_policy.is_expired(self.secret_rotated_at, now)
    }
}

/// Route segment (uuid or name) -> environment
pub type EnvironmentMap = HashMap<String, Arc<Environment>>;

pub struct EnvironmentDirectory {
    store: Arc<dyn Store>,
    settings: Arc<SettingsCache>,
    snapshot: Snapshot<EnvironmentMap>,
}

impl EnvironmentDirectory {
    pub fn new(store: Arc<dyn Store>, settings: Arc<SettingsCache>) -> Self {
        Self {
            store,
            settings,
            snapshot: Snapshot::default(),
        }
    }

    /// Resolves an environment by uuid or name from the current snapshot.
    pub fn resolve(&self, segment: &str) -> Option<Arc<Environment>> {
        self.snapshot.load().get(segment).cloned()
    }

    /// Same as [`resolve`](Self::resolve) but as an error for the `?` operator.
    pub fn require(&self, segment: &str) -> Result<Arc<Environment>, CoreError> {
        self.resolve(segment).ok_or(CoreError::UnknownEnvironment)
    }

    pub fn snapshot(&self) -> Arc<EnvironmentMap> {
        self.snapshot.load()
    }

    /// Loads every environment and publishes a new snapshot. On error the
    /// previous snapshot stays in place.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize, CoreError> {
        let environments = self.store.environments().await?;
        let count = environments.len();

        let mut map = EnvironmentMap::with_capacity(count * 2);
        for environment in environments {
            let environment = Arc::new(environment);
            map.insert(environment.name.clone(), environment.clone());
            // uuid wins over a name that happens to collide with it
            map.insert(environment.uuid.clone(), environment);
        }

        self.snapshot.publish(map);
        Ok(count)
    }
}

#[async_trait]
impl Periodic for EnvironmentDirectory {
    fn name(&self) -> &'static str {
        "environments refresh"
    }

    fn interval(&self) -> Duration {
        self.settings.refresh_envs_interval()
    }

    async fn run_once(&self) -> Result<(), CoreError> {
        let count = self.refresh().await?;
        if self.settings.debug_service() {
            tracing::debug!("[core] refreshed {} environments", count);
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    pub(crate) fn environment(uuid: &str, name: &str) -> Environment {
        let now = Utc::now();
        Environment {
            uuid: uuid.to_string(),
            name: name.to_string(),
            hostname: "fleet.example.com".to_string(),
            secret: format!("{name}-enroll-secret"),
            secret_rotated_at: now,
            created_at: now,
            paths: EndpointPaths::default(),
            enroll_secret_path: format!("{name}-enroll"),
            remove_secret_path: format!("{name}-remove"),
            options: serde_json::json!({"host_identifier": "uuid"}),
            schedule: serde_json::json!({
                "uptime": {"query": "SELECT * FROM uptime;", "interval": 60}
            }),
            packs: Value::Null,
            decorators: Value::Null,
            atc: Value::Null,
            flags: "--host_identifier=uuid".to_string(),
            certificate: String::new(),
            enroll_policy: ExpirationPolicy::default(),
            remove_policy: ExpirationPolicy::default(),
        }
    }

    fn directory() -> (Arc<MemoryStore>, EnvironmentDirectory) {
        let store = Arc::new(MemoryStore::new());
        let settings = Arc::new(SettingsCache::new(store.clone()));
        (store.clone(), EnvironmentDirectory::new(store, settings))
    }

    #[test]
    fn test_policy_disabled_never_expires() {
        let policy = ExpirationPolicy {
            enabled: false,
            ttl_hours: 1,
        };
        let long_ago = Utc::now() - TimeDelta::days(365);
        assert!(!policy.is_expired(long_ago, Utc::now()));
    }

    #[test]
    fn test_policy_window() {
        let policy = ExpirationPolicy {
            enabled: true,
            ttl_hours: 2,
        };
        let now = Utc::now();
        assert!(!policy.is_expired(now - TimeDelta::hours(1), now));
        assert!(policy.is_expired(now - TimeDelta::hours(3), now));
    }

    #[test]
    fn test_endpoint_lookup_uses_environment_paths() {
        let mut paths = EndpointPaths::default();
        paths.enroll = "a1b2c3".to_string();
        assert_eq!(paths.endpoint("a1b2c3"), Some(Endpoint::Enroll));
        assert_eq!(paths.endpoint("enroll"), None);
        assert_eq!(paths.endpoint("read"), Some(Endpoint::QueryRead));
    }

    #[test]
    fn test_configuration_skips_null_parts() {
        let env = environment("uuid-1", "prod");
        let config = env.configuration();
        assert!(config.get("options").is_some());
        assert!(config.get("schedule").is_some());
        assert!(config.get("packs").is_none());
    }

    #[test]
    fn test_verify_secret() {
        let env = environment("uuid-1", "prod");
        assert!(env.verify_secret("prod-enroll-secret"));
        assert!(!env.verify_secret("prod-enroll-secreT"));
        assert!(!env.verify_secret(""));
    }

    #[test]
    fn test_verify_secret_path_per_action() {
        let env = environment("uuid-1", "prod");
        assert!(env.verify_secret_path(ScriptAction::Enroll, "prod-enroll"));
        assert!(!env.verify_secret_path(ScriptAction::Remove, "prod-enroll"));
        assert!(env.verify_secret_path(ScriptAction::Remove, "prod-remove"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let env = environment("uuid-1", "prod");
        let debug = format!("{env:?}");
        assert!(!debug.contains("prod-enroll-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_resolve_by_uuid_and_name() {
        let (store, directory) = directory();
        store.put_environment(environment("uuid-1", "prod"));
        directory.refresh().await.unwrap();

        assert_eq!(directory.resolve("uuid-1").unwrap().name, "prod");
        assert_eq!(directory.resolve("prod").unwrap().uuid, "uuid-1");
        assert!(directory.resolve("dev").is_none());
    }

    #[tokio::test]
    async fn test_new_environment_visible_after_one_refresh() {
        let (store, directory) = directory();
        store.put_environment(environment("uuid-1", "prod"));
        directory.refresh().await.unwrap();

        store.put_environment(environment("new-secret", "staging"));
        assert!(directory.resolve("new-secret").is_none());

        directory.refresh().await.unwrap();
        assert!(directory.resolve("new-secret").is_some());
    }

    #[tokio::test]
    async fn test_reader_keeps_its_snapshot() {
        let (store, directory) = directory();
        store.put_environment(environment("uuid-1", "prod"));
        directory.refresh().await.unwrap();

        let held = directory.snapshot();
        store.put_environment(environment("uuid-2", "dev"));
        directory.refresh().await.unwrap();

        assert!(held.get("uuid-2").is_none());
        assert!(directory.snapshot().get("uuid-2").is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let (store, directory) = directory();
        store.put_environment(environment("uuid-1", "prod"));
        directory.refresh().await.unwrap();

        store.set_unavailable(true);
        assert!(matches!(
            directory.run_once().await,
            Err(CoreError::StorageError(_))
        ));
        assert!(directory.resolve("prod").is_some());
    }
}
