// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Node enrollment and session state.
//!
//! A node is unenrolled until its first successful [`enroll`], enrolled
//! afterwards, and classified active or inactive at read time from how long ago
//! it was last seen. The `node_key` handed out at enroll time is the only
//! credential a node presents on later calls; [`authenticate`] fails closed on
//! anything but an exact match, which tells the node to enroll again.
//!
//! [`enroll`]: NodeRegistry::enroll
//! [`authenticate`]: NodeRegistry::authenticate

use std::fmt;
use std::sync::Arc;

use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use chrono::{DateTime, TimeDelta, Utc};
use data_encoding::HEXLOWER;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::NODE_KEY_BYTES;
use crate::environments::Environment;
use crate::errors::CoreError;
use crate::scripts::{self, ScriptAction, ScriptPlatform};
use crate::settings::SettingsCache;
use crate::storage::Store;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Host identity reported at enroll time, upper-cased.
    pub uuid: String,
    pub node_key: String,
    /// Environment uuid.
    pub environment: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub localname: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub platform_version: String,
    #[serde(default)]
    pub agent_version: String,
    #[serde(default)]
    pub hardware_serial: String,
    #[serde(default)]
    pub last_ip: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub enrolled_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
}

// Custom Debug implementation to keep the node key out of logs
impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("uuid", &self.uuid)
            .field("node_key", &"[REDACTED]")
            .field("environment", &self.environment)
            .field("hostname", &self.hostname)
            .field("platform", &self.platform)
            .field("last_seen", &self.last_seen)
            .finish_non_exhaustive()
    }
}

/// Descriptive fields a node reports when it enrolls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMetadata {
    pub hostname: String,
    pub localname: String,
    pub platform: String,
    pub platform_version: String,
    pub agent_version: String,
    pub hardware_serial: String,
}

impl NodeMetadata {
    /// Extracts metadata from the agent's `host_details` document.
    ///
    /// ```json
    /// {
    ///   "os_version": {"platform": "ubuntu", "version": "22.04"},
    ///   "osquery_info": {"version": "5.12.1"},
    ///   "system_info": {"hostname": "web-1", "local_hostname": "web-1", "hardware_serial": "X1"}
    /// }
    /// ```
    pub fn from_host_details(platform_type: &str, details: &Value) -> Self {
        let field = |section: &str, key: &str| -> String {
            details
                .get(section)
                .and_then(|s| s.get(key))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };

        let mut platform = field("os_version", "platform");
        if platform.is_empty() {
            platform = platform_type.to_string();
        }

        Self {
            hostname: field("system_info", "hostname"),
            localname: field("system_info", "local_hostname"),
            platform,
            platform_version: field("os_version", "version"),
            agent_version: field("osquery_info", "version"),
            hardware_serial: field("system_info", "hardware_serial"),
        }
    }
}

/// Request-scoped facts recorded on every authenticated check-in.
#[derive(Debug, Clone, Default)]
pub struct CheckIn {
    pub ip: Option<String>,
}

pub struct NodeRegistry {
    store: Arc<dyn Store>,
    settings: Arc<SettingsCache>,
    rng: SystemRandom,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn Store>, settings: Arc<SettingsCache>) -> Self {
        Self {
            store,
            settings,
            rng: SystemRandom::new(),
        }
    }

    /// Enrolls a node, or re-enrolls one that already exists for the same host
    /// identity, and returns its freshly generated node key.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidEnrollSecret`] - secret does not match
    /// - [`CoreError::EnrollExpired`] - the enroll window of the environment closed
    /// - [`CoreError::ValidationError`] - empty host identifier
    /// - [`CoreError::StorageError`] - the node could not be persisted
    #[tracing::instrument(
        skip(self, environment, secret, metadata),
        fields(environment = %environment.name)
    )]
    pub async fn enroll(
        &self,
        environment: &Environment,
        secret: &str,
        host_identifier: &str,
        metadata: NodeMetadata,
    ) -> Result<String, CoreError> {
        if !environment.verify_secret(secret) {
            return Err(CoreError::InvalidEnrollSecret);
        }

        let now = Utc::now();
        if environment.enroll_expired(now) {
            return Err(CoreError::EnrollExpired);
        }

        let uuid = host_identifier.trim().to_uppercase();
        if uuid.is_empty() {
            return Err(CoreError::ValidationError(
                "host identifier is required".to_string(),
            ));
        }

        let node_key = self.generate_node_key()?;

        match self.store.node_by_uuid(&environment.uuid, &uuid).await? {
            Some(mut existing) => {
                tracing::debug!("[core] re-enrolling node {}", uuid);
                existing.node_key = node_key.clone();
                existing.last_seen = now;
                apply_metadata(&mut existing, metadata);
                self.store.update_node(existing).await?;
            }
            None => {
                tracing::debug!("[core] enrolling new node {}", uuid);
                let mut node = Node {
                    uuid,
                    node_key: node_key.clone(),
                    environment: environment.uuid.clone(),
                    hostname: String::new(),
                    localname: String::new(),
                    platform: String::new(),
                    platform_version: String::new(),
                    agent_version: String::new(),
                    hardware_serial: String::new(),
                    last_ip: None,
                    last_seen: now,
                    enrolled_at: now,
                    tags: Vec::new(),
                };
                apply_metadata(&mut node, metadata);
                self.store.insert_node(node).await?;
            }
        }

        Ok(node_key)
    }

    /// Looks up the node holding `node_key` in `environment`.
    pub async fn authenticate(
        &self,
        environment: &Environment,
        node_key: &str,
    ) -> Result<Node, CoreError> {
        if node_key.is_empty() {
            return Err(CoreError::InvalidNodeKey);
        }
        self.store
            .node_by_key(&environment.uuid, node_key)
            .await?
            .ok_or(CoreError::InvalidNodeKey)
    }

    /// Records a check-in.
    pub async fn touch(&self, node: &Node, check_in: &CheckIn) -> Result<(), CoreError> {
        self.touch_uuid(&node.environment, &node.uuid, check_in).await
    }

    /// Records a check-in for a node known only by uuid, such as the sender of
    /// a carve block.
    pub async fn touch_uuid(
        &self,
        environment: &str,
        uuid: &str,
        check_in: &CheckIn,
    ) -> Result<(), CoreError> {
        self.store
            .touch_node(environment, uuid, Utc::now(), check_in.ip.clone())
            .await
    }

    /// `true` when the node checked in within the `inactive_hours` setting.
    pub fn is_active(&self, node: &Node, now: DateTime<Utc>) -> bool {
        let threshold =
            TimeDelta::try_hours(self.settings.inactive_hours()).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(node.last_seen) < threshold
    }

    /// Renders the enroll or remove oneliner for `environment`.
    ///
    /// # Errors
    ///
    /// [`CoreError::EnrollExpired`] or [`CoreError::RemoveExpired`] when the
    /// environment's policy for that action says the window has elapsed.
    pub fn quick_script(
        &self,
        environment: &Environment,
        action: ScriptAction,
        platform: ScriptPlatform,
    ) -> Result<String, CoreError> {
        let now = Utc::now();
        match action {
            ScriptAction::Enroll if environment.enroll_expired(now) => {
                Err(CoreError::EnrollExpired)
            }
            ScriptAction::Remove if environment.remove_expired(now) => {
                Err(CoreError::RemoveExpired)
            }
            _ => Ok(scripts::render(environment, action, platform)),
        }
    }

    fn generate_node_key(&self) -> Result<String, CoreError> {
        let mut bytes = [0u8; NODE_KEY_BYTES];
        self.rng.fill(&mut bytes).map_err(|_| {
            tracing::error!("[core] system random source failed");
            CoreError::StorageError("unable to generate node key".to_string())
        })?;
        Ok(HEXLOWER.encode(&bytes))
    }
}

fn apply_metadata(node: &mut Node, metadata: NodeMetadata) {
    let NodeMetadata {
        hostname,
        localname,
        platform,
        platform_version,
        agent_version,
        hardware_serial,
    } = metadata;
    node.hostname = hostname;
    node.localname = localname;
    node.platform = platform;
    node.platform_version = platform_version;
    node.agent_version = agent_version;
    node.hardware_serial = hardware_serial;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::environments::ExpirationPolicy;
    use crate::environments::tests::environment;
    use crate::storage::MemoryStore;

    pub(crate) fn node(environment: &str, uuid: &str, node_key: &str) -> Node {
        let now = Utc::now();
        Node {
            uuid: uuid.to_string(),
            node_key: node_key.to_string(),
            environment: environment.to_string(),
            hostname: uuid.to_lowercase(),
            localname: uuid.to_lowercase(),
            platform: "ubuntu".to_string(),
            platform_version: "22.04".to_string(),
            agent_version: "5.12.1".to_string(),
            hardware_serial: String::new(),
            last_ip: None,
            last_seen: now,
            enrolled_at: now,
            tags: Vec::new(),
        }
    }

    fn registry() -> (Arc<MemoryStore>, NodeRegistry) {
        let store = Arc::new(MemoryStore::new());
        let settings = Arc::new(SettingsCache::new(store.clone()));
        (store.clone(), NodeRegistry::new(store, settings))
    }

    fn metadata() -> NodeMetadata {
        NodeMetadata::from_host_details(
            "9",
            &serde_json::json!({
                "os_version": {"platform": "ubuntu", "version": "22.04"},
                "osquery_info": {"version": "5.12.1"},
                "system_info": {"hostname": "web-1", "local_hostname": "web-1.local"}
            }),
        )
    }

    #[test]
    fn test_metadata_from_host_details() {
        let metadata = metadata();
        assert_eq!(metadata.hostname, "web-1");
        assert_eq!(metadata.localname, "web-1.local");
        assert_eq!(metadata.platform, "ubuntu");
        assert_eq!(metadata.agent_version, "5.12.1");
    }

    #[test]
    fn test_metadata_falls_back_to_platform_type() {
        let metadata = NodeMetadata::from_host_details("darwin", &Value::Null);
        assert_eq!(metadata.platform, "darwin");
        assert!(metadata.hostname.is_empty());
    }

    #[tokio::test]
    async fn test_enroll_fresh_node_authenticates() {
        let (store, registry) = registry();
        let env = environment("env-1", "prod");

        let key = registry
            .enroll(&env, "prod-enroll-secret", "host-1", metadata())
            .await
            .unwrap();

        assert_eq!(key.len(), NODE_KEY_BYTES * 2);
        assert_eq!(store.nodes().await.unwrap().len(), 1);
        let node = registry.authenticate(&env, &key).await.unwrap();
        assert_eq!(node.uuid, "HOST-1");
        assert_eq!(node.hostname, "web-1");
    }

    #[tokio::test]
    async fn test_re_enroll_rotates_key() {
        let (store, registry) = registry();
        let env = environment("env-1", "prod");

        let first = registry
            .enroll(&env, "prod-enroll-secret", "host-1", metadata())
            .await
            .unwrap();
        let enrolled_at = registry.authenticate(&env, &first).await.unwrap().enrolled_at;

        let second = registry
            .enroll(&env, "prod-enroll-secret", "HOST-1", metadata())
            .await
            .unwrap();

        assert_ne!(first, second);
        assert_eq!(store.nodes().await.unwrap().len(), 1);
        assert_eq!(
            registry.authenticate(&env, &first).await.unwrap_err(),
            CoreError::InvalidNodeKey
        );
        let node = registry.authenticate(&env, &second).await.unwrap();
        assert_eq!(node.enrolled_at, enrolled_at);
    }

    #[tokio::test]
    async fn test_enroll_wrong_secret() {
        let (store, registry) = registry();
        let env = environment("env-1", "prod");
        let err = registry
            .enroll(&env, "nope", "host-1", metadata())
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::InvalidEnrollSecret);
        assert!(store.nodes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_enroll_after_window() {
        let (_, registry) = registry();
        let mut env = environment("env-1", "prod");
        env.enroll_policy = ExpirationPolicy {
            enabled: true,
            ttl_hours: 1,
        };
        env.secret_rotated_at = Utc::now() - TimeDelta::hours(2);

        let err = registry
            .enroll(&env, "prod-enroll-secret", "host-1", metadata())
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::EnrollExpired);
    }

    #[tokio::test]
    async fn test_enroll_empty_identifier() {
        let (_, registry) = registry();
        let env = environment("env-1", "prod");
        let err = registry
            .enroll(&env, "prod-enroll-secret", "  ", metadata())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_authenticate_other_environment_fails() {
        let (_, registry) = registry();
        let prod = environment("env-1", "prod");
        let dev = environment("env-2", "dev");
        let key = registry
            .enroll(&prod, "prod-enroll-secret", "host-1", metadata())
            .await
            .unwrap();
        assert_eq!(
            registry.authenticate(&dev, &key).await.unwrap_err(),
            CoreError::InvalidNodeKey
        );
        assert_eq!(
            registry.authenticate(&prod, "").await.unwrap_err(),
            CoreError::InvalidNodeKey
        );
    }

    #[tokio::test]
    async fn test_touch_updates_last_seen() {
        let (store, registry) = registry();
        let mut stale = node("env-1", "HOST-1", "key-1");
        stale.last_seen = Utc::now() - TimeDelta::days(10);
        store.put_node(stale.clone());

        assert!(!registry.is_active(&stale, Utc::now()));

        registry
            .touch(
                &stale,
                &CheckIn {
                    ip: Some("10.0.0.7".to_string()),
                },
            )
            .await
            .unwrap();

        let fresh = store.node_by_uuid("env-1", "HOST-1").await.unwrap().unwrap();
        assert!(registry.is_active(&fresh, Utc::now()));
        assert_eq!(fresh.last_ip.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_quick_script_remove_window() {
        let (_, registry) = registry();
        let mut env = environment("env-1", "prod");
        env.remove_policy = ExpirationPolicy {
            enabled: true,
            ttl_hours: 1,
        };
        env.secret_rotated_at = Utc::now() - TimeDelta::hours(2);

        assert_eq!(
            registry
                .quick_script(&env, ScriptAction::Remove, ScriptPlatform::Linux)
                .unwrap_err(),
            CoreError::RemoveExpired
        );
        let script = registry
            .quick_script(&env, ScriptAction::Enroll, ScriptPlatform::Linux)
            .unwrap();
        assert!(script.contains("prod-enroll-secret"));
    }

    #[test]
    fn test_node_debug_redacts_key() {
        let n = node("env-1", "HOST-1", "very-secret-key");
        assert!(!format!("{n:?}").contains("very-secret-key"));
    }
}
