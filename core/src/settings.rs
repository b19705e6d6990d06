// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Typed per-service settings and their in-memory snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{Periodic, Snapshot};
use crate::constants::{
    DEFAULT_CARVE_EXPIRATION, DEFAULT_CARVE_SWEEP, DEFAULT_INACTIVE_HOURS, DEFAULT_REFRESH,
    SERVICE_TLS, SETTING_CARVE_EXPIRATION, SETTING_CARVE_SWEEP, SETTING_DEBUG_HTTP,
    SETTING_DEBUG_SERVICE, SETTING_INACTIVE_HOURS, SETTING_METRICS, SETTING_REFRESH_ENVS,
    SETTING_REFRESH_SETTINGS,
};
use crate::errors::CoreError;
use crate::storage::Store;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SettingValue {
    Boolean(bool),
    Integer(i64),
    String(String),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingRecord {
    pub service: String,
    pub name: String,
    pub value: SettingValue,
}

impl SettingRecord {
    pub fn new(service: &str, name: &str, value: SettingValue) -> Self {
        Self {
            service: service.to_string(),
            name: name.to_string(),
            value,
        }
    }
}

/// `(service, name)` -> value
pub type SettingsMap = HashMap<(String, String), SettingValue>;

/// Defaults inserted for the protocol service when missing.
pub fn default_settings() -> Vec<SettingRecord> {
    let refresh = i64::try_from(DEFAULT_REFRESH.as_secs()).unwrap_or(i64::MAX);
    let expiration = i64::try_from(DEFAULT_CARVE_EXPIRATION.as_secs()).unwrap_or(i64::MAX);
    let sweep = i64::try_from(DEFAULT_CARVE_SWEEP.as_secs()).unwrap_or(i64::MAX);

    vec![
        SettingRecord::new(SERVICE_TLS, SETTING_DEBUG_SERVICE, SettingValue::Boolean(false)),
        SettingRecord::new(SERVICE_TLS, SETTING_DEBUG_HTTP, SettingValue::Boolean(false)),
        SettingRecord::new(SERVICE_TLS, SETTING_METRICS, SettingValue::Boolean(false)),
        SettingRecord::new(SERVICE_TLS, SETTING_REFRESH_ENVS, SettingValue::Integer(refresh)),
        SettingRecord::new(SERVICE_TLS, SETTING_REFRESH_SETTINGS, SettingValue::Integer(refresh)),
        SettingRecord::new(
            SERVICE_TLS,
            SETTING_INACTIVE_HOURS,
            SettingValue::Integer(DEFAULT_INACTIVE_HOURS),
        ),
        SettingRecord::new(
            SERVICE_TLS,
            SETTING_CARVE_EXPIRATION,
            SettingValue::Integer(expiration),
        ),
        SettingRecord::new(SERVICE_TLS, SETTING_CARVE_SWEEP, SettingValue::Integer(sweep)),
    ]
}

/// Settings snapshot shared by every request handler.
pub struct SettingsCache {
    store: Arc<dyn Store>,
    snapshot: Snapshot<SettingsMap>,
}

impl SettingsCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            snapshot: Snapshot::default(),
        }
    }

    /// Inserts every missing default. Existing values are never overwritten.
    #[tracing::instrument(skip(self))]
    pub async fn ensure_defaults(&self) -> Result<usize, CoreError> {
        let mut added = 0;
        for record in default_settings() {
            let name = record.name.clone();
            if self.store.insert_setting_if_missing(record).await? {
                tracing::info!("[core] added default setting {}", name);
                added += 1;
            }
        }
        Ok(added)
    }

    /// Reloads every setting from storage and publishes a new snapshot.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> Result<usize, CoreError> {
        let records = self.store.settings().await?;
        let map: SettingsMap = records
            .into_iter()
            .map(|r| ((r.service, r.name), r.value))
            .collect();
        let count = map.len();
        self.snapshot.publish(map);
        Ok(count)
    }

    pub fn value(&self, service: &str, name: &str) -> Option<SettingValue> {
        self.snapshot
            .load()
            .get(&(service.to_string(), name.to_string()))
            .cloned()
    }

    pub fn boolean(&self, service: &str, name: &str) -> bool {
        matches!(self.value(service, name), Some(SettingValue::Boolean(true)))
    }

    pub fn integer(&self, service: &str, name: &str) -> Option<i64> {
        match self.value(service, name) {
            Some(SettingValue::Integer(v)) => Some(v),
            _ => None,
        }
    }

    fn seconds_or(&self, name: &str, default: Duration) -> Duration {
        match self.integer(SERVICE_TLS, name) {
            Some(secs) if secs > 0 => Duration::from_secs(secs.unsigned_abs()),
            _ => default,
        }
    }

    pub fn refresh_envs_interval(&self) -> Duration {
        self.seconds_or(SETTING_REFRESH_ENVS, DEFAULT_REFRESH)
    }

    pub fn refresh_settings_interval(&self) -> Duration {
        self.seconds_or(SETTING_REFRESH_SETTINGS, DEFAULT_REFRESH)
    }

    pub fn carve_expiration(&self) -> Duration {
        self.seconds_or(SETTING_CARVE_EXPIRATION, DEFAULT_CARVE_EXPIRATION)
    }

    pub fn carve_sweep_interval(&self) -> Duration {
        self.seconds_or(SETTING_CARVE_SWEEP, DEFAULT_CARVE_SWEEP)
    }

    pub fn inactive_hours(&self) -> i64 {
        match self.integer(SERVICE_TLS, SETTING_INACTIVE_HOURS) {
            Some(hours) if hours > 0 => hours,
            _ => DEFAULT_INACTIVE_HOURS,
        }
    }

    pub fn debug_service(&self) -> bool {
        self.boolean(SERVICE_TLS, SETTING_DEBUG_SERVICE)
    }

    pub fn debug_http(&self) -> bool {
        self.boolean(SERVICE_TLS, SETTING_DEBUG_HTTP)
    }

    /// Whether request and ingestion counters are collected and exposed.
    pub fn metrics(&self) -> bool {
        self.boolean(SERVICE_TLS, SETTING_METRICS)
    }
}

#[async_trait]
impl Periodic for SettingsCache {
    fn name(&self) -> &'static str {
        "settings refresh"
    }

    fn interval(&self) -> Duration {
        self.refresh_settings_interval()
    }

    async fn run_once(&self) -> Result<(), CoreError> {
        let count = self.refresh().await?;
        if self.debug_service() {
            tracing::debug!("[core] refreshed {} settings", count);
        }
        Ok(())
    }
}
