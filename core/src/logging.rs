// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Log sink capability for node status/result logs and query results.
//!
//! The engine hands every payload to a [`Logger`] and never looks at where it
//! ends up. Three sinks ship with the crate:
//!
//! | Sink | Behavior |
//! |------|----------|
//! | [`NoneLogger`] | discards everything |
//! | [`StdoutLogger`] | emits one `tracing` event per payload on the `nodewarden::nodes` target |
//! | [`FileLogger`] | appends one JSON line per payload |

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Status,
    Result,
    /// On-demand query result written by a node.
    Query,
    /// A distributed query reached its expected count.
    Completion,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Result => "result",
            Self::Query => "query",
            Self::Completion => "completion",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(Self::Status),
            "result" => Ok(Self::Result),
            "query" => Ok(Self::Query),
            "completion" => Ok(Self::Completion),
            other => Err(CoreError::ValidationError(format!(
                "unknown log type: {other}"
            ))),
        }
    }
}

#[async_trait]
pub trait Logger: Send + Sync {
    async fn submit(&self, kind: LogKind, environment: &str, payload: &Value)
    -> Result<(), CoreError>;
}

pub struct NoneLogger;

#[async_trait]
impl Logger for NoneLogger {
    async fn submit(
        &self,
        _kind: LogKind,
        _environment: &str,
        _payload: &Value,
    ) -> Result<(), CoreError> {
        Ok(())
    }
}

pub struct StdoutLogger;

#[async_trait]
impl Logger for StdoutLogger {
    async fn submit(
        &self,
        kind: LogKind,
        environment: &str,
        payload: &Value,
    ) -> Result<(), CoreError> {
        tracing::info!(
            target: "nodewarden::nodes",
            kind = kind.as_str(),
            environment,
            payload = %payload
        );
        Ok(())
    }
}

pub struct FileLogger {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileLogger {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tracing::info!("[core] logging node data to {}", path.display());
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Logger for FileLogger {
    async fn submit(
        &self,
        kind: LogKind,
        environment: &str,
        payload: &Value,
    ) -> Result<(), CoreError> {
        let mut line = json!({
            "kind": kind.as_str(),
            "environment": environment,
            "received_at": Utc::now(),
            "payload": payload,
        })
        .to_string();
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::LoggerError(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| CoreError::LoggerError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Keeps every submission in memory.
    #[derive(Default)]
    pub(crate) struct RecordingLogger {
        pub(crate) entries: parking_lot::Mutex<Vec<(LogKind, String, Value)>>,
    }

    impl RecordingLogger {
        pub(crate) fn count(&self, kind: LogKind) -> usize {
            self.entries
                .lock()
                .iter()
                .filter(|(k, _, _)| *k == kind)
                .count()
        }
    }

    #[async_trait]
    impl Logger for RecordingLogger {
        async fn submit(
            &self,
            kind: LogKind,
            environment: &str,
            payload: &Value,
        ) -> Result<(), CoreError> {
            self.entries
                .lock()
                .push((kind, environment.to_string(), payload.clone()));
            Ok(())
        }
    }

    #[test]
    fn test_log_kind_round_trip() {
        for kind in [
            LogKind::Status,
            LogKind::Result,
            LogKind::Query,
            LogKind::Completion,
        ] {
            assert_eq!(kind.as_str().parse::<LogKind>().unwrap(), kind);
        }
        assert!("snapshot".parse::<LogKind>().is_err());
    }

    #[tokio::test]
    async fn test_file_logger_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.log");
        let logger = FileLogger::open(&path).await.unwrap();

        logger
            .submit(LogKind::Status, "prod", &json!({"line": 1}))
            .await
            .unwrap();
        logger
            .submit(LogKind::Result, "prod", &json!({"line": 2}))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "status");
        assert_eq!(lines[1]["payload"]["line"], 2);
        assert_eq!(lines[1]["environment"], "prod");
    }
}
