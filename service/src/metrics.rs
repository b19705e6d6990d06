// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Prometheus counters for the agent protocol.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `nodewarden_requests_total` | Counter | `endpoint`, `status` |
//! | `nodewarden_ingested_bytes_total` | Counter | `environment`, `endpoint` |
//!
//! Counters are only updated, and `GET /metrics` only answers, while the
//! `metrics` setting of the `tls` service is on.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

#[derive(Clone)]
pub struct ServiceMetrics {
    registry: Registry,
    requests_total: IntCounterVec,
    ingested_bytes_total: IntCounterVec,
}

impl ServiceMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new(
                "nodewarden_requests_total",
                "Agent protocol requests by endpoint and HTTP status",
            ),
            &["endpoint", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let ingested_bytes_total = IntCounterVec::new(
            Opts::new(
                "nodewarden_ingested_bytes_total",
                "Request body bytes received from nodes for logs, results and carves",
            ),
            &["environment", "endpoint"],
        )?;
        registry.register(Box::new(ingested_bytes_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            ingested_bytes_total,
        })
    }

    pub fn request(&self, endpoint: &str, status: u16) {
        let status = status.to_string();
        self.requests_total
            .with_label_values(&[endpoint, status.as_str()])
            .inc();
    }

    pub fn ingested(&self, environment: &str, endpoint: &str, bytes: usize) {
        self.ingested_bytes_total
            .with_label_values(&[environment, endpoint])
            .inc_by(bytes as u64);
    }

    /// Prometheus text exposition of every registered counter.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
