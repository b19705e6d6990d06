// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! # nodewarden service
//!
//! HTTP front of the nodewarden device-communication engine.
//!
//! ## Architecture
//!
//! ```text
//! osquery agent -> HTTP API (this crate) -> nodewarden-core -> Store
//!                                               |
//!                                               +-> Logger (none, stdout, file)
//!                                               +-> CarveBackend (local, db, s3)
//! ```
//!
//! ## Modules
//!
//! - [`application`]: state wiring, router, body limits and timeouts
//! - [`configuration`]: CLI argument parsing with clap
//! - [`constants`]: wire limits
//! - [`errors`]: application error type with HTTP response mapping
//! - [`metrics`]: Prometheus request and ingestion counters
//! - [`models`]: request/response envelopes with validation
//! - [`routes`]: HTTP route handlers
//! - [`s3`]: S3 carve backend
//! - [`seed`]: JSON seeding of the in-memory store
//!
//! ## Usage
//!
//! ```bash
//! nodewarden --host 0.0.0.0 --port 8080 --seed-file seed.json --carver local --carver-dir /var/lib/carves
//! ```

pub mod application;
pub mod configuration;
pub mod constants;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod s3;
pub mod seed;
