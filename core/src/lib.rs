// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! # nodewarden core
//!
//! The device-communication engine behind the nodewarden service.
//!
//! Nodes enroll into an environment, check in periodically to fetch their
//! configuration, ship logs, pick up distributed queries, write results back,
//! and upload carved files block by block. This crate owns the state machines
//! behind those calls; the HTTP surface lives in `nodewarden-service`.
//!
//! ## Architecture
//!
//! ```text
//! request -> EnvironmentDirectory (snapshot) -> NodeRegistry -> QueryCoordinator
//!                  ^                                        \-> CarveEngine -> CarveBackend
//!                  |                                                 \
//!            PeriodicTask <- Store                              Logger
//! ```
//!
//! ## Modules
//!
//! - [`cache`]: immutable snapshots and the periodic refresh task
//! - [`carvers`]: carve backend capability (local disk, database)
//! - [`carves`]: chunked carve sessions and reconstruction
//! - [`constants`]: defaults and limits
//! - [`environments`]: environment model and the directory snapshot
//! - [`errors`]: core error type and its classification
//! - [`logging`]: log sink capability
//! - [`nodes`]: enrollment, authentication and check-in bookkeeping
//! - [`queries`]: distributed query lifecycle
//! - [`scripts`]: enroll/remove oneliners
//! - [`settings`]: typed settings and the settings snapshot
//! - [`storage`]: storage capability and the in-memory store

pub mod cache;
pub mod carvers;
pub mod carves;
pub mod constants;
pub mod environments;
pub mod errors;
pub mod logging;
pub mod nodes;
pub mod queries;
pub mod scripts;
pub mod settings;
pub mod storage;
