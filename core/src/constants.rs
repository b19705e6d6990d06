// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

/// Settings service name the protocol engine reads its tunables from.
pub const SERVICE_TLS: &str = "tls";

// Setting keys
pub const SETTING_REFRESH_ENVS: &str = "refresh_envs";
pub const SETTING_REFRESH_SETTINGS: &str = "refresh_settings";
pub const SETTING_DEBUG_SERVICE: &str = "debug_service";
pub const SETTING_DEBUG_HTTP: &str = "debug_http";
pub const SETTING_INACTIVE_HOURS: &str = "inactive_hours";
pub const SETTING_CARVE_EXPIRATION: &str = "carve_expiration";
pub const SETTING_CARVE_SWEEP: &str = "carve_sweep";
pub const SETTING_METRICS: &str = "metrics";

pub const DEFAULT_REFRESH: Duration = Duration::from_secs(300);
pub const DEFAULT_INACTIVE_HOURS: i64 = 72;
pub const DEFAULT_CARVE_EXPIRATION: Duration = Duration::from_secs(3600);
pub const DEFAULT_CARVE_SWEEP: Duration = Duration::from_secs(60);
/// Upper bound of the random splay added to every refresh interval, in percent.
pub const REFRESH_SPLAY_PERCENT: u64 = 10;

// Default endpoint path segments for a new environment
pub const DEFAULT_ENROLL_PATH: &str = "enroll";
pub const DEFAULT_CONFIG_PATH: &str = "config";
pub const DEFAULT_LOG_PATH: &str = "log";
pub const DEFAULT_QUERY_READ_PATH: &str = "read";
pub const DEFAULT_QUERY_WRITE_PATH: &str = "write";
pub const DEFAULT_CARVE_INIT_PATH: &str = "init";
pub const DEFAULT_CARVE_BLOCK_PATH: &str = "block";
pub const DEFAULT_FLAGS_PATH: &str = "flags";
pub const DEFAULT_CERT_PATH: &str = "cert";
pub const DEFAULT_VERIFY_PATH: &str = "verify";
pub const DEFAULT_SCRIPT_PATH: &str = "script";

/// Raw bytes behind a generated node key (hex encoded on the wire).
pub const NODE_KEY_BYTES: usize = 32;

// Carve limits
pub const MAX_CARVE_BLOCKS: u32 = 1 << 20;
/// Default cap on the inflated size of a gzip carve.
pub const MAX_INFLATED_CARVE_SIZE: u64 = 1 << 30;
/// gzip member header magic
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
