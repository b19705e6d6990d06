// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

use std::time::Duration;

/// Largest accepted request body. Carve blocks are the biggest payloads.
pub const MAX_BODY_SIZE: usize = 10 * 1024 * 1024; // 10 MB
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Validation constants for node requests
pub const MAX_SECRET_LENGTH: u64 = 1024;
pub const MAX_NODE_KEY_LENGTH: u64 = 256;
pub const MAX_HOST_IDENTIFIER_LENGTH: u64 = 256;
pub const MAX_PLATFORM_LENGTH: u64 = 64;
pub const MAX_LOG_TYPE_LENGTH: u64 = 32;
pub const MAX_CARVE_ID_LENGTH: u64 = 256;
pub const MAX_QUERY_NAME_LENGTH: u64 = 256;
pub const MAX_SCRIPT_NAME_LENGTH: u64 = 32;
pub const MAX_LOG_ENTRIES: u64 = 10_000;
pub const MAX_QUERY_RESULTS: usize = 1_000;
