// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Wire envelopes of the agent protocol.
//!
//! Requests carrying a credential (enroll secret or node key) are zeroized on
//! drop and keep it out of their `Debug` output.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;
use zeroize::ZeroizeOnDrop;

use crate::constants::{
    MAX_CARVE_ID_LENGTH, MAX_HOST_IDENTIFIER_LENGTH, MAX_LOG_ENTRIES, MAX_LOG_TYPE_LENGTH,
    MAX_NODE_KEY_LENGTH, MAX_PLATFORM_LENGTH, MAX_QUERY_NAME_LENGTH, MAX_QUERY_RESULTS,
    MAX_SCRIPT_NAME_LENGTH, MAX_SECRET_LENGTH,
};

#[derive(Deserialize, Validate, ZeroizeOnDrop)]
pub struct EnrollRequest {
    #[validate(length(min = 1, max = "MAX_SECRET_LENGTH"))]
    pub enroll_secret: String,

    #[validate(length(min = 1, max = "MAX_HOST_IDENTIFIER_LENGTH"))]
    pub host_identifier: String,

    #[serde(default)]
    #[validate(length(max = "MAX_PLATFORM_LENGTH"))]
    pub platform_type: String,

    #[serde(default)]
    #[zeroize(skip)]
    pub host_details: Value,
}

impl fmt::Debug for EnrollRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollRequest")
            .field("enroll_secret", &"[REDACTED]")
            .field("host_identifier", &self.host_identifier)
            .field("platform_type", &self.platform_type)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
pub struct EnrollResponse {
    pub node_key: String,
    pub node_invalid: bool,
}

/// Body of endpoints that only carry the node key (config, read).
#[derive(Deserialize, Validate, ZeroizeOnDrop)]
pub struct NodeKeyRequest {
    #[validate(length(max = "MAX_NODE_KEY_LENGTH"))]
    pub node_key: String,
}

impl fmt::Debug for NodeKeyRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeyRequest")
            .field("node_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodeResponse {
    pub node_invalid: bool,
}

impl NodeResponse {
    pub fn valid() -> Self {
        Self {
            node_invalid: false,
        }
    }
}

#[derive(Deserialize, Validate, ZeroizeOnDrop)]
pub struct LogRequest {
    #[validate(length(max = "MAX_NODE_KEY_LENGTH"))]
    pub node_key: String,

    #[validate(length(min = 1, max = "MAX_LOG_TYPE_LENGTH"))]
    pub log_type: String,

    #[serde(default)]
    #[zeroize(skip)]
    #[validate(length(max = "MAX_LOG_ENTRIES"))]
    pub data: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReadResponse {
    pub queries: BTreeMap<String, String>,
    pub node_invalid: bool,
}

#[derive(Deserialize, Validate, ZeroizeOnDrop)]
pub struct WriteRequest {
    #[validate(length(max = "MAX_NODE_KEY_LENGTH"))]
    pub node_key: String,

    #[serde(default)]
    #[zeroize(skip)]
    #[validate(custom(function = "validate_results_count"))]
    pub queries: HashMap<String, Value>,

    #[serde(default)]
    #[zeroize(skip)]
    pub statuses: HashMap<String, i64>,

    #[serde(default)]
    #[zeroize(skip)]
    pub messages: HashMap<String, String>,
}

fn validate_results_count(
    queries: &HashMap<String, Value>,
) -> Result<(), validator::ValidationError> {
    if queries.len() > MAX_QUERY_RESULTS {
        return Err(validator::ValidationError::new("too_many_results"));
    }
    if queries.keys().any(|name| name.len() as u64 > MAX_QUERY_NAME_LENGTH) {
        return Err(validator::ValidationError::new("query_name_too_long"));
    }
    Ok(())
}

#[derive(Deserialize, Validate, ZeroizeOnDrop)]
pub struct CarveInitRequest {
    #[validate(length(max = "MAX_NODE_KEY_LENGTH"))]
    pub node_key: String,
    pub block_count: i64,
    pub block_size: i64,
    pub carve_size: i64,
    #[validate(length(min = 1, max = "MAX_CARVE_ID_LENGTH"))]
    pub carve_id: String,
    #[validate(length(min = 1, max = "MAX_QUERY_NAME_LENGTH"))]
    pub request_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CarveInitResponse {
    pub session_id: String,
    pub success: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CarveBlockRequest {
    pub block_id: i64,
    #[validate(length(min = 1, max = "MAX_CARVE_ID_LENGTH"))]
    pub session_id: String,
    #[validate(length(min = 1, max = "MAX_QUERY_NAME_LENGTH"))]
    pub request_id: String,
    /// base64 encoded block bytes
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CarveBlockResponse {
    pub success: bool,
}

/// Body of the enroll-secret authenticated endpoints (flags, cert).
#[derive(Deserialize, Validate, ZeroizeOnDrop)]
pub struct SecretRequest {
    #[validate(length(max = "MAX_SECRET_LENGTH"))]
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FlagsResponse {
    pub flags: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CertResponse {
    pub certificate: String,
}

#[derive(Deserialize, Validate, ZeroizeOnDrop)]
pub struct VerifyRequest {
    #[validate(length(max = "MAX_SECRET_LENGTH"))]
    pub secret: String,
    #[serde(default)]
    #[validate(length(max = "MAX_NODE_KEY_LENGTH"))]
    pub node_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub node_valid: bool,
}

#[derive(Deserialize, Validate, ZeroizeOnDrop)]
pub struct ScriptRequest {
    #[validate(length(max = "MAX_SECRET_LENGTH"))]
    pub secret: String,
    #[validate(length(min = 1, max = "MAX_SCRIPT_NAME_LENGTH"))]
    pub script: String,
    #[serde(default)]
    #[validate(length(max = "MAX_PLATFORM_LENGTH"))]
    pub platform: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScriptResponse {
    pub script: String,
}

/// Query string of the quick-script route.
#[derive(Debug, Default, Deserialize)]
pub struct ScriptQuery {
    pub platform: Option<String>,
}
