// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! HTTP route handlers for the agent protocol.
//!
//! | Method | Path | Handler | Description |
//! |--------|------|---------|-------------|
//! | GET | `/health` | [`health`] | Health check endpoint |
//! | GET | `/metrics` | [`metrics`] | Prometheus counters, while the `metrics` setting is on |
//! | POST | `/{environment}/{endpoint}` | [`node_endpoint`] | Agent protocol endpoints |
//! | GET | `/{environment}/{secret_path}/{script}` | [`quick_script`] | Enroll/remove oneliners |
//!
//! `{environment}` is the environment uuid or name. `{endpoint}` is matched
//! against the path segments configured on that environment, so the same
//! segment may mean different endpoints in different environments.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use data_encoding::BASE64;
use nodewarden_core::carves::{BlockOutcome, CarveInit};
use nodewarden_core::environments::{Endpoint, Environment};
use nodewarden_core::errors::{CoreError, ErrorClass};
use nodewarden_core::logging::LogKind;
use nodewarden_core::nodes::{CheckIn, Node, NodeMetadata};
use nodewarden_core::queries::QueryResult;
use nodewarden_core::scripts::{ScriptAction, parse_script_name};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use validator::Validate;

use crate::application::AppState;
use crate::errors::AppError;
use crate::models::{
    CarveBlockRequest, CarveBlockResponse, CarveInitRequest, CarveInitResponse, CertResponse,
    EnrollRequest, EnrollResponse, FlagsResponse, LogRequest, NodeKeyRequest, NodeResponse,
    ReadResponse, ScriptQuery, ScriptRequest, ScriptResponse, SecretRequest, VerifyRequest,
    VerifyResponse, WriteRequest,
};

/// Health check endpoint.
///
/// # Response
///
/// ```json
/// {"status": "ok"}
/// ```
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Prometheus text exposition of the protocol counters.
///
/// # Errors
///
/// [`AppError::NotFound`] while the `metrics` setting is off.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    if !state.settings.metrics() {
        return Err(AppError::NotFound("metrics".to_string()));
    }
    let text = state
        .metrics
        .encode_text()
        .map_err(|e| AppError::ConfigError(e.to_string()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        text,
    )
        .into_response())
}

/// Single entry point for every agent call inside an environment.
///
/// # Errors
///
/// - [`AppError::EnvironmentNotFound`] - unknown environment segment
/// - [`AppError::NotFound`] - segment is not one of the environment's endpoints
/// - [`AppError::ValidationError`] - malformed or oversized body
/// - [`AppError::NodeInvalid`] - bad node key or enroll secret, sent as HTTP 200
#[tracing::instrument(skip(state, headers, body))]
pub async fn node_endpoint(
    State(state): State<Arc<AppState>>,
    Path((environment, endpoint)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let env = state.environments.require(&environment)?;
    let Some(endpoint) = env.paths.endpoint(&endpoint) else {
        return Err(AppError::NotFound(format!("endpoint {endpoint}")));
    };

    if state.settings.debug_http() {
        tracing::debug!(
            "[service] {:?} for {} with {} byte body",
            endpoint,
            env.name,
            body.len()
        );
    }

    let check_in = CheckIn {
        ip: client_ip(&headers),
    };

    let result = match endpoint {
        Endpoint::Enroll => enroll(&state, &env, &body).await,
        Endpoint::Config => config(&state, &env, &body, &check_in).await,
        Endpoint::Log => log(&state, &env, &body, &check_in).await,
        Endpoint::QueryRead => query_read(&state, &env, &body, &check_in).await,
        Endpoint::QueryWrite => query_write(&state, &env, &body, &check_in).await,
        Endpoint::CarveInit => carve_init(&state, &env, &body, &check_in).await,
        Endpoint::CarveBlock => carve_block(&state, &env, &body, &check_in).await,
        Endpoint::Flags => flags(&env, &body),
        Endpoint::Cert => cert(&env, &body),
        Endpoint::Verify => verify(&state, &env, &body, &check_in).await,
        Endpoint::Script => script(&state, &env, &body),
    };
    let response = result.unwrap_or_else(IntoResponse::into_response);

    if state.settings.metrics() {
        state
            .metrics
            .request(endpoint.name(), response.status().as_u16());
        if endpoint.ingests() {
            state.metrics.ingested(&env.name, endpoint.name(), body.len());
        }
    }
    Ok(response)
}

/// Serves the enroll or remove oneliner, e.g. `GET /prod/3f1c.../enroll.sh`.
///
/// The middle segment must equal the environment's secret path for the
/// requested action. A mismatch is reported as not found.
#[tracing::instrument(skip(state, secret_path, query))]
pub async fn quick_script(
    State(state): State<Arc<AppState>>,
    Path((environment, secret_path, script)): Path<(String, String, String)>,
    Query(query): Query<ScriptQuery>,
) -> Result<Response, AppError> {
    let env = state.environments.require(&environment)?;
    let (action, platform) = parse_script_name(&script, query.platform.as_deref())?;

    if !env.verify_secret_path(action, &secret_path) {
        tracing::warn!("[service] invalid secret path for {} script", env.name);
        return Err(AppError::NotFound("script".to_string()));
    }

    let text = state
        .nodes
        .quick_script(&env, action, platform)
        .map_err(|e| match e {
            CoreError::EnrollExpired | CoreError::RemoveExpired => {
                AppError::Forbidden(e.to_string())
            }
            other => AppError::from(other),
        })?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        text,
    )
        .into_response())
}

async fn enroll(state: &AppState, env: &Environment, body: &[u8]) -> Result<Response, AppError> {
    let mut request: EnrollRequest = parse(body)?;
    let details = std::mem::take(&mut request.host_details);
    let metadata = NodeMetadata::from_host_details(&request.platform_type, &details);

    let node_key = state
        .nodes
        .enroll(env, &request.enroll_secret, &request.host_identifier, metadata)
        .await?;

    if state.settings.debug_service() {
        tracing::debug!(
            "[service] enrolled {} in {}",
            request.host_identifier,
            env.name
        );
    }

    Ok(Json(EnrollResponse {
        node_key,
        node_invalid: false,
    })
    .into_response())
}

async fn config(
    state: &AppState,
    env: &Environment,
    body: &[u8],
    check_in: &CheckIn,
) -> Result<Response, AppError> {
    let request: NodeKeyRequest = parse(body)?;
    authenticate(state, env, &request.node_key, check_in).await?;

    let mut configuration = env.configuration();
    if let Value::Object(map) = &mut configuration {
        map.insert("node_invalid".to_string(), Value::Bool(false));
    }
    Ok(Json(configuration).into_response())
}

async fn log(
    state: &AppState,
    env: &Environment,
    body: &[u8],
    check_in: &CheckIn,
) -> Result<Response, AppError> {
    let mut request: LogRequest = parse(body)?;
    let node = authenticate(state, env, &request.node_key, check_in).await?;

    let kind: LogKind = request.log_type.parse()?;
    if !matches!(kind, LogKind::Status | LogKind::Result) {
        return Err(AppError::ValidationError(format!(
            "unsupported log type: {}",
            request.log_type
        )));
    }

    let entries = std::mem::take(&mut request.data);
    for mut entry in entries {
        if let Value::Object(map) = &mut entry {
            map.entry("node").or_insert_with(|| Value::String(node.uuid.clone()));
        }
        state.logger.submit(kind, &env.name, &entry).await?;
    }

    Ok(Json(NodeResponse::valid()).into_response())
}

async fn query_read(
    state: &AppState,
    env: &Environment,
    body: &[u8],
    check_in: &CheckIn,
) -> Result<Response, AppError> {
    let request: NodeKeyRequest = parse(body)?;
    let node = authenticate(state, env, &request.node_key, check_in).await?;

    let queries: BTreeMap<String, String> = state
        .queries
        .pending_for(&node)
        .await?
        .map(|query| (query.name, query.query))
        .collect();

    Ok(Json(ReadResponse {
        queries,
        node_invalid: false,
    })
    .into_response())
}

async fn query_write(
    state: &AppState,
    env: &Environment,
    body: &[u8],
    check_in: &CheckIn,
) -> Result<Response, AppError> {
    let mut request: WriteRequest = parse(body)?;
    let node = authenticate(state, env, &request.node_key, check_in).await?;

    let mut results = std::mem::take(&mut request.queries);
    // a query that failed on the node may only report a status
    for name in request.statuses.keys() {
        results.entry(name.clone()).or_insert(Value::Null);
    }

    for (name, rows) in results {
        let result = QueryResult {
            status: request.statuses.get(&name).copied().unwrap_or(0),
            message: request.messages.get(&name).filter(|m| !m.is_empty()).cloned(),
            rows,
        };
        match state.queries.submit_result(env, &node, &name, result).await {
            Ok(_) => {}
            Err(e) if e.class() == ErrorClass::Validation => {
                tracing::warn!("[service] dropping result for {}: {}", name, e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Json(NodeResponse::valid()).into_response())
}

async fn carve_init(
    state: &AppState,
    env: &Environment,
    body: &[u8],
    check_in: &CheckIn,
) -> Result<Response, AppError> {
    let request: CarveInitRequest = parse(body)?;
    let node = authenticate(state, env, &request.node_key, check_in).await?;

    let file = state
        .carves
        .init_carve(
            &node,
            CarveInit {
                carve_id: request.carve_id.clone(),
                request_id: request.request_id.clone(),
                block_count: request.block_count,
                block_size: request.block_size,
                carve_size: request.carve_size,
                path: None,
            },
        )
        .await?;

    Ok(Json(CarveInitResponse {
        session_id: file.session_id,
        success: true,
    })
    .into_response())
}

async fn carve_block(
    state: &AppState,
    env: &Environment,
    body: &[u8],
    check_in: &CheckIn,
) -> Result<Response, AppError> {
    let request: CarveBlockRequest = parse(body)?;
    let payload = BASE64
        .decode(request.data.as_bytes())
        .map_err(|e| AppError::ValidationError(format!("block data: {e}")))?;

    let outcome = state
        .carves
        .write_block(
            &env.uuid,
            &request.session_id,
            &request.request_id,
            request.block_id,
            payload,
        )
        .await?;

    // block requests carry no node key, the session names the node
    if let Err(e) = state
        .nodes
        .touch_uuid(&env.uuid, outcome.node(), check_in)
        .await
    {
        tracing::warn!("[service] unable to record check-in of {}: {}", outcome.node(), e);
    }

    if let BlockOutcome::Completed(file) = &outcome {
        tracing::info!(
            "[service] carve {} of {} from {} stored at {:?}",
            file.session_id,
            file.path,
            file.node,
            file.archive_location
        );
    }

    Ok(Json(CarveBlockResponse { success: true }).into_response())
}

fn flags(env: &Environment, body: &[u8]) -> Result<Response, AppError> {
    let request: SecretRequest = parse(body)?;
    check_secret(env, &request.secret)?;
    Ok(Json(FlagsResponse {
        flags: env.flags.clone(),
    })
    .into_response())
}

fn cert(env: &Environment, body: &[u8]) -> Result<Response, AppError> {
    let request: SecretRequest = parse(body)?;
    check_secret(env, &request.secret)?;
    Ok(Json(CertResponse {
        certificate: env.certificate.clone(),
    })
    .into_response())
}

async fn verify(
    state: &AppState,
    env: &Environment,
    body: &[u8],
    check_in: &CheckIn,
) -> Result<Response, AppError> {
    let request: VerifyRequest = parse(body)?;
    let valid = env.verify_secret(&request.secret);

    let node_valid = match request.node_key.as_deref() {
        Some(node_key) if valid => match authenticate(state, env, node_key, check_in).await {
            Ok(_) => true,
            Err(AppError::NodeInvalid) => false,
            Err(e) => return Err(e),
        },
        _ => false,
    };

    Ok(Json(VerifyResponse { valid, node_valid }).into_response())
}

fn script(state: &AppState, env: &Environment, body: &[u8]) -> Result<Response, AppError> {
    let request: ScriptRequest = parse(body)?;
    check_secret(env, &request.secret)?;
    let (action, platform) = parse_script_name(&request.script, request.platform.as_deref())?;
    let script = state.nodes.quick_script(env, action, platform)?;
    if action == ScriptAction::Remove {
        tracing::info!("[service] remove script requested for {}", env.name);
    }
    Ok(Json(ScriptResponse { script }).into_response())
}

/// Parses and validates a JSON body.
fn parse<T: DeserializeOwned + Validate>(body: &[u8]) -> Result<T, AppError> {
    let request: T = serde_json::from_slice(body).map_err(|e| {
        tracing::debug!("[service] malformed body: {}", e);
        AppError::ValidationError(e.to_string())
    })?;
    request.validate().map_err(|e| {
        tracing::error!("[service] validation failed: {}", e);
        AppError::ValidationError(e.to_string())
    })?;
    Ok(request)
}

fn check_secret(env: &Environment, secret: &str) -> Result<(), AppError> {
    if env.verify_secret(secret) {
        Ok(())
    } else {
        Err(CoreError::InvalidEnrollSecret.into())
    }
}

/// Resolves the node key and records the check-in.
async fn authenticate(
    state: &AppState,
    env: &Environment,
    node_key: &str,
    check_in: &CheckIn,
) -> Result<Node, AppError> {
    let node = state.nodes.authenticate(env, node_key).await?;
    state.nodes.touch(&node, check_in).await?;
    Ok(node)
}

/// First address of `X-Forwarded-For`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let real = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    forwarded.or(real).map(str::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use axum::http::{HeaderValue, StatusCode};

    // Integration tests using TestServer are in tests/http_integration.rs

    #[tokio::test]
    async fn test_health_returns_ok() {
        let response = health().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({"status": "ok"}));
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(&headers), None);

        headers.insert("x-real-ip", HeaderValue::from_static("10.0.0.2"));
        assert_eq!(client_ip(&headers).as_deref(), Some("10.0.0.2"));

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("192.0.2.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers).as_deref(), Some("192.0.2.7"));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(matches!(
            parse::<NodeKeyRequest>(b"{not json"),
            Err(AppError::ValidationError(_))
        ));
    }
}
