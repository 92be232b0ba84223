use super::protocol::*;
use super::service::MigrationService;
use crate::error::ErmesError;
use crate::keys::SessionId;
use crate::orchestrator::token::SessionToken;

use axum::{
    Extension, Json,
    extract::Query,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

fn error_response(e: &ErmesError) -> Response {
    (
        e.status_code(),
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

fn bad_request(message: String) -> Response {
    tracing::error!("{}", message);
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: message })).into_response()
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, Response> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| bad_request(format!("Header {} is not present", name)))
}

fn token_header(headers: &HeaderMap) -> Result<SessionToken, Response> {
    let raw = required_header(headers, HEADER_SESSION_TOKEN)?;
    SessionToken::from_header(raw).map_err(|e| bad_request(e.to_string()))
}

pub async fn handle_offload_session(
    Extension(service): Extension<Arc<MigrationService>>,
    headers: HeaderMap,
) -> Response {
    let token = match token_header(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };

    match service.accept_offload(&token).await {
        Ok(receipt) => (StatusCode::OK, Json(receipt)).into_response(),
        Err(e) => {
            tracing::error!("Failed to accept session {}: {}", token.session_id, e);
            error_response(&e)
        }
    }
}

pub async fn handle_migrate_session(
    Extension(service): Extension<Arc<MigrationService>>,
    Query(query): Query<MigrateQuery>,
) -> Response {
    let session_id = match SessionId::parse(&query.session) {
        Ok(session_id) => session_id,
        Err(e) => return bad_request(format!("Session <{}> is not valid: {}", query.session, e)),
    };
    let Some(data_type) = DataType::parse(&query.data_type) else {
        return bad_request(format!("Data-type <{}> not recognized", query.data_type));
    };

    let result = match data_type {
        DataType::SessionData => service
            .serve_session_data(&session_id)
            .await
            .map(|snapshot| Json(MigratedSession::from(&snapshot)).into_response()),
        DataType::RequestIds => service
            .serve_request_ids(&session_id)
            .await
            .map(|request_ids| Json(MigratedRequestIds { request_ids }).into_response()),
    };

    result.unwrap_or_else(|e| {
        tracing::error!(
            "Failed to migrate {} of session {}: {}",
            data_type.as_str(),
            session_id,
            e
        );
        error_response(&e)
    })
}

pub async fn handle_force_offload(
    Extension(service): Extension<Arc<MigrationService>>,
    headers: HeaderMap,
) -> Response {
    let raw = match required_header(&headers, HEADER_FORCED_SESSION) {
        Ok(raw) => raw,
        Err(response) => return response,
    };
    let session_id = match SessionId::parse(raw) {
        Ok(session_id) => session_id,
        Err(e) => return bad_request(format!("Session <{}> is not valid: {}", raw, e)),
    };

    match service.force_offload(&session_id).await {
        Ok(forward) => (
            StatusCode::OK,
            Json(OffloadReceipt {
                session_id: forward.session_id,
                location_id: forward.location_id,
                endpoint: forward.endpoint,
            }),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Forced offload of session {} failed: {}", session_id, e);
            error_response(&e)
        }
    }
}

pub async fn handle_update_session(
    Extension(service): Extension<Arc<MigrationService>>,
    Query(query): Query<UpdateQuery>,
    headers: HeaderMap,
) -> Response {
    let token = match token_header(&headers) {
        Ok(token) => token,
        Err(response) => return response,
    };

    match service.update_session(&query.origin, &token).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::error!("Failed to update session {}: {}", query.origin, e);
            error_response(&e)
        }
    }
}

pub async fn handle_onload_session(
    Extension(service): Extension<Arc<MigrationService>>,
    Query(query): Query<OnloadQuery>,
    headers: HeaderMap,
) -> Response {
    let location_id = match required_header(&headers, HEADER_ONLOAD_LOCATION) {
        Ok(location_id) => location_id,
        Err(response) => return response,
    };

    match OnloadAction::parse(&query.action) {
        Some(OnloadAction::GetSession) => match service.serve_onload_get(location_id).await {
            Ok(Some((token, nonce))) => {
                ([(HEADER_RANDOM_VALUE, nonce)], Json(token)).into_response()
            }
            Ok(None) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => {
                tracing::error!("Failed to pick a session for {}: {}", location_id, e);
                error_response(&e)
            }
        },
        Some(OnloadAction::ReleaseSession) => {
            let (Some(session), Some(random_value)) = (&query.session, &query.random_value) else {
                return bad_request("release-session needs session and random-value".to_string());
            };

            let new_session = query.new_session.as_deref();
            match service
                .serve_onload_release(session, random_value, new_session, location_id)
                .await
            {
                Ok(()) => StatusCode::OK.into_response(),
                Err(e) => {
                    tracing::error!("Failed to release session {}: {}", session, e);
                    error_response(&e)
                }
            }
        }
        None => bad_request(format!("Action <{}> not recognized", query.action)),
    }
}

pub async fn handle_request_onload(
    Extension(service): Extension<Arc<MigrationService>>,
) -> Response {
    match service.request_onload().await {
        Ok(Some(receipt)) => (StatusCode::OK, Json(receipt)).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!("Onload failed: {}", e);
            error_response(&e)
        }
    }
}

pub async fn handle_garbage_collector(
    Extension(service): Extension<Arc<MigrationService>>,
    Query(query): Query<GarbageQuery>,
) -> Response {
    let Some(policy) = CollectionPolicy::parse(&query.policy) else {
        return bad_request(format!("Policy <{}> not recognized", query.policy));
    };

    match service.garbage_collect(&query.session, policy).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::error!("Failed to collect session {}: {}", query.session, e);
            error_response(&e)
        }
    }
}

pub async fn handle_offload_status(
    Extension(service): Extension<Arc<MigrationService>>,
    Query(query): Query<OffloadStatusQuery>,
) -> Response {
    let accept = match query.status.as_str() {
        "accept" => true,
        "reject" => false,
        other => return bad_request(format!("Status <{}> not recognized", other)),
    };

    match service.set_offload_status(accept).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            tracing::error!("Failed to set offloading status: {}", e);
            error_response(&e)
        }
    }
}

pub async fn handle_status(Extension(service): Extension<Arc<MigrationService>>) -> Response {
    match service.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => {
            tracing::error!("Failed to read node status: {}", e);
            error_response(&e)
        }
    }
}
