use super::orchestrator::{RequestOrchestrator, malformed_token_response};
use super::types::{ErmesRequest, ErmesResponse};
use crate::error::ErmesError;

use axum::{
    Extension,
    body::{Body, Bytes},
    extract::Path,
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::sync::Arc;

/// Flattens request headers into lowercase names. Repeated `cookie` headers (HTTP/2 sends
/// one per cookie) are joined with `; `, other repeated headers with `, `. A cookie that is
/// not visible ASCII cannot carry a session token and fails the whole request.
pub fn request_headers(headers: &HeaderMap) -> Result<HashMap<String, String>, ErmesError> {
    let mut flat: HashMap<String, String> = HashMap::new();

    for (name, value) in headers {
        let is_cookie = *name == header::COOKIE;
        let value = match value.to_str() {
            Ok(value) => value,
            Err(_) if is_cookie => {
                return Err(ErmesError::MalformedToken("cookie header is not ASCII".into()));
            }
            Err(_) => {
                tracing::debug!("Ignoring non-ASCII header {}", name);
                continue;
            }
        };

        let separator = if is_cookie { "; " } else { ", " };
        flat.entry(name.as_str().to_string())
            .and_modify(|joined| {
                joined.push_str(separator);
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    Ok(flat)
}

pub async fn handle_function(
    Extension(orchestrator): Extension<Arc<RequestOrchestrator>>,
    Path(name): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let headers = match request_headers(&headers) {
        Ok(headers) => headers,
        Err(e) => {
            tracing::error!("Malformed session token: {}", e);
            return malformed_token_response().into_response();
        }
    };

    let request = ErmesRequest {
        method: method.to_string(),
        path_and_query,
        headers,
        body: body.to_vec(),
    };

    orchestrator.handle(&name, request).await.into_response()
}

impl IntoResponse for ErmesResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        for (name, value) in self.headers {
            match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => tracing::warn!("Dropping invalid response header {}", name),
            }
        }
        response
    }
}
