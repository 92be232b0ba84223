//! Peer Client
//!
//! Outbound side of the peer protocol. Transport failures are retried with capped
//! exponential backoff; an HTTP error status is an answer and is returned as is.

use super::protocol::*;
use crate::error::ErmesError;
use crate::keys::SessionId;
use crate::offload::retry::RetryPolicy;
use crate::offload::types::SessionSnapshot;
use crate::orchestrator::token::SessionToken;

use anyhow::Result;
use reqwest::{Method, StatusCode};
use std::time::Duration;

pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);
pub const PEER_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct PeerClient {
    http_client: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl PeerClient {
    pub fn new() -> Result<Self> {
        Self::with_limits(PEER_TIMEOUT, PEER_ATTEMPTS)
    }

    pub fn with_limits(timeout: Duration, attempts: usize) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(PEER_USER_AGENT)
            .build()?;

        Ok(Self {
            http_client,
            timeout,
            retry: RetryPolicy::with_attempts(attempts),
        })
    }

    /// Sends one request, retrying only when no answer came back at all.
    async fn send(
        &self,
        method: Method,
        url: &str,
        headers: &[(&str, String)],
    ) -> Result<reqwest::Response, ErmesError> {
        let client = &self.http_client;
        let timeout = self.timeout;
        let method = &method;

        self.retry
            .run(
                || async move {
                    let mut request = client.request(method.clone(), url).timeout(timeout);
                    for (name, value) in headers {
                        request = request.header(*name, value);
                    }
                    request.send().await.map_err(http_error)
                },
                |e| matches!(e, ErmesError::Peer(_)),
            )
            .await
    }

    /// Asks `target` to take over the session described by `token`.
    pub async fn offload_session(
        &self,
        target: &str,
        token: &SessionToken,
    ) -> Result<OffloadReceipt, ErmesError> {
        let url = peer_url(target, ENDPOINT_OFFLOAD_SESSION);
        let headers = [(HEADER_SESSION_TOKEN, token.to_header()?)];
        let response = self.send(Method::POST, &url, &headers).await?;

        Ok(expect_success(&url, response).await?.json().await.map_err(http_error)?)
    }

    /// Pulls the record fields and payload of a session pending offload on `source`.
    pub async fn migrate_session(
        &self,
        source: &str,
        session_id: &SessionId,
    ) -> Result<SessionSnapshot, ErmesError> {
        let url = format!(
            "{}?session={}&data-type={}",
            peer_url(source, ENDPOINT_MIGRATE_SESSION),
            session_id,
            DataType::SessionData.as_str()
        );
        let response = self.send(Method::GET, &url, &[]).await?;

        let migrated: MigratedSession =
            expect_success(&url, response).await?.json().await.map_err(http_error)?;
        migrated.try_into()
    }

    pub async fn migrate_request_ids(
        &self,
        source: &str,
        session_id: &SessionId,
    ) -> Result<Vec<String>, ErmesError> {
        let url = format!(
            "{}?session={}&data-type={}",
            peer_url(source, ENDPOINT_MIGRATE_SESSION),
            session_id,
            DataType::RequestIds.as_str()
        );
        let response = self.send(Method::GET, &url, &[]).await?;

        let migrated: MigratedRequestIds =
            expect_success(&url, response).await?.json().await.map_err(http_error)?;
        Ok(migrated.request_ids)
    }

    /// Tells the proprietary node that its session `origin` now lives where `token` says.
    pub async fn update_session(
        &self,
        proprietary: &str,
        origin: &str,
        token: &SessionToken,
    ) -> Result<(), ErmesError> {
        let url = format!(
            "{}?origin={}",
            peer_url(proprietary, ENDPOINT_UPDATE_SESSION),
            origin
        );
        let headers = [(HEADER_SESSION_TOKEN, token.to_header()?)];
        let response = self.send(Method::GET, &url, &headers).await?;

        expect_success(&url, response).await?;
        Ok(())
    }

    /// Asks `parent` for one of its sessions. Returns the token and the nonce that must
    /// accompany the release, or `None` when the parent has nothing to hand over.
    pub async fn onload_get_session(
        &self,
        parent: &str,
        location_id: &str,
    ) -> Result<Option<(SessionToken, String)>, ErmesError> {
        let url = format!(
            "{}?action={}",
            peer_url(parent, ENDPOINT_ONLOAD_SESSION),
            OnloadAction::GetSession.as_str()
        );
        let headers = [(HEADER_ONLOAD_LOCATION, location_id.to_string())];
        let response = self.send(Method::GET, &url, &headers).await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let response = expect_success(&url, response).await?;

        let nonce = response
            .headers()
            .get(HEADER_RANDOM_VALUE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ErmesError::Peer(format!("{} sent no {}", url, HEADER_RANDOM_VALUE))
            })?;
        let token: SessionToken = response.json().await.map_err(http_error)?;

        Ok(Some((token, nonce)))
    }

    /// Completes (with `new_session`) or cancels (without) an onload started by
    /// `onload_get_session`.
    pub async fn onload_release_session(
        &self,
        parent: &str,
        location_id: &str,
        session_id: &SessionId,
        nonce: &str,
        new_session: Option<&SessionId>,
    ) -> Result<(), ErmesError> {
        let mut url = format!(
            "{}?action={}&session={}&random-value={}",
            peer_url(parent, ENDPOINT_ONLOAD_SESSION),
            OnloadAction::ReleaseSession.as_str(),
            session_id,
            nonce
        );
        if let Some(new_session) = new_session {
            url.push_str(&format!("&new-session={}", new_session));
        }

        let headers = [(HEADER_ONLOAD_LOCATION, location_id.to_string())];
        let response = self.send(Method::GET, &url, &headers).await?;

        expect_success(&url, response).await?;
        Ok(())
    }

    pub async fn force_offload(
        &self,
        gateway: &str,
        session_id: &SessionId,
    ) -> Result<OffloadReceipt, ErmesError> {
        let url = peer_url(gateway, ENDPOINT_FORCE_OFFLOAD);
        let headers = [(HEADER_FORCED_SESSION, session_id.to_string())];
        let response = self.send(Method::POST, &url, &headers).await?;

        Ok(expect_success(&url, response).await?.json().await.map_err(http_error)?)
    }

    pub async fn status(&self, gateway: &str) -> Result<NodeStatus, ErmesError> {
        let url = peer_url(gateway, ENDPOINT_STATUS);
        let response = self.send(Method::GET, &url, &[]).await?;

        Ok(expect_success(&url, response).await?.json().await.map_err(http_error)?)
    }
}

pub fn peer_url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

async fn expect_success(
    url: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ErmesError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = match response.json::<ErrorResponse>().await {
        Ok(body) => body.error,
        Err(_) => String::new(),
    };
    Err(ErmesError::Peer(format!("{} answered {} {}", url, status, detail)))
}

fn http_error(e: reqwest::Error) -> ErmesError {
    ErmesError::Peer(e.to_string())
}
