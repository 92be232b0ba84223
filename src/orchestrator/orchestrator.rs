//! Request Orchestrator
//!
//! Drives one function call through the session lifecycle:
//! 1. Read the session token from the cookie. An unreadable token is a 400.
//! 2. Send new clients elsewhere while this node rejects sessions (308).
//! 3. Send clients whose token names another current node back there (308).
//! 4. Create or lock the session. A session that moved since is cleaned up and the
//!    client redirected with a refreshed token.
//! 5. Run the handler on a spawned task with the session payload bound to it, renewing
//!    the lock's lease while it runs.
//! 6. Always refresh the session expiry and release the lock, whatever happened in 5.
//!
//! Steps 2 to 6 run on a task of their own: a caller that stops waiting (a client that
//! disconnects) cannot cut the lifecycle short before step 6.

use super::registry::{FunctionRegistry, RegisteredFunction};
use super::token::SessionToken;
use super::types::*;
use crate::connection::{Connection, ExecutionContext};
use crate::error::{ErmesError, ProtocolError};
use crate::keys::SessionId;
use crate::node::runtime::NodeRuntime;
use crate::offload::coordinator::now_ms;
use crate::offload::types::{AcquireOutcome, SessionLock};
use crate::store::driver::StoreConnection;
use crate::store::protocol::LOCK_LEASE_MS;
use crate::store::session::{INDICATOR_REQUESTS_SERVED, INDICATOR_SESSIONS_CREATED, data_key};

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, interval_at};

pub const HEADER_REQUEST_ID: &str = "X-session-request-id";
pub const RETRY_AFTER_SECS: &str = "5";

/// How often a running handler's lock lease is renewed.
const LEASE_RENEWAL: Duration = Duration::from_millis(LOCK_LEASE_MS / 3);

static REQUEST_ID_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .ok()
});

pub fn malformed_token_response() -> ErmesResponse {
    ErmesResponse::text(400, "400 Malformed session token.")
}

/// Reads the optional `X-session-request-id` header.
pub fn request_id(request: &ErmesRequest) -> Result<Option<String>, ErmesError> {
    let Some(raw) = request.header(HEADER_REQUEST_ID) else {
        return Ok(None);
    };

    let valid = REQUEST_ID_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(raw));
    if !valid {
        return Err(ErmesError::MalformedRequestId(raw.to_string()));
    }
    Ok(Some(raw.to_string()))
}

struct LockedSession {
    token: SessionToken,
    lock: SessionLock,
}

/// Session a request ended up with after step 4.
enum OpenedSession {
    Local(LockedSession),
    Moved(SessionToken),
}

/// Refreshes the expiry of a locked session and releases it. Only the first call does
/// anything.
pub struct SessionGuard {
    lock: SessionLock,
    done: AtomicBool,
}

impl SessionGuard {
    pub fn new(lock: SessionLock) -> Self {
        Self {
            lock,
            done: AtomicBool::new(false),
        }
    }

    /// Returns the new expiry, or `None` when it could not be set or the guard already ran.
    pub async fn cleanup(&self, runtime: &NodeRuntime, context: &ExecutionContext) -> Option<u64> {
        if self.done.swap(true, Ordering::SeqCst) {
            return None;
        }

        let session_id = &self.lock.session_id;
        let conn = match runtime.connections.acquire(context).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(
                    "No connection to release session {}, its lease will expire: {}",
                    session_id,
                    e
                );
                return None;
            }
        };

        let expires_at = match runtime.coordinator.refresh_expiry(&*conn, session_id).await {
            Ok(expires_at) => Some(expires_at),
            Err(e) => {
                tracing::warn!("Could not refresh expiry of session {}: {}", session_id, e);
                None
            }
        };

        if let Err(e) = runtime.coordinator.release(&*conn, &self.lock).await {
            tracing::error!("Could not release session {}: {}", session_id, e);
        }

        expires_at
    }
}

#[derive(Clone)]
pub struct RequestOrchestrator {
    runtime: Arc<NodeRuntime>,
    registry: Arc<FunctionRegistry>,
}

impl RequestOrchestrator {
    pub fn new(runtime: Arc<NodeRuntime>, registry: Arc<FunctionRegistry>) -> Self {
        Self { runtime, registry }
    }

    pub fn runtime(&self) -> &Arc<NodeRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    pub async fn handle(&self, function_name: &str, request: ErmesRequest) -> ErmesResponse {
        let orchestrator = self.clone();
        let function_name = function_name.to_string();
        let task = tokio::spawn(async move { orchestrator.process(&function_name, request).await });

        match task.await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Request task failed: {}", e);
                ErmesResponse::text(500, "500 Internal server error")
            }
        }
    }

    async fn process(&self, function_name: &str, request: ErmesRequest) -> ErmesResponse {
        let Some(function) = self.registry.get(function_name) else {
            return ErmesResponse::text(404, format!("404 Function <{}> not found", function_name));
        };

        let token = match self.session_token(&request) {
            Ok(token) => token,
            Err(e) => {
                tracing::error!("Malformed session token: {}", e);
                return malformed_token_response();
            }
        };
        let request_id = match request_id(&request) {
            Ok(request_id) => request_id,
            Err(e) => {
                tracing::error!("{}", e);
                return ErmesResponse::text(400, format!("400 {}", e));
            }
        };

        let context = ExecutionContext::new();
        let response = match self
            .dispatch(&context, &function, token, request_id, request)
            .await
        {
            Ok(response) => response,
            Err(e) => error_response(&e),
        };
        self.runtime.connections.end_context(&context);

        response
    }

    fn session_token(&self, request: &ErmesRequest) -> Result<Option<SessionToken>, ErmesError> {
        let cookie_name = &self.runtime.config.cookie_name;
        match request.header("cookie") {
            Some(cookie) => SessionToken::from_cookie_header(cookie, cookie_name),
            None => Ok(None),
        }
    }

    /// Where new clients go while this node rejects sessions.
    fn new_session_target(&self) -> Option<String> {
        self.runtime
            .config
            .redirect_to
            .clone()
            .or_else(|| self.runtime.parent().map(|parent| parent.gateway.clone()))
    }

    async fn dispatch(
        &self,
        context: &ExecutionContext,
        function: &RegisteredFunction,
        token: Option<SessionToken>,
        request_id: Option<String>,
        request: ErmesRequest,
    ) -> Result<ErmesResponse, ErmesError> {
        let rt = &self.runtime;
        let conn = rt.connections.acquire(context).await?;

        if token.is_none() && !rt.store.accepts_offloading(&*conn).await? {
            match self.new_session_target() {
                Some(target) => {
                    tracing::info!("Node rejects new sessions, redirecting client to {}", target);
                    return Ok(redirect(&target, &request.path_and_query));
                }
                None => tracing::warn!("Node rejects new sessions but has nowhere to send them"),
            }
        }

        if let Some(token) = &token
            && !token.is_current_at(rt.location_id())
        {
            tracing::info!(
                "Session {} lives at {}, redirecting client",
                token.session_id,
                token.current_location_id
            );
            return Ok(redirect(&token.current_node_ip, &request.path_and_query));
        }

        let session = match self.open_session(&*conn, token, &function.options).await? {
            OpenedSession::Local(session) => session,
            OpenedSession::Moved(token) => {
                tracing::info!(
                    "Session moved to {} as {}, redirecting client",
                    token.current_location_id,
                    token.session_id
                );
                let cookie = token.to_set_cookie(&rt.config.cookie_name)?;
                return Ok(redirect(&token.current_node_ip, &request.path_and_query)
                    .with_header("Set-Cookie", cookie));
            }
        };

        let guard = SessionGuard::new(session.lock.clone());
        let outcome = self
            .run_locked(context, conn, function, &session, request_id, request)
            .await;
        let expires_at = guard.cleanup(rt, context).await;
        let response = outcome?;

        let token = SessionToken {
            last_access_at: now_ms(),
            expires_at: expires_at.or(session.token.expires_at),
            ..session.token
        };
        Ok(response.with_header("Set-Cookie", token.to_set_cookie(&rt.config.cookie_name)?))
    }

    async fn open_session(
        &self,
        conn: &dyn StoreConnection,
        token: Option<SessionToken>,
        options: &HandlerOptions,
    ) -> Result<OpenedSession, ErmesError> {
        let rt = &self.runtime;
        let mode = options.lock_mode();

        if let Some(token) = token {
            match rt
                .coordinator
                .acquire(conn, &token.session_id, mode, options.execution_during_offload)
                .await
            {
                Ok(AcquireOutcome::Acquired(lock)) => {
                    return Ok(OpenedSession::Local(LockedSession { token, lock }));
                }
                Ok(AcquireOutcome::Moved(forward)) => {
                    // The forward stays: older tokens may still lead here.
                    match rt.store.clear_requests(conn, &token.session_id).await {
                        Ok(0) => {}
                        Ok(removed) => tracing::debug!(
                            "Dropped {} stale request ids of session {}",
                            removed,
                            token.session_id
                        ),
                        Err(e) => tracing::warn!(
                            "Could not clean up session {}: {}",
                            token.session_id,
                            e
                        ),
                    }
                    return Ok(OpenedSession::Moved(token.moved_to(&forward)?));
                }
                Err(ErmesError::Protocol(ProtocolError::SessionNotFound(_))) => {
                    tracing::info!(
                        "Session {} no longer exists, starting a new one",
                        token.session_id
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let lock = rt.coordinator.create_and_acquire(conn, mode, None).await?;
        if let Err(e) = rt.store.bump(conn, INDICATOR_SESSIONS_CREATED).await {
            tracing::warn!("Could not count session {}: {}", lock.session_id, e);
        }
        Ok(OpenedSession::Local(LockedSession {
            token: SessionToken::new(lock.session_id.clone(), &rt.local, now_ms()),
            lock,
        }))
    }

    async fn run_locked(
        &self,
        context: &ExecutionContext,
        conn: Connection,
        function: &RegisteredFunction,
        locked: &LockedSession,
        request_id: Option<String>,
        request: ErmesRequest,
    ) -> Result<ErmesResponse, ErmesError> {
        let rt = &self.runtime;
        let token = &locked.token;
        let session_id = &token.session_id;

        if let Some(request_id) = &request_id {
            let expires_at = Some(rt.coordinator.next_expiry());
            let first_time = rt
                .store
                .record_request(&*conn, session_id, request_id, expires_at)
                .await?;
            if !first_time {
                tracing::info!(
                    "Request {} on session {} was already processed",
                    request_id,
                    session_id
                );
                return Ok(ErmesResponse::text(
                    208,
                    "208 Header X-session-request-id was already processed",
                ));
            }
        }

        let payload = load_payload(rt, &*conn, session_id).await?;
        let session = SessionContext::new(token.clone(), function.options.lock_mode(), payload);

        let conn = if function.options.reuse_internal_connection {
            Some(conn)
        } else {
            drop(conn);
            None
        };

        let handler = function.handler.clone();
        let handler_session = session.clone();
        let task = tokio::spawn(async move { handler(request, handler_session).await });
        let outcome = self.await_renewing(context, &locked.lock, task).await;

        let conn = match conn {
            Some(conn) => conn,
            None => rt.connections.acquire(context).await?,
        };

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::error!("Function failed on session {}: {:#}", session_id, e);
                forget_request(rt, &*conn, session_id, request_id.as_deref()).await;
                return Ok(match e.downcast_ref::<ErmesError>() {
                    Some(e) => error_response(e),
                    None => ErmesResponse::text(500, "500 Internal server error"),
                });
            }
            Err(e) => {
                tracing::error!("Function panicked on session {}: {}", session_id, e);
                forget_request(rt, &*conn, session_id, request_id.as_deref()).await;
                return Ok(ErmesResponse::text(500, "500 Internal server error"));
            }
        };

        if session.is_dirty() && !session.is_read_only() {
            let bytes = serde_json::to_vec(&session.snapshot().await)?;
            rt.store.write_payload(&*conn, session_id, &bytes).await?;
        }
        if let Err(e) = rt.store.bump(&*conn, INDICATOR_REQUESTS_SERVED).await {
            tracing::warn!("Could not count request on session {}: {}", session_id, e);
        }

        Ok(response)
    }

    /// Waits for `task`, renewing `lock`'s lease meanwhile. Renewal stops once the lease
    /// is gone, e.g. because the session was offloaded underneath the handler.
    async fn await_renewing<T>(
        &self,
        context: &ExecutionContext,
        lock: &SessionLock,
        mut task: JoinHandle<T>,
    ) -> Result<T, JoinError> {
        let mut ticker = interval_at(Instant::now() + LEASE_RENEWAL, LEASE_RENEWAL);
        let mut renewing = true;

        loop {
            tokio::select! {
                outcome = &mut task => return outcome,
                _ = ticker.tick(), if renewing => {
                    renewing = self.renew_lease(context, lock).await;
                }
            }
        }
    }

    async fn renew_lease(&self, context: &ExecutionContext, lock: &SessionLock) -> bool {
        let rt = &self.runtime;
        let result = match rt.connections.acquire(context).await {
            Ok(conn) => rt.coordinator.renew(&*conn, lock).await,
            Err(e) => Err(ErmesError::from(e)),
        };

        match result {
            Ok(()) => true,
            Err(ErmesError::Protocol(e @ ProtocolError::NotHeld(_))) => {
                tracing::warn!("Lock on session {} is gone: {}", lock.session_id, e);
                false
            }
            Err(e) => {
                tracing::warn!("Could not renew lock on session {}: {}", lock.session_id, e);
                true
            }
        }
    }
}

async fn load_payload(
    runtime: &NodeRuntime,
    conn: &dyn StoreConnection,
    session_id: &SessionId,
) -> Result<Map<String, Value>, ErmesError> {
    match runtime.store.get(conn, &data_key(session_id)).await? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
        None => Ok(Map::new()),
    }
}

async fn forget_request(
    runtime: &NodeRuntime,
    conn: &dyn StoreConnection,
    session_id: &SessionId,
    request_id: Option<&str>,
) {
    if let Some(request_id) = request_id
        && let Err(e) = runtime.store.forget_request(conn, session_id, request_id).await
    {
        tracing::warn!(
            "Could not forget request {} on session {}: {}",
            request_id,
            session_id,
            e
        );
    }
}

fn redirect(base: &str, path_and_query: &str) -> ErmesResponse {
    let location = format!("{}{}", base.trim_end_matches('/'), path_and_query);
    ErmesResponse::text(308, format!("308 Redirecting to {}", location))
        .with_header("Location", location)
}

fn error_response(e: &ErmesError) -> ErmesResponse {
    let status = e.status_code();
    if status.is_server_error() && !e.is_retryable() {
        tracing::error!("Request failed: {}", e);
    }

    let response = ErmesResponse::text(status.as_u16(), format!("{} {}", status.as_u16(), e));
    if e.is_retryable() {
        response.with_header("Retry-After", RETRY_AFTER_SECS)
    } else {
        response
    }
}
