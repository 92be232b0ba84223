//! Orchestrator Tests
//!
//! Runs function calls through a single node backed by the in-process store.
//!
//! ## Test Scopes
//! - **Token**: cookie, header and forward handling of the session token.
//! - **Context & registry**: what a handler can see and change.
//! - **Lifecycle**: session creation, persistence, deduplication, failures.
//! - **Routing**: redirects for foreign tokens, moved sessions and rejecting nodes.

#[cfg(test)]
mod tests {
    use crate::config::{DEFAULT_COOKIE_NAME, NodeConfig};
    use crate::connection::ExecutionContext;
    use crate::error::ErmesError;
    use crate::keys::SessionId;
    use crate::node::runtime::NodeRuntime;
    use crate::offload::coordinator::now_ms;
    use crate::offload::types::*;
    use crate::orchestrator::orchestrator::*;
    use crate::orchestrator::registry::FunctionRegistry;
    use crate::orchestrator::token::SessionToken;
    use crate::orchestrator::types::*;
    use crate::store::memory::MemoryBackend;
    use crate::topology::resolver::Topology;
    use serde_json::{Map, Value, json};
    use std::sync::Arc;
    use crate::orchestrator::handlers::request_headers;
    use axum::http::{HeaderMap, HeaderValue, header};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const TREE: &str = r#"{
        "areaTypesIdentifiers": ["region", "city"],
        "hierarchy": [{
            "areaName": "Lombardy",
            "mainLocation": { "locationId": "lom", "gateway": "http://lom:8080" },
            "areas": [
                {
                    "areaName": "Milan",
                    "mainLocation": { "locationId": "mi", "gateway": "http://mi:8080" }
                }
            ]
        }]
    }"#;

    const REQUEST_ID: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";

    fn registry() -> Arc<FunctionRegistry> {
        let registry = FunctionRegistry::new();

        registry.register("counter", HandlerOptions::default(), |_request, session| async move {
            let count = session
                .get("count")
                .await
                .and_then(|value| value.as_i64())
                .unwrap_or(0)
                + 1;
            session.set("count", Value::from(count)).await?;
            Ok(ErmesResponse::json(200, &json!({ "count": count }))?)
        });

        registry.register("peek", HandlerOptions::read_only(), |_request, session| async move {
            Ok(ErmesResponse::json(200, &session.snapshot().await)?)
        });

        registry.register("tamper", HandlerOptions::read_only(), |_request, session| async move {
            session.set("count", Value::from(1000)).await?;
            Ok(ErmesResponse::new(200))
        });

        registry
    }

    fn orchestrator_with(
        config: NodeConfig,
        registry: Arc<FunctionRegistry>,
    ) -> RequestOrchestrator {
        let topology = Topology::from_json(TREE.as_bytes()).unwrap();
        let runtime = NodeRuntime::new(config, topology, Arc::new(MemoryBackend::new())).unwrap();
        RequestOrchestrator::new(Arc::new(runtime), registry)
    }

    fn orchestrator() -> (RequestOrchestrator, Arc<NodeRuntime>) {
        let orchestrator = orchestrator_with(NodeConfig::new("mi"), registry());
        let runtime = runtime_of(&orchestrator);
        (orchestrator, runtime)
    }

    fn runtime_of(orchestrator: &RequestOrchestrator) -> Arc<NodeRuntime> {
        orchestrator.runtime().clone()
    }

    /// `name=value` part of the response's `Set-Cookie`.
    fn cookie_of(response: &ErmesResponse) -> String {
        let set_cookie = response.header("Set-Cookie").expect("Set-Cookie header");
        set_cookie
            .split("; Path=/")
            .next()
            .unwrap()
            .to_string()
    }

    fn token_of(response: &ErmesResponse) -> SessionToken {
        SessionToken::from_cookie_header(&cookie_of(response), DEFAULT_COOKIE_NAME)
            .unwrap()
            .unwrap()
    }

    fn body_json(response: &ErmesResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    fn call() -> ErmesRequest {
        ErmesRequest::new("GET", "/function/counter")
    }

    async fn state(runtime: &NodeRuntime, session_id: &SessionId) -> SessionState {
        runtime
            .with_connection(|conn| async move {
                runtime.store.read_record(&*conn, session_id).await
            })
            .await
            .unwrap()
            .expect("session record")
            .state(now_ms())
    }

    // ============================================================
    // TOKEN TESTS
    // ============================================================

    fn sample_token() -> SessionToken {
        let node = crate::topology::types::Node {
            location_id: "mi".into(),
            gateway: "http://mi:8080".into(),
            gateway_password: None,
            store_host: None,
            store_port: None,
            store_password: None,
        };
        SessionToken::new(SessionId::new(), &node, 1_700_000_000_000)
    }

    #[test]
    fn test_token_found_among_other_cookies() {
        let token = sample_token();
        let set_cookie = token.to_set_cookie(DEFAULT_COOKIE_NAME).unwrap();
        let pair = set_cookie.split("; Path=/").next().unwrap();
        let header = format!("theme=dark; {}; lang=it", pair);

        let found = SessionToken::from_cookie_header(&header, DEFAULT_COOKIE_NAME).unwrap();

        assert_eq!(found, Some(token));
        assert!(set_cookie.ends_with("; Path=/; HttpOnly"));
    }

    #[test]
    fn test_missing_cookie_is_not_an_error() {
        let found = SessionToken::from_cookie_header("theme=dark", DEFAULT_COOKIE_NAME).unwrap();

        assert!(found.is_none());
    }

    #[test]
    fn test_token_header_round_trip() {
        let token = sample_token();

        let header = token.to_header().unwrap();

        assert!(!header.contains('{'));
        assert_eq!(SessionToken::from_header(&header).unwrap(), token);
        assert!(matches!(
            SessionToken::from_header("%%%"),
            Err(ErmesError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_moved_token_keeps_its_origin() {
        let token = sample_token();
        let new_id = SessionId::new();
        let forward = ForwardingRecord {
            endpoint: "http://lom:8080".into(),
            session_id: new_id.to_string(),
            location_id: "lom".into(),
        };

        let moved = token.moved_to(&forward).unwrap();

        assert_eq!(moved.session_id, new_id);
        assert!(moved.is_current_at("lom"));
        assert!(moved.is_proprietary("mi"));
        assert_eq!(moved.created_at, token.created_at);

        let bad = ForwardingRecord {
            session_id: "short".into(),
            ..forward
        };
        assert!(matches!(token.moved_to(&bad), Err(ErmesError::MalformedToken(_))));
    }

    #[test]
    fn test_request_id_header_validation() {
        assert_eq!(request_id(&call()).unwrap(), None);

        let valid = call().with_header(HEADER_REQUEST_ID, REQUEST_ID);
        assert_eq!(request_id(&valid).unwrap().as_deref(), Some(REQUEST_ID));

        let invalid = call().with_header(HEADER_REQUEST_ID, "42");
        assert!(matches!(
            request_id(&invalid),
            Err(ErmesError::MalformedRequestId(_))
        ));
    }

    #[test]
    fn test_repeated_cookie_headers_are_joined() {
        let token = sample_token();
        let set_cookie = token.to_set_cookie(DEFAULT_COOKIE_NAME).unwrap();
        let pair = set_cookie.split("; Path=/").next().unwrap();
        let mut headers = HeaderMap::new();
        headers.append(header::COOKIE, HeaderValue::from_str(pair).unwrap());
        headers.append(header::COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(header::ACCEPT, HeaderValue::from_static("text/html"));
        headers.append(header::ACCEPT, HeaderValue::from_static("application/json"));

        let flat = request_headers(&headers).unwrap();

        assert_eq!(flat["cookie"], format!("{}; theme=dark", pair));
        assert_eq!(flat["accept"], "text/html, application/json");
        let found = SessionToken::from_cookie_header(&flat["cookie"], DEFAULT_COOKIE_NAME)
            .unwrap()
            .unwrap();
        assert_eq!(found.session_id, token.session_id);
    }

    #[test]
    fn test_non_ascii_cookie_is_malformed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_bytes(b"ermes=\xff").unwrap());
        headers.insert("x-note", HeaderValue::from_bytes(b"caf\xe9").unwrap());

        assert!(matches!(
            request_headers(&headers),
            Err(ErmesError::MalformedToken(_))
        ));

        headers.remove(header::COOKIE);
        let flat = request_headers(&headers).unwrap();
        assert!(!flat.contains_key("x-note"));
    }

    // ============================================================
    // CONTEXT & REGISTRY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_shared_context_refuses_writes() {
        let mut payload = Map::new();
        payload.insert("count".into(), Value::from(3));
        let session = SessionContext::new(sample_token(), LockMode::Shared, payload);

        assert_eq!(session.get("count").await, Some(Value::from(3)));
        assert!(matches!(
            session.set("count", Value::from(4)).await,
            Err(ErmesError::ReadOnlySession)
        ));
        assert!(matches!(session.remove("count").await, Err(ErmesError::ReadOnlySession)));
        assert!(!session.is_dirty());
    }

    #[tokio::test]
    async fn test_exclusive_context_tracks_changes() {
        let session = SessionContext::new(sample_token(), LockMode::Exclusive, Map::new());
        let clone = session.clone();

        assert_eq!(session.remove("missing").await.unwrap(), None);
        assert!(!session.is_dirty());

        clone.set("cart", json!(["apple"])).await.unwrap();

        assert!(session.is_dirty());
        assert_eq!(session.get("cart").await, Some(json!(["apple"])));
    }

    #[test]
    fn test_registry_lookups() {
        let registry = registry();

        assert_eq!(registry.function_count(), 3);
        assert!(registry.has_function("peek"));
        assert!(!registry.has_function("missing"));
        assert!(registry.get("peek").unwrap().options.read_only);

        let mut names = registry.list_functions();
        names.sort();
        assert_eq!(names, vec!["counter", "peek", "tamper"]);
    }

    // ============================================================
    // LIFECYCLE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_unknown_function_is_404() {
        let (orchestrator, _) = orchestrator();

        let response = orchestrator.handle("missing", call()).await;

        assert_eq!(response.status, 404);
    }

    #[tokio::test]
    async fn test_new_client_gets_a_session_cookie() {
        let (orchestrator, runtime) = orchestrator();

        let response = orchestrator.handle("counter", call()).await;

        assert_eq!(response.status, 200);
        assert_eq!(body_json(&response), json!({ "count": 1 }));

        let token = token_of(&response);
        assert!(token.is_current_at("mi"));
        assert!(token.is_proprietary("mi"));
        assert!(token.expires_at.unwrap() > now_ms());
        assert_eq!(state(&runtime, &token.session_id).await, SessionState::Unlocked);
    }

    #[tokio::test]
    async fn test_payload_persists_between_requests() {
        let (orchestrator, runtime) = orchestrator();

        let first = orchestrator.handle("counter", call()).await;
        let cookie = cookie_of(&first);
        let second = orchestrator
            .handle("counter", call().with_header("Cookie", cookie.clone()))
            .await;
        let peek = orchestrator
            .handle(
                "peek",
                ErmesRequest::new("GET", "/function/peek").with_header("Cookie", cookie),
            )
            .await;

        assert_eq!(body_json(&second), json!({ "count": 2 }));
        assert_eq!(token_of(&second).session_id, token_of(&first).session_id);
        assert_eq!(body_json(&peek), json!({ "count": 2 }));

        let rt = runtime.as_ref();
        let indicators = rt
            .with_connection(|conn| async move { rt.store.indicators(&*conn).await })
            .await
            .unwrap();
        assert_eq!(indicators.sessions_created, 1);
        assert_eq!(indicators.requests_served, 3);
    }

    #[tokio::test]
    async fn test_read_only_function_cannot_write() {
        let (orchestrator, _) = orchestrator();
        let first = orchestrator.handle("counter", call()).await;

        let response = orchestrator
            .handle(
                "tamper",
                ErmesRequest::new("POST", "/function/tamper")
                    .with_header("Cookie", cookie_of(&first)),
            )
            .await;
        let after = orchestrator
            .handle("counter", call().with_header("Cookie", cookie_of(&first)))
            .await;

        assert_eq!(response.status, 409);
        assert_eq!(body_json(&after), json!({ "count": 2 }));
    }

    #[tokio::test]
    async fn test_malformed_cookie_is_400() {
        let (orchestrator, _) = orchestrator();

        let request = call().with_header("Cookie", format!("{}={{not json", DEFAULT_COOKIE_NAME));
        let response = orchestrator.handle("counter", request).await;

        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_malformed_request_id_is_400() {
        let (orchestrator, _) = orchestrator();

        let response = orchestrator
            .handle("counter", call().with_header(HEADER_REQUEST_ID, "not-a-uuid"))
            .await;

        assert_eq!(response.status, 400);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_208() {
        let (orchestrator, _) = orchestrator();

        let first = orchestrator
            .handle("counter", call().with_header(HEADER_REQUEST_ID, REQUEST_ID))
            .await;
        let cookie = cookie_of(&first);
        let duplicate = orchestrator
            .handle(
                "counter",
                call()
                    .with_header("Cookie", cookie.clone())
                    .with_header(HEADER_REQUEST_ID, REQUEST_ID),
            )
            .await;
        let next = orchestrator
            .handle("counter", call().with_header("Cookie", cookie))
            .await;

        assert_eq!(first.status, 200);
        assert_eq!(duplicate.status, 208);
        assert_eq!(body_json(&next), json!({ "count": 2 }));
    }

    #[tokio::test]
    async fn test_failed_function_releases_the_session() {
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = registry();
        let seen = calls.clone();
        registry.register("flaky", HandlerOptions::default(), move |_request, _session| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("first call always fails");
                }
                Ok(ErmesResponse::text(200, "ok"))
            }
        });
        let orchestrator = orchestrator_with(NodeConfig::new("mi"), registry);
        let runtime = runtime_of(&orchestrator);

        let first = orchestrator.handle("counter", call()).await;
        let session_id = token_of(&first).session_id;
        let flaky = || {
            ErmesRequest::new("GET", "/function/flaky")
                .with_header("Cookie", cookie_of(&first))
                .with_header(HEADER_REQUEST_ID, REQUEST_ID)
        };

        let failed = orchestrator.handle("flaky", flaky()).await;
        assert_eq!(failed.status, 500);
        assert_eq!(state(&runtime, &session_id).await, SessionState::Unlocked);

        // The request id was forgotten, so the retry runs.
        let retried = orchestrator.handle("flaky", flaky()).await;
        assert_eq!(retried.status, 200);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_request_still_releases_the_session() {
        let finished = Arc::new(AtomicUsize::new(0));
        let registry = registry();
        let done = finished.clone();
        registry.register("slow", HandlerOptions::default(), move |_request, session| {
            let done = done.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                session.set("count", Value::from(10)).await?;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(ErmesResponse::text(200, "ok"))
            }
        });
        let orchestrator = orchestrator_with(NodeConfig::new("mi"), registry);
        let runtime = runtime_of(&orchestrator);

        let first = orchestrator.handle("counter", call()).await;
        let session_id = token_of(&first).session_id;
        let slow = ErmesRequest::new("GET", "/function/slow")
            .with_header("Cookie", cookie_of(&first));

        // The caller gives up while the handler is still running
        let pending = orchestrator.handle("slow", slow);
        let abandoned = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(state(&runtime, &session_id).await, SessionState::Unlocked);

        let next = orchestrator
            .handle("counter", call().with_header("Cookie", cookie_of(&first)))
            .await;
        assert_eq!(next.status, 200);
        assert_eq!(body_json(&next), json!({ "count": 11 }));
    }

    #[tokio::test]
    async fn test_locked_session_asks_client_to_retry() {
        let (orchestrator, runtime) = orchestrator();
        let first = orchestrator.handle("counter", call()).await;
        let session_id = token_of(&first).session_id;
        let sid = &session_id;
        let rt = runtime.as_ref();
        rt.with_connection(|conn| async move {
            rt.coordinator
                .acquire(&*conn, sid, LockMode::Exclusive, false)
                .await
        })
        .await
        .unwrap();

        let response = orchestrator
            .handle("counter", call().with_header("Cookie", cookie_of(&first)))
            .await;

        assert_eq!(response.status, 503);
        assert_eq!(response.header("Retry-After"), Some(RETRY_AFTER_SECS));
    }

    #[tokio::test]
    async fn test_vanished_session_starts_over() {
        let (orchestrator, _) = orchestrator();
        let stale = sample_token();
        let pair = stale.to_set_cookie(DEFAULT_COOKIE_NAME).unwrap();
        let cookie = pair.split("; Path=/").next().unwrap().to_string();

        let response = orchestrator
            .handle("counter", call().with_header("Cookie", cookie))
            .await;

        assert_eq!(response.status, 200);
        assert_eq!(body_json(&response), json!({ "count": 1 }));
        assert_ne!(token_of(&response).session_id, stale.session_id);
    }

    #[tokio::test]
    async fn test_session_guard_runs_once() {
        let (_orchestrator, runtime) = orchestrator();
        let rt = runtime.as_ref();
        let lock = rt
            .with_connection(|conn| async move {
                rt.coordinator
                    .create_and_acquire(&*conn, LockMode::Exclusive, None)
                    .await
            })
            .await
            .unwrap();
        let session_id = lock.session_id.clone();
        let guard = SessionGuard::new(lock);
        let context = ExecutionContext::new();

        let first = guard.cleanup(rt, &context).await;
        let second = guard.cleanup(rt, &context).await;
        rt.connections.end_context(&context);

        assert!(first.is_some_and(|expires_at| expires_at > now_ms()));
        assert_eq!(second, None);
        assert_eq!(state(rt, &session_id).await, SessionState::Unlocked);
    }

    // ============================================================
    // ROUTING TESTS
    // ============================================================

    #[tokio::test]
    async fn test_token_for_another_node_is_redirected() {
        let (orchestrator, _) = orchestrator();
        let token = SessionToken {
            current_location_id: "lom".into(),
            current_node_ip: "http://lom:8080/".into(),
            ..sample_token()
        };
        let pair = token.to_set_cookie(DEFAULT_COOKIE_NAME).unwrap();
        let cookie = pair.split("; Path=/").next().unwrap().to_string();

        let response = orchestrator
            .handle(
                "counter",
                ErmesRequest::new("GET", "/function/counter?lang=it").with_header("Cookie", cookie),
            )
            .await;

        assert_eq!(response.status, 308);
        assert_eq!(
            response.header("Location"),
            Some("http://lom:8080/function/counter?lang=it")
        );
    }

    #[tokio::test]
    async fn test_moved_session_redirects_with_a_fresh_cookie() {
        let (orchestrator, runtime) = orchestrator();
        let first = orchestrator
            .handle("counter", call().with_header(HEADER_REQUEST_ID, REQUEST_ID))
            .await;
        let session_id = token_of(&first).session_id;
        let forward = ForwardingRecord {
            endpoint: "http://lom:8080".into(),
            session_id: SessionId::new().to_string(),
            location_id: "lom".into(),
        };
        let (sid, fwd) = (&session_id, &forward);
        let rt = runtime.as_ref();
        rt.with_connection(|conn| async move {
            rt.coordinator.offload_start(&*conn, sid, None).await?;
            rt.coordinator.offload_finish(&*conn, sid, fwd).await
        })
        .await
        .unwrap();

        let response = orchestrator
            .handle("counter", call().with_header("Cookie", cookie_of(&first)))
            .await;

        assert_eq!(response.status, 308);
        assert_eq!(response.header("Location"), Some("http://lom:8080/function/counter"));
        let token = token_of(&response);
        assert_eq!(token.session_id.to_string(), forward.session_id);
        assert!(token.is_current_at("lom"));
        assert!(token.is_proprietary("mi"));

        let remaining = rt
            .with_connection(|conn| async move { rt.store.request_ids(&*conn, sid).await })
            .await
            .unwrap();
        assert!(remaining.is_empty());
        assert_eq!(state(rt, sid).await, SessionState::Offloaded);
    }

    #[tokio::test]
    async fn test_rejecting_node_sends_new_clients_to_parent() {
        let (orchestrator, runtime) = orchestrator();
        let rt = runtime.as_ref();
        let existing = orchestrator.handle("counter", call()).await;
        rt.with_connection(|conn| async move {
            rt.store.set_offloading_status(&*conn, false).await
        })
            .await
            .unwrap();

        let fresh = orchestrator.handle("counter", call()).await;
        let returning = orchestrator
            .handle("counter", call().with_header("Cookie", cookie_of(&existing)))
            .await;

        assert_eq!(fresh.status, 308);
        assert_eq!(fresh.header("Location"), Some("http://lom:8080/function/counter"));
        assert!(fresh.header("Set-Cookie").is_none());
        assert_eq!(body_json(&returning), json!({ "count": 2 }));
    }

    #[tokio::test]
    async fn test_rejecting_node_prefers_configured_redirect() {
        let config = NodeConfig {
            redirect_to: Some("https://cloud.example".into()),
            ..NodeConfig::new("mi")
        };
        let orchestrator = orchestrator_with(config, registry());
        let runtime = runtime_of(&orchestrator);
        let rt = runtime.as_ref();
        rt.with_connection(|conn| async move {
            rt.store.set_offloading_status(&*conn, false).await
        })
            .await
            .unwrap();

        let response = orchestrator.handle("counter", call()).await;

        assert_eq!(response.status, 308);
        assert_eq!(
            response.header("Location"),
            Some("https://cloud.example/function/counter")
        );
    }
}
