//! Edge Node Tests
//!
//! Spins up a three-level infrastructure (it → lom → mi) on loopback, one HTTP server and
//! one in-process store per node, and moves sessions between them over the peer routes.
//!
//! ## Test Scopes
//! - **Offload**: forced offloads, redirects on the old node, proprietary updates.
//! - **Onload**: a child pulling a session from its parent.
//! - **Offloading status**: a rejecting node passing sessions further up.
//! - **Status**: counters reported by the status route.

#[cfg(test)]
mod tests {
    use crate::config::{DEFAULT_COOKIE_NAME, NodeConfig};
    use crate::migration::client::PeerClient;
    use crate::migration::protocol::*;
    use crate::node::EdgeNode;
    use crate::offload::types::{LockMode, SessionState};
    use crate::offload::coordinator::now_ms;
    use crate::orchestrator::registry::FunctionRegistry;
    use crate::orchestrator::token::SessionToken;
    use crate::orchestrator::types::{ErmesResponse, HandlerOptions};
    use crate::store::memory::MemoryBackend;
    use crate::topology::resolver::Topology;
    use crate::topology::types::Infrastructure;
    use reqwest::redirect::Policy;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;

    const LOCATIONS: [&str; 3] = ["it", "lom", "mi"];

    struct Cluster {
        nodes: HashMap<&'static str, EdgeNode>,
        gateways: HashMap<&'static str, String>,
        http: reqwest::Client,
    }

    /// Result of one call to a function route.
    struct Reply {
        status: u16,
        location: Option<String>,
        cookie: Option<String>,
        body: Option<Value>,
    }

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
        registry
    }

    async fn cluster() -> Cluster {
        let mut listeners = HashMap::new();
        let mut gateways = HashMap::new();
        for location in LOCATIONS {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            gateways.insert(location, format!("http://{}", listener.local_addr().unwrap()));
            listeners.insert(location, listener);
        }

        let infrastructure: Infrastructure = serde_json::from_value(json!({
            "areaTypesIdentifiers": ["country", "region", "city"],
            "hierarchy": [{
                "areaName": "Italy",
                "mainLocation": { "locationId": "it", "gateway": gateways["it"] },
                "areas": [{
                    "areaName": "Lombardy",
                    "mainLocation": { "locationId": "lom", "gateway": gateways["lom"] },
                    "areas": [{
                        "areaName": "Milan",
                        "mainLocation": { "locationId": "mi", "gateway": gateways["mi"] }
                    }]
                }]
            }]
        }))
        .unwrap();

        let mut nodes = HashMap::new();
        for (location, listener) in listeners {
            let node = EdgeNode::new(
                NodeConfig::new(location),
                Topology::new(infrastructure.clone()),
                Arc::new(MemoryBackend::new()),
                registry(),
            )
            .unwrap();
            node.runtime.initialize().await.unwrap();

            let app = node.router();
            tokio::spawn(async move { axum::serve(listener, app).await });
            nodes.insert(location, node);
        }

        Cluster {
            nodes,
            gateways,
            http: reqwest::Client::builder()
                .redirect(Policy::none())
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap(),
        }
    }

    impl Cluster {
        async fn call_counter(&self, location: &str, cookie: Option<&str>) -> Reply {
            let url = format!("{}/function/counter", self.gateways[location]);
            let mut request = self.http.get(url);
            if let Some(cookie) = cookie {
                request = request.header("Cookie", cookie);
            }
            let response = request.send().await.unwrap();

            let header = |name: &str| {
                response
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string)
            };
            let status = response.status().as_u16();
            let location = header("location");
            let cookie = header("set-cookie")
                .and_then(|value| value.split("; Path=/").next().map(str::to_string));
            let body = response.json::<Value>().await.ok();

            Reply {
                status,
                location,
                cookie,
                body,
            }
        }

        async fn state(&self, location: &str, token: &SessionToken) -> Option<SessionState> {
            let rt = self.nodes[location].runtime.as_ref();
            let session_id = &token.session_id;
            rt.with_connection(|conn| async move { rt.store.read_record(&*conn, session_id).await })
                .await
                .unwrap()
                .map(|record| record.state(now_ms()))
        }

        async fn set_offloading(&self, location: &str, status: &str) {
            let url = format!(
                "{}{}?status={}",
                self.gateways[location], ENDPOINT_OFFLOAD_STATUS, status
            );
            let response = self.http.post(url).send().await.unwrap();
            assert!(response.status().is_success());
        }
    }

    fn token(cookie: &str) -> SessionToken {
        SessionToken::from_cookie_header(cookie, DEFAULT_COOKIE_NAME)
            .unwrap()
            .unwrap()
    }

    // ============================================================
    // OFFLOAD TESTS
    // ============================================================

    #[tokio::test]
    async fn test_forced_offload_moves_session_to_parent() {
        let cluster = cluster().await;
        let peers = PeerClient::new().unwrap();

        let created = cluster.call_counter("mi", None).await;
        let cookie = created.cookie.unwrap();
        let original = token(&cookie);

        let receipt = peers
            .force_offload(&cluster.gateways["mi"], &original.session_id)
            .await
            .unwrap();
        assert_eq!(receipt.location_id, "lom");
        assert_eq!(receipt.endpoint, cluster.gateways["lom"]);
        assert_ne!(receipt.session_id, original.session_id.to_string());
        assert_eq!(
            cluster.state("mi", &original).await,
            Some(SessionState::Offloaded)
        );

        // The old node sends the client on with a refreshed token.
        let redirected = cluster.call_counter("mi", Some(&cookie)).await;
        assert_eq!(redirected.status, 308);
        assert_eq!(
            redirected.location.as_deref(),
            Some(format!("{}/function/counter", cluster.gateways["lom"]).as_str())
        );
        let moved_cookie = redirected.cookie.unwrap();
        let moved = token(&moved_cookie);
        assert_eq!(moved.session_id.to_string(), receipt.session_id);
        assert!(moved.is_current_at("lom"));
        assert!(moved.is_proprietary("mi"));

        let served = cluster.call_counter("lom", Some(&moved_cookie)).await;
        assert_eq!(served.status, 200);
        assert_eq!(served.body, Some(json!({ "count": 2 })));

        let source = peers.status(&cluster.gateways["mi"]).await.unwrap();
        let target = peers.status(&cluster.gateways["lom"]).await.unwrap();
        assert_eq!(source.indicators.sessions_offloaded, 1);
        assert_eq!(target.indicators.sessions_onloaded, 1);
    }

    #[tokio::test]
    async fn test_second_hop_updates_the_proprietary_node() {
        let cluster = cluster().await;
        let peers = PeerClient::new().unwrap();

        let created = cluster.call_counter("mi", None).await;
        let cookie = created.cookie.unwrap();
        let original = token(&cookie);

        let first = peers
            .force_offload(&cluster.gateways["mi"], &original.session_id)
            .await
            .unwrap();
        let at_lom = crate::keys::SessionId::parse(&first.session_id).unwrap();
        let second = peers
            .force_offload(&cluster.gateways["lom"], &at_lom)
            .await
            .unwrap();
        assert_eq!(second.location_id, "it");

        // The proprietary node skips the intermediate hop.
        let redirected = cluster.call_counter("mi", Some(&cookie)).await;
        assert_eq!(redirected.status, 308);
        let moved = token(&redirected.cookie.unwrap());
        assert!(moved.is_current_at("it"));
        assert_eq!(moved.session_id.to_string(), second.session_id);

        let cookie = format!("{}={}", DEFAULT_COOKIE_NAME, moved.to_json().unwrap());
        let served = cluster.call_counter("it", Some(&cookie)).await;
        assert_eq!(served.body, Some(json!({ "count": 2 })));
    }

    #[tokio::test]
    async fn test_failed_offload_leaves_session_in_place() {
        let cluster = cluster().await;
        let peers = PeerClient::new().unwrap();
        cluster.set_offloading("lom", "reject").await;
        cluster.set_offloading("it", "reject").await;

        let created = cluster.call_counter("mi", None).await;
        let cookie = created.cookie.unwrap();
        let original = token(&cookie);

        let result = peers
            .force_offload(&cluster.gateways["mi"], &original.session_id)
            .await;
        assert!(result.is_err());
        assert_eq!(
            cluster.state("mi", &original).await,
            Some(SessionState::Unlocked)
        );

        let served = cluster.call_counter("mi", Some(&cookie)).await;
        assert_eq!(served.body, Some(json!({ "count": 2 })));
    }

    // ============================================================
    // OFFLOADING STATUS TESTS
    // ============================================================

    #[tokio::test]
    async fn test_rejecting_parent_passes_session_up() {
        let cluster = cluster().await;
        let peers = PeerClient::new().unwrap();
        cluster.set_offloading("lom", "reject").await;

        let created = cluster.call_counter("mi", None).await;
        let original = token(created.cookie.as_deref().unwrap());

        let receipt = peers
            .force_offload(&cluster.gateways["mi"], &original.session_id)
            .await
            .unwrap();

        assert_eq!(receipt.location_id, "it");
        let lom = peers.status(&cluster.gateways["lom"]).await.unwrap();
        assert!(!lom.accepts_offloading);
        assert_eq!(lom.indicators.sessions_onloaded, 0);
    }

    #[tokio::test]
    async fn test_rejecting_node_redirects_new_clients() {
        let cluster = cluster().await;
        cluster.set_offloading("mi", "reject").await;

        let reply = cluster.call_counter("mi", None).await;

        assert_eq!(reply.status, 308);
        assert_eq!(
            reply.location.as_deref(),
            Some(format!("{}/function/counter", cluster.gateways["lom"]).as_str())
        );
    }

    // ============================================================
    // ONLOAD TESTS
    // ============================================================

    #[tokio::test]
    async fn test_child_onloads_session_from_parent() {
        let cluster = cluster().await;

        let created = cluster.call_counter("lom", None).await;
        let cookie = created.cookie.unwrap();
        let original = token(&cookie);

        let url = format!("{}{}", cluster.gateways["mi"], ENDPOINT_REQUEST_ONLOAD);
        let response = cluster.http.post(url).send().await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let receipt: OffloadReceipt = response.json().await.unwrap();
        assert_eq!(receipt.location_id, "mi");

        assert_eq!(
            cluster.state("lom", &original).await,
            Some(SessionState::Offloaded)
        );

        let redirected = cluster.call_counter("lom", Some(&cookie)).await;
        assert_eq!(redirected.status, 308);
        let served = cluster
            .call_counter("mi", redirected.cookie.as_deref())
            .await;
        assert_eq!(served.body, Some(json!({ "count": 2 })));
    }

    #[tokio::test]
    async fn test_onload_with_nothing_to_take() {
        let cluster = cluster().await;

        let url = format!("{}{}", cluster.gateways["mi"], ENDPOINT_REQUEST_ONLOAD);
        let response = cluster.http.post(url).send().await.unwrap();

        assert_eq!(response.status().as_u16(), 204);
    }

    #[tokio::test]
    async fn test_busy_sessions_are_not_onloaded() {
        let cluster = cluster().await;

        let created = cluster.call_counter("lom", None).await;
        let original = token(created.cookie.as_deref().unwrap());
        let rt = cluster.nodes["lom"].runtime.as_ref();
        let session_id = &original.session_id;
        rt.with_connection(|conn| async move {
            rt.coordinator
                .acquire(&*conn, session_id, LockMode::Shared, false)
                .await
        })
        .await
        .unwrap();

        let url = format!("{}{}", cluster.gateways["mi"], ENDPOINT_REQUEST_ONLOAD);
        let response = cluster.http.post(url).send().await.unwrap();

        assert_eq!(response.status().as_u16(), 204);
        assert_eq!(
            cluster.state("lom", &original).await,
            Some(SessionState::LockedShared(1))
        );
    }

    // ============================================================
    // STATUS TESTS
    // ============================================================

    #[tokio::test]
    async fn test_status_reports_counters() {
        let cluster = cluster().await;
        let peers = PeerClient::new().unwrap();

        let created = cluster.call_counter("mi", None).await;
        cluster
            .call_counter("mi", created.cookie.as_deref())
            .await;

        let status = peers.status(&cluster.gateways["mi"]).await.unwrap();

        assert_eq!(status.location_id, "mi");
        assert!(status.accepts_offloading);
        assert_eq!(status.indicators.sessions_created, 1);
        assert_eq!(status.indicators.requests_served, 2);
    }

    #[tokio::test]
    async fn test_bad_peer_requests_are_400() {
        let cluster = cluster().await;
        let gateway = &cluster.gateways["lom"];

        let missing_token = cluster
            .http
            .post(format!("{}{}", gateway, ENDPOINT_OFFLOAD_SESSION))
            .send()
            .await
            .unwrap();
        let bad_policy = cluster
            .http
            .get(format!(
                "{}{}?session={}&policy=everything",
                gateway,
                ENDPOINT_GARBAGE_COLLECTOR,
                crate::keys::SessionId::new()
            ))
            .send()
            .await
            .unwrap();
        let bad_status = cluster
            .http
            .post(format!("{}{}?status=maybe", gateway, ENDPOINT_OFFLOAD_STATUS))
            .send()
            .await
            .unwrap();

        assert_eq!(missing_token.status().as_u16(), 400);
        assert_eq!(bad_policy.status().as_u16(), 400);
        assert_eq!(bad_status.status().as_u16(), 400);
    }
}
