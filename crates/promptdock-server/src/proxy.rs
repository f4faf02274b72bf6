//! Dynamic reverse-proxy table for live runtimes.
//!
//! The public router owns two static routes (`/runtime/:id` and
//! `/runtime/:id/*path`); the proxied target is resolved per request against
//! an atomically-published snapshot of the route map. Readers are wait-free
//! (a request in flight keeps the snapshot it loaded), and register/deregister
//! publish a replacement map without touching the router, so no other route is
//! ever dropped.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::HOST;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{info, warn};

use promptdock_runtime::RouteTable;

const MAX_PROXIED_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug)]
struct ProxyRoute {
    port: u16,
}

/// Concurrent id → upstream map published through a single swap slot.
pub struct ProxyTable {
    routes: ArcSwap<HashMap<String, ProxyRoute>>,
    client: reqwest::Client,
}

impl ProxyTable {
    pub fn new() -> Self {
        Self {
            routes: ArcSwap::from_pointee(HashMap::new()),
            client: reqwest::Client::new(),
        }
    }

    pub fn has_route(&self, id: &str) -> bool {
        self.routes.load().contains_key(id)
    }

    pub fn active_routes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.load().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn port_of(&self, id: &str) -> Option<u16> {
        self.routes.load().get(id).map(|route| route.port)
    }

    /// Relay one public request to the runtime's upstream server.
    pub async fn forward(&self, id: &str, rest: &str, request: Request<Body>) -> Response {
        let Some(port) = self.port_of(id) else {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("no active runtime for id {id}") })),
            )
                .into_response();
        };

        let path = if rest.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", rest.trim_start_matches('/'))
        };
        let query = request
            .uri()
            .query()
            .map(|q| format!("?{q}"))
            .unwrap_or_default();
        let url = format!("http://127.0.0.1:{port}{path}{query}");

        let (parts, body) = request.into_parts();
        let body = match axum::body::to_bytes(body, MAX_PROXIED_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": format!("failed to read request body: {e}") })),
                )
                    .into_response()
            }
        };

        let mut upstream = self.client.request(parts.method, &url);
        for (name, value) in parts.headers.iter() {
            if name == HOST {
                continue;
            }
            upstream = upstream.header(name, value.clone());
        }

        match upstream.body(body).send().await {
            Ok(response) => relay_response(id, response).await,
            Err(e) => {
                warn!(runtime = %id, "proxied request failed: {e}");
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "error": format!("runtime unreachable: {e}") })),
                )
                    .into_response()
            }
        }
    }
}

impl Default for ProxyTable {
    fn default() -> Self {
        Self::new()
    }
}

async fn relay_response(id: &str, upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = match upstream.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({ "error": format!("failed to read runtime response: {e}") })),
            )
                .into_response()
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    for (name, value) in headers.iter() {
        // The body was fully buffered; let axum set framing headers.
        if name == axum::http::header::TRANSFER_ENCODING
            || name == axum::http::header::CONTENT_LENGTH
        {
            continue;
        }
        response.headers_mut().append(name, value.clone());
    }
    if let Ok(base) = HeaderValue::from_str(&format!("/runtime/{id}")) {
        response.headers_mut().insert("x-application-base", base);
    }
    response
}

#[async_trait]
impl RouteTable for ProxyTable {
    async fn register(&self, id: &str, port: u16) {
        self.routes.rcu(|routes| {
            let mut next = (**routes).clone();
            next.insert(id.to_string(), ProxyRoute { port });
            next
        });
        info!(runtime = %id, port, "proxy registered: /runtime/{id} -> localhost:{port}");
    }

    async fn deregister(&self, id: &str) {
        if !self.has_route(id) {
            warn!(runtime = %id, "proxy not found for runtime");
            return;
        }
        self.routes.rcu(|routes| {
            let mut next = (**routes).clone();
            next.remove(id);
            next
        });
        info!(runtime = %id, "proxy deregistered: /runtime/{id}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_deregister_leaves_other_routes() {
        let table = ProxyTable::new();
        table.register("a", 1000).await;
        table.register("b", 2000).await;
        assert_eq!(table.active_routes(), vec!["a".to_string(), "b".to_string()]);

        table.deregister("a").await;
        assert!(!table.has_route("a"));
        assert!(table.has_route("b"));
        assert_eq!(table.port_of("b"), Some(2000));
    }

    #[tokio::test]
    async fn deregister_twice_is_a_noop() {
        let table = ProxyTable::new();
        table.register("a", 1000).await;
        table.deregister("a").await;
        table.deregister("a").await;
        assert!(table.active_routes().is_empty());
    }

    #[tokio::test]
    async fn register_replaces_port_for_same_id() {
        let table = ProxyTable::new();
        table.register("a", 1000).await;
        table.register("a", 1001).await;
        assert_eq!(table.port_of("a"), Some(1001));
        assert_eq!(table.active_routes().len(), 1);
    }

    #[tokio::test]
    async fn forward_without_route_is_not_found() {
        let table = ProxyTable::new();
        let request = Request::builder()
            .uri("/runtime/missing/")
            .body(Body::empty())
            .expect("request");
        let response = table.forward("missing", "", request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
