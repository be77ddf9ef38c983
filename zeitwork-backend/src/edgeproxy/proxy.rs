use axum::body::Body;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use moka::sync::Cache;
use rand::seq::SliceRandom;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ratelimit::RateLimiter;
use super::routing::{select_backend, Backend, RoutingTable};

/// Correlation id header attached to every response
pub const REQUEST_ID_HEADER: &str = "x-zeitwork-request-id";

/// How long a backend failure keeps it out of selection
const FAILURE_MEMORY: Duration = Duration::from_secs(30);

/// Headers that must not be forwarded across the proxy hop
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// State shared by every in-flight request on one edge
pub struct ProxyShared {
    table: RwLock<Arc<RoutingTable>>,
    client: reqwest::Client,
    failures: Cache<Uuid, ()>,
    limiter: Option<RateLimiter>,
}

impl ProxyShared {
    pub fn new(upstream_timeout: Duration, rate_limit_rps: Option<u32>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(upstream_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            table: RwLock::new(Arc::new(RoutingTable::default())),
            client,
            failures: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(FAILURE_MEMORY)
                .build(),
            limiter: rate_limit_rps.map(RateLimiter::new),
        })
    }

    /// The snapshot in-flight requests route against
    pub fn snapshot(&self) -> Arc<RoutingTable> {
        self.table
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|_| Arc::new(RoutingTable::default()))
    }

    /// Atomically swap in a freshly built table
    pub fn swap(&self, table: RoutingTable) {
        if let Ok(mut current) = self.table.write() {
            *current = Arc::new(table);
        }
    }

    fn record_failure(&self, backend: &Backend) {
        self.failures.insert(backend.instance_id, ());
    }

    fn is_failed(&self, backend: &Backend) -> bool {
        self.failures.contains_key(&backend.instance_id)
    }
}

/// Terminate one proxied request: route by Host, forward, stream back.
pub async fn handle_request(
    shared: Arc<ProxyShared>,
    client_ip: IpAddr,
    req: Request<Incoming>,
) -> Response<Body> {
    let request_id = Uuid::now_v7().to_string();
    let client_ip_str = client_ip.to_string();

    if let Some(limiter) = &shared.limiter {
        if !limiter.allow(&client_ip_str) {
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "too many requests",
                &request_id,
            );
        }
    }

    let Some(host) = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "missing_host",
            "request carries no host",
            &request_id,
        );
    };

    let table = shared.snapshot();
    let Some(backends) = table.backends(&host) else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_host",
            "no application is served at this host",
            &request_id,
        );
    };

    let Some(primary) = select_backend(backends, &client_ip_str, |b| shared.is_failed(b)) else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no_backend",
            "no healthy backend available",
            &request_id,
        );
    };
    let primary = primary.clone();

    // Buffer the request body once so a failover retry can resend it.
    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            return error_response(
                StatusCode::BAD_REQUEST,
                "bad_request",
                "failed to read request body",
                &request_id,
            );
        }
    };

    match forward(&shared, &parts, body_bytes.clone(), &primary, &client_ip_str).await {
        Ok(response) => finalize(response, &request_id),
        Err(e) if e.is_timeout() => {
            shared.record_failure(&primary);
            error_response(
                StatusCode::GATEWAY_TIMEOUT,
                "upstream_timeout",
                "the application did not respond in time",
                &request_id,
            )
        }
        Err(e) => {
            debug!("Backend {} failed: {}", primary.instance_id, e);
            shared.record_failure(&primary);

            // One retry against a randomly chosen other backend.
            let others: Vec<&Backend> = backends
                .iter()
                .filter(|b| b.instance_id != primary.instance_id)
                .collect();
            let retry = others.choose(&mut rand::thread_rng()).copied().cloned();
            if let Some(retry) = retry {
                let retry = &retry;
                match forward(&shared, &parts, body_bytes, retry, &client_ip_str).await {
                    Ok(response) => return finalize(response, &request_id),
                    Err(retry_err) => {
                        warn!("Failover to {} also failed: {}", retry.instance_id, retry_err);
                        shared.record_failure(retry);
                    }
                }
            }

            error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_backend",
                "no healthy backend available",
                &request_id,
            )
        }
    }
}

/// Send the request to one backend and stream the response back
async fn forward(
    shared: &ProxyShared,
    parts: &hyper::http::request::Parts,
    body: bytes::Bytes,
    backend: &Backend,
    client_ip: &str,
) -> Result<Response<Body>, reqwest::Error> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", backend.origin(), path_and_query);

    let mut upstream = shared
        .client
        .request(parts.method.clone(), &url)
        .body(body);

    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            upstream = upstream.header(name, value);
        }
    }
    upstream = upstream.header("x-forwarded-for", client_ip);

    let response = upstream.send().await?;

    let mut builder = Response::builder().status(response.status());
    for (name, value) in response.headers().iter() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    let stream = response.bytes_stream();
    Ok(builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty())))
}

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

fn finalize(mut response: Response<Body>, request_id: &str) -> Response<Body> {
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    request_id: &str,
) -> Response<Body> {
    let body = serde_json::json!({ "code": code, "message": message }).to_string();
    let response = Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()));
    finalize(response, request_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_filtering() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("HOST"));
        assert!(!is_hop_by_hop("content-type"));
        assert!(!is_hop_by_hop("x-custom"));
    }

    #[test]
    fn test_error_response_carries_request_id_and_code() {
        let response = error_response(
            StatusCode::NOT_FOUND,
            "unknown_host",
            "no application is served at this host",
            "req-123",
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(REQUEST_ID_HEADER).unwrap(),
            "req-123"
        );
    }

    #[test]
    fn test_snapshot_swap_is_atomic_per_request() {
        let shared = ProxyShared::new(Duration::from_secs(30), None).unwrap();
        let before = shared.snapshot();
        assert!(before.is_empty());

        shared.swap(RoutingTable::from_rows(vec![crate::db::domains::RouteRow {
            domain_name: "app.example.com".to_string(),
            instance_id: Uuid::now_v7(),
            ipv6_address: "fd00::1".to_string(),
            default_port: 3000,
        }]));

        // The old snapshot is untouched; a new snapshot sees the route.
        assert!(before.is_empty());
        assert_eq!(shared.snapshot().len(), 1);
    }

    #[test]
    fn test_failure_memory_influences_selection() {
        let shared = ProxyShared::new(Duration::from_secs(30), None).unwrap();
        let backend = Backend {
            instance_id: Uuid::now_v7(),
            address: "fd00::1".to_string(),
            port: 3000,
        };
        assert!(!shared.is_failed(&backend));
        shared.record_failure(&backend);
        assert!(shared.is_failed(&backend));
    }
}
