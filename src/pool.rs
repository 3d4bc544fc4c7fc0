//! Connection pool for backend HTTP connections
//!
//! One pool is shared by every registered instance; the pooled client keys
//! idle connections by destination host, so instances pointing at different
//! services never contend for each other's connections.

use crate::middleware::ProxyBody;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Error type for connection pool operations
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("Request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    /// Total number of requests relayed through the pool
    pub total_requests: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per destination host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to backend services
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    /// Create a new connection pool with the given configuration
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    /// Get the pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get pool statistics
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Relay a request to `destination` (a `host:port` authority).
    ///
    /// With `pass_original_host` the inbound `Host` header travels with the
    /// request; otherwise the client derives `Host` from the destination.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        destination: &str,
        pass_original_host: bool,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let uri = format!(
            "http://{}{}",
            destination,
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if key == hyper::header::HOST && !pass_original_host {
                continue;
            }
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.record_request();

        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
