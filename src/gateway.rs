//! Multiplexed HTTP front end
//!
//! Instances register a listen port, a backend destination and their request
//! pipeline here. The gateway binds one listener per distinct port and serves
//! every registered instance from a shared connection pool. Registration is
//! only effective before `start`; the port set is fixed once listening.

use crate::middleware::{Gate, MiddlewareChain, ProxyBody, RequestInfo};
use crate::pool::{ConnectionPool, PoolConfig};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};

/// One instance's claim on a listen port
struct Registration {
    instance: String,
    destination: String,
    pass_original_host: bool,
    chain: Arc<MiddlewareChain>,
}

/// Shared HTTP host serving all registered instances
pub struct Gateway {
    registrations: Mutex<BTreeMap<u16, Arc<Registration>>>,
    pool: Arc<ConnectionPool>,
    started: OnceCell<()>,
}

impl Gateway {
    pub fn new() -> Self {
        Self {
            registrations: Mutex::new(BTreeMap::new()),
            pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
            started: OnceCell::new(),
        }
    }

    /// Claim `listen_port` for an instance. The first registration for a port
    /// wins; later claims are logged and dropped.
    pub fn register(
        &self,
        instance: &str,
        listen_port: u16,
        destination: String,
        pass_original_host: bool,
        chain: Arc<MiddlewareChain>,
    ) {
        let mut registrations = self.registrations.lock();
        if let Some(existing) = registrations.get(&listen_port) {
            warn!(
                port = listen_port,
                instance,
                holder = %existing.instance,
                "Port already registered, ignoring"
            );
            return;
        }
        registrations.insert(
            listen_port,
            Arc::new(Registration {
                instance: instance.to_string(),
                destination,
                pass_original_host,
                chain,
            }),
        );
    }

    /// Ports currently claimed, ascending
    pub fn registered_ports(&self) -> Vec<u16> {
        self.registrations.lock().keys().copied().collect()
    }

    /// Bind every registered port and start serving. Safe to call more than
    /// once; only the first call binds.
    pub async fn start(
        self: &Arc<Self>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        self.started
            .get_or_try_init(|| async {
                let snapshot: Vec<(u16, Arc<Registration>)> = {
                    let registrations = self.registrations.lock();
                    registrations
                        .iter()
                        .map(|(port, reg)| (*port, Arc::clone(reg)))
                        .collect()
                };

                for (port, registration) in snapshot {
                    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
                    info!(
                        port,
                        instance = %registration.instance,
                        destination = %registration.destination,
                        "Gateway listening"
                    );
                    let pool = Arc::clone(&self.pool);
                    let shutdown_rx = shutdown_rx.clone();
                    tokio::spawn(accept_loop(listener, registration, pool, shutdown_rx));
                }
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

async fn accept_loop(
    listener: TcpListener,
    registration: Arc<Registration>,
    pool: Arc<ConnectionPool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let registration = Arc::clone(&registration);
                        let pool = Arc::clone(&pool);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, registration, pool).await {
                                debug!(addr = %addr, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(instance = %registration.instance, "Gateway listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: SocketAddr,
    registration: Arc<Registration>,
    pool: Arc<ConnectionPool>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registration = Arc::clone(&registration);
        let pool = Arc::clone(&pool);
        async move { handle_request(req, registration, pool, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    registration: Arc<Registration>,
    pool: Arc<ConnectionPool>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let info = RequestInfo {
        path: req.uri().path().to_string(),
        user_agent: req
            .headers()
            .get(hyper::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    };

    match registration.chain.handle(&info).await {
        Ok(Gate::Respond(response)) => Ok(response),
        Ok(Gate::Forward) => {
            match pool
                .send_request(req, &registration.destination, registration.pass_original_host)
                .await
            {
                Ok(response) => Ok(response),
                Err(e) => {
                    error!(
                        instance = %registration.instance,
                        destination = %registration.destination,
                        error = %e,
                        "Backend request failed"
                    );
                    Ok(text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
                }
            }
        }
        Err(e) => {
            error!(
                instance = %registration.instance,
                client = %client_addr,
                error = %e,
                "Request pipeline failed"
            );
            Ok(text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal Server Error",
            ))
        }
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}
