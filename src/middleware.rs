//! Request gating middlewares
//!
//! Every inbound request runs through an ordered [`MiddlewareChain`] before it
//! may be relayed to the backend. Each link returns a [`Gate`]: `Forward` to
//! hand off to the next link (and ultimately the proxy), or `Respond` to
//! short-circuit with a finished response. The chain never reorders links.

use crate::controller::{ActivitySender, Controller, ControllerStatus};
use crate::matcher::RequestMatcher;
use async_trait::async_trait;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Response body type used throughout the proxy
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Poll interval while a connect waiter holds a request
const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The request fields the middlewares look at
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    pub path: String,
    pub user_agent: String,
}

/// Outcome of one middleware link
pub enum Gate {
    /// Pass the request further down the chain, eventually to the backend
    Forward,
    /// Short-circuit with this response
    Respond(Response<ProxyBody>),
}

/// One link in the request pipeline
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, req: &RequestInfo) -> anyhow::Result<Gate>;
}

/// Ordered middleware pipeline; an empty chain forwards everything
#[derive(Default)]
pub struct MiddlewareChain {
    links: Vec<Box<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new(links: Vec<Box<dyn Middleware>>) -> Self {
        Self { links }
    }

    /// Run every link in order; the first `Respond` wins.
    pub async fn handle(&self, req: &RequestInfo) -> anyhow::Result<Gate> {
        for link in &self.links {
            if let Gate::Respond(response) = link.handle(req).await? {
                return Ok(Gate::Respond(response));
            }
        }
        Ok(Gate::Forward)
    }
}

/// Build a fixed response with the given status, content type and body
fn fixed_response(status: StatusCode, content_type: &str, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, content_type)
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Reports observed traffic to the controller, then forwards.
/// The signal is fire-and-forget; a full channel drops it silently.
pub struct ActivityMiddleware {
    matcher: RequestMatcher,
    activity: ActivitySender,
}

impl ActivityMiddleware {
    pub fn new(matcher: RequestMatcher, activity: ActivitySender) -> Self {
        Self { matcher, activity }
    }
}

#[async_trait]
impl Middleware for ActivityMiddleware {
    async fn handle(&self, req: &RequestInfo) -> anyhow::Result<Gate> {
        if !self.matcher.should_skip(&req.path, &req.user_agent) {
            debug!(path = %req.path, "Activity detected");
            let _ = self.activity.try_send(());
        }
        Ok(Gate::Forward)
    }
}

/// Holds the request until the controller reports `Ready`, then forwards.
///
/// There is no internal bound: a caller that cannot wait forever must bring
/// its own timeout at the transport layer.
pub struct ConnectWaiterMiddleware {
    matcher: RequestMatcher,
    controller: Arc<Controller>,
}

impl ConnectWaiterMiddleware {
    pub fn new(matcher: RequestMatcher, controller: Arc<Controller>) -> Self {
        Self {
            matcher,
            controller,
        }
    }
}

#[async_trait]
impl Middleware for ConnectWaiterMiddleware {
    async fn handle(&self, req: &RequestInfo) -> anyhow::Result<Gate> {
        if !self.matcher.should_skip(&req.path, &req.user_agent) {
            while self.controller.status() != ControllerStatus::Ready {
                tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
            }
        }
        Ok(Gate::Forward)
    }
}

/// Answers with a configured response while the backend is not ready,
/// or unconditionally when `always_respond` is set
pub struct FixedResponseMiddleware {
    matcher: RequestMatcher,
    controller: Arc<Controller>,
    always_respond: bool,
    status: StatusCode,
    content_type: String,
    content: String,
}

impl FixedResponseMiddleware {
    pub fn new(
        matcher: RequestMatcher,
        controller: Arc<Controller>,
        always_respond: bool,
        status_code: u16,
        content_type: String,
        content: String,
    ) -> anyhow::Result<Self> {
        let status = StatusCode::from_u16(status_code)
            .map_err(|_| anyhow::anyhow!("invalid status code {}", status_code))?;
        Ok(Self {
            matcher,
            controller,
            always_respond,
            status,
            content_type,
            content,
        })
    }
}

#[async_trait]
impl Middleware for FixedResponseMiddleware {
    async fn handle(&self, req: &RequestInfo) -> anyhow::Result<Gate> {
        if self.matcher.should_skip(&req.path, &req.user_agent) {
            return Ok(Gate::Forward);
        }
        if self.always_respond || self.controller.status() != ControllerStatus::Ready {
            return Ok(Gate::Respond(fixed_response(
                self.status,
                &self.content_type,
                &self.content,
            )));
        }
        Ok(Gate::Forward)
    }
}

/// Answers 200 with a loading page while the backend is not ready
pub struct LoadingWaiterMiddleware {
    matcher: RequestMatcher,
    controller: Arc<Controller>,
    content_type: String,
    content: String,
}

impl LoadingWaiterMiddleware {
    pub fn new(
        matcher: RequestMatcher,
        controller: Arc<Controller>,
        content_type: String,
        content: String,
    ) -> Self {
        Self {
            matcher,
            controller,
            content_type,
            content,
        }
    }
}

#[async_trait]
impl Middleware for LoadingWaiterMiddleware {
    async fn handle(&self, req: &RequestInfo) -> anyhow::Result<Gate> {
        if !self.matcher.should_skip(&req.path, &req.user_agent)
            && self.controller.status() != ControllerStatus::Ready
        {
            return Ok(Gate::Respond(fixed_response(
                StatusCode::OK,
                &self.content_type,
                &self.content,
            )));
        }
        Ok(Gate::Forward)
    }
}

/// Answers 503 while the backend is not ready
pub struct NoneWaiterMiddleware {
    matcher: RequestMatcher,
    controller: Arc<Controller>,
}

impl NoneWaiterMiddleware {
    pub fn new(matcher: RequestMatcher, controller: Arc<Controller>) -> Self {
        Self {
            matcher,
            controller,
        }
    }
}

#[async_trait]
impl Middleware for NoneWaiterMiddleware {
    async fn handle(&self, req: &RequestInfo) -> anyhow::Result<Gate> {
        if !self.matcher.should_skip(&req.path, &req.user_agent)
            && self.controller.status() != ControllerStatus::Ready
        {
            return Ok(Gate::Respond(fixed_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "text/plain",
                "Service Unavailable",
            )));
        }
        Ok(Gate::Forward)
    }
}

/// Resolve middleware content: inline value, file contents, or the default
pub(crate) fn resolve_content(
    content: Option<String>,
    content_file: Option<String>,
    default: &str,
) -> anyhow::Result<String> {
    match (content, content_file) {
        (Some(inline), _) => Ok(inline),
        (None, Some(path)) => std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read content file '{}': {}", path, e)),
        (None, None) => Ok(default.to_string()),
    }
}
