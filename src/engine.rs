//! Instance engine
//!
//! Wires one configured instance together: builds the extension chain, the
//! controller, the middleware pipeline, and registers the instance with the
//! shared gateway. `run` then drives the controller's reconciliation loop and
//! any scheduled always-on loops for the lifetime of the process.

use crate::config::{
    parse_duration, ControllerConfig, ExtensionConfig, InstanceConfig, MiddlewareConfig,
};
use crate::controller::{activity_channel, ActivityReceiver, ActivitySender, Controller};
use crate::extensions::{
    CompanionDeploymentExtension, Extension, ExtensionChain, ReadinessCheckExtension,
    ScheduledAlwaysOnExtension,
};
use crate::gateway::Gateway;
use crate::matcher::RequestMatcher;
use crate::middleware::{
    resolve_content, ActivityMiddleware, ConnectWaiterMiddleware, FixedResponseMiddleware,
    LoadingWaiterMiddleware, Middleware, MiddlewareChain, NoneWaiterMiddleware,
};
use crate::scale::{ScaleTarget, SharedScaleClient};
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DEFAULT_LOADING_CONTENT: &str = "Loading...";

/// One configured instance, fully wired and registered with the gateway
pub struct Engine {
    name: String,
    controller: Arc<Controller>,
    schedules: Vec<Arc<ScheduledAlwaysOnExtension>>,
    activity_rx: ActivityReceiver,
    activity_tx: ActivitySender,
}

impl Engine {
    /// Build an engine from its configuration and register its listener.
    /// Fails on any invalid regex, duration, URL or schedule in the config.
    pub fn new(
        config: InstanceConfig,
        client: SharedScaleClient,
        gateway: &Gateway,
    ) -> anyhow::Result<Self> {
        let (activity_tx, activity_rx) = activity_channel();

        let mut links: Vec<Box<dyn Extension>> = Vec::new();
        let mut schedules = Vec::new();
        for ext in &config.extensions {
            match ext {
                ExtensionConfig::CompanionDeployment {
                    deployment,
                    namespace,
                    head_start,
                    delay_start,
                    head_stop,
                    delay_stop,
                } => {
                    links.push(Box::new(CompanionDeploymentExtension::new(
                        ScaleTarget::new(namespace, deployment),
                        Arc::clone(&client),
                        parse_optional_duration(head_start)?,
                        parse_optional_duration(delay_start)?,
                        parse_optional_duration(head_stop)?,
                        parse_optional_duration(delay_stop)?,
                    )?));
                }
                ExtensionConfig::ReadinessCheck { url } => {
                    links.push(Box::new(ReadinessCheckExtension::new(url)?));
                }
                ExtensionConfig::ScheduledAlwaysOn {
                    from_utc,
                    to_utc,
                    weekdays,
                    autostart,
                } => {
                    let schedule = Arc::new(ScheduledAlwaysOnExtension::new(
                        from_utc,
                        to_utc,
                        weekdays,
                        *autostart,
                        activity_tx.clone(),
                    )?);
                    links.push(Box::new(Arc::clone(&schedule)));
                    schedules.push(schedule);
                }
            }
        }

        let ControllerConfig::Deployment {
            deployment,
            namespace,
            idle_timeout,
        } = &config.controller;
        let controller = Controller::new(
            ScaleTarget::new(namespace, deployment),
            Arc::clone(&client),
            ExtensionChain::new(links),
            parse_optional_duration(idle_timeout)?,
        );

        let mut middlewares: Vec<Box<dyn Middleware>> = Vec::new();
        for mw in config.middlewares.clone() {
            middlewares.push(build_middleware(
                mw,
                Arc::clone(&controller),
                activity_tx.clone(),
            )?);
        }

        gateway.register(
            &config.name,
            config.link.listen_port,
            config.link.destination(),
            config.link.pass_original_host_header,
            Arc::new(MiddlewareChain::new(middlewares)),
        );

        info!(
            instance = %config.name,
            port = config.link.listen_port,
            destination = %config.link.destination(),
            "Engine assembled"
        );

        Ok(Self {
            name: config.name,
            controller,
            schedules,
            activity_rx,
            activity_tx,
        })
    }

    pub fn controller(&self) -> Arc<Controller> {
        Arc::clone(&self.controller)
    }

    /// Drive the instance until the process shuts down
    pub async fn run(self) {
        info!(instance = %self.name, "Engine running");
        for schedule in &self.schedules {
            let schedule = Arc::clone(schedule);
            tokio::spawn(async move { schedule.run().await });
        }
        // The retained sender keeps the activity channel open for the
        // lifetime of the engine
        let _keep_alive = self.activity_tx;
        self.controller.run(self.activity_rx).await;
    }
}

fn build_middleware(
    config: MiddlewareConfig,
    controller: Arc<Controller>,
    activity: ActivitySender,
) -> anyhow::Result<Box<dyn Middleware>> {
    let mw: Box<dyn Middleware> = match config {
        MiddlewareConfig::Activity { rules } => Box::new(ActivityMiddleware::new(
            RequestMatcher::new(&rules)?,
            activity,
        )),
        MiddlewareConfig::ConnectWaiter { rules } => Box::new(ConnectWaiterMiddleware::new(
            RequestMatcher::new(&rules)?,
            controller,
        )),
        MiddlewareConfig::FixedResponse {
            rules,
            always_respond,
            status_code,
            content_type,
            content,
            content_file,
        } => Box::new(
            FixedResponseMiddleware::new(
                RequestMatcher::new(&rules)?,
                controller,
                always_respond,
                status_code,
                content_type,
                resolve_content(content, content_file, "")?,
            )
            .context("fixedResponse middleware")?,
        ),
        MiddlewareConfig::LoadingWaiter {
            rules,
            content_type,
            content,
            content_file,
        } => Box::new(LoadingWaiterMiddleware::new(
            RequestMatcher::new(&rules)?,
            controller,
            content_type,
            resolve_content(content, content_file, DEFAULT_LOADING_CONTENT)?,
        )),
        MiddlewareConfig::NoneWaiter { rules } => Box::new(NoneWaiterMiddleware::new(
            RequestMatcher::new(&rules)?,
            controller,
        )),
    };
    Ok(mw)
}

fn parse_optional_duration(value: &Option<String>) -> anyhow::Result<Option<Duration>> {
    value.as_deref().map(parse_duration).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::controller::ControllerStatus;
    use crate::scale::Scale;
    use crate::testutil::MockScaleClient;
    use http_body_util::Empty;
    use hyper::body::Bytes;
    use hyper::StatusCode;
    use hyper_util::rt::TokioExecutor;
    use tokio::net::TcpListener;
    use tokio::sync::watch;

    fn sample_config(port: u16) -> InstanceConfig {
        let toml = format!(
            r#"
[[instances]]
name = "webapp"

[instances.link]
listen_port = {port}
service_name = "127.0.0.1"
service_port = 1

[instances.controller]
type = "deployment"
deployment = "webapp"
namespace = "default"
idle_timeout = "1h"

[[instances.middlewares]]
type = "activity"

[[instances.middlewares]]
type = "loadingWaiter"
content_type = "text/html"
content = "<h1>Warming up</h1>"

[[instances.extensions]]
type = "companionDeployment"
deployment = "webapp-cache"
namespace = "default"

[[instances.extensions]]
type = "scheduledAlwaysOn"
from_utc = "00:00"
to_utc = "23:59:59"
weekdays = "monday,tuesday,wednesday,thursday,friday,saturday,sunday"
"#
        );
        let config: Config = toml::from_str(&toml).unwrap();
        config.validate().unwrap();
        config.instances.into_iter().next().unwrap()
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_engine_assembly_registers_listener() {
        let client = Arc::new(MockScaleClient::new());
        let gateway = Gateway::new();
        let port = free_port().await;

        let engine = Engine::new(sample_config(port), client, &gateway).unwrap();
        assert_eq!(gateway.registered_ports(), vec![port]);
        assert_eq!(engine.controller().status(), ControllerStatus::Unknown);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bad_regex_fails_assembly() {
        let client = Arc::new(MockScaleClient::new());
        let gateway = Gateway::new();
        let mut config = sample_config(free_port().await);
        config.middlewares = vec![MiddlewareConfig::Activity {
            rules: crate::config::MatchRules {
                include_path_regex: Some("(unclosed".to_string()),
                ..Default::default()
            },
        }];

        assert!(Engine::new(config, client, &gateway).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_wakes_deactivated_deployment() {
        let client = Arc::new(MockScaleClient::new());
        client.set_scale("default/webapp", Scale { desired: 0, observed: 0 });
        client.set_scale("default/webapp-cache", Scale { desired: 0, observed: 0 });

        let gateway = Arc::new(Gateway::new());
        let port = free_port().await;
        let engine = Engine::new(
            sample_config(port),
            Arc::clone(&client) as SharedScaleClient,
            &gateway,
        )
        .unwrap();
        let controller = engine.controller();
        controller.update_status(None).await.unwrap();
        tokio::spawn(engine.run());

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        gateway.start(shutdown_rx).await.unwrap();

        // The backend is down, so the loading waiter answers the request
        // and the activity signal wakes the deployment
        let http = hyper_util::client::legacy::Client::builder(TokioExecutor::new())
            .build_http::<Empty<Bytes>>();
        let uri = format!("http://127.0.0.1:{}/", port);
        let response = http.get(uri.parse().unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let patches = client.patches();
        // Companion comes up alongside the fronted deployment
        assert!(patches.contains(&("default/webapp".to_string(), 1)));
        assert!(patches.contains(&("default/webapp-cache".to_string(), 1)));
    }
}
