use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration: a list of proxy instances sharing one process.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Proxy instances, each with its own link, controller, middlewares and extensions
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// Configuration for a single proxy instance
#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    /// Instance name (used in logs)
    pub name: String,

    /// Listener and backend destination
    pub link: LinkConfig,

    /// Scale controller for the fronted deployment
    pub controller: ControllerConfig,

    /// Request middlewares, run in the configured order
    #[serde(default)]
    pub middlewares: Vec<MiddlewareConfig>,

    /// Lifecycle extensions, run in the configured order
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
}

/// Listener and destination for one instance
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    /// Port the shared gateway listens on for this instance
    pub listen_port: u16,

    /// Backend service hostname
    pub service_name: String,

    /// Backend service port
    pub service_port: u16,

    /// Forward the inbound Host header instead of the destination authority
    #[serde(default)]
    pub pass_original_host_header: bool,
}

impl LinkConfig {
    /// Destination authority (`host:port`) requests are relayed to
    pub fn destination(&self) -> String {
        format!("{}:{}", self.service_name, self.service_port)
    }
}

/// Scale controller configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ControllerConfig {
    /// Controls the replica count of a Kubernetes deployment
    Deployment {
        deployment: String,
        namespace: String,
        /// Idle duration after which the deployment is scaled to zero.
        /// Absent means idle-based deactivation never fires.
        idle_timeout: Option<String>,
    },
}

/// Path/user-agent matching rules shared by all request middlewares
#[derive(Debug, Deserialize, Clone, Default)]
pub struct MatchRules {
    /// "include" (default) or "exclude": what to do when no rule matches
    pub default: Option<String>,
    pub include_path_regex: Option<String>,
    pub exclude_path_regex: Option<String>,
    pub include_user_agent_regex: Option<String>,
    pub exclude_user_agent_regex: Option<String>,
}

/// Request middleware configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MiddlewareConfig {
    /// Reports observed traffic to the controller
    Activity {
        #[serde(flatten)]
        rules: MatchRules,
    },
    /// Holds the request until the controller is ready
    ConnectWaiter {
        #[serde(flatten)]
        rules: MatchRules,
    },
    /// Answers with a fixed response while the backend is not ready
    FixedResponse {
        #[serde(flatten)]
        rules: MatchRules,
        /// Respond even when the backend is ready
        #[serde(default)]
        always_respond: bool,
        status_code: u16,
        content_type: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        content_file: Option<String>,
    },
    /// Answers 200 with a loading page while the backend is not ready
    LoadingWaiter {
        #[serde(flatten)]
        rules: MatchRules,
        content_type: String,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        content_file: Option<String>,
    },
    /// Answers 503 while the backend is not ready
    NoneWaiter {
        #[serde(flatten)]
        rules: MatchRules,
    },
}

/// Lifecycle extension configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ExtensionConfig {
    /// Mirrors activation/deactivation onto a second deployment
    CompanionDeployment {
        deployment: String,
        namespace: String,
        /// Start the companion, then hold activation for this long
        head_start: Option<String>,
        /// Start the companion this long after activation, unless superseded
        delay_start: Option<String>,
        /// Stop the companion, then hold deactivation for this long
        head_stop: Option<String>,
        /// Stop the companion this long after deactivation, unless superseded
        delay_stop: Option<String>,
    },
    /// Blocks the transition to Ready until a health probe succeeds
    ReadinessCheck { url: String },
    /// Vetoes deactivation inside a weekday/time-of-day window
    ScheduledAlwaysOn {
        /// Window start, UTC time of day ("HH:MM" or "HH:MM:SS")
        from_utc: String,
        /// Window end, UTC time of day
        to_utc: String,
        /// Comma-separated weekday names ("monday,tuesday,...")
        weekdays: String,
        /// Emit synthetic activity while inside the window
        #[serde(default)]
        autostart: bool,
    },
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all instance configurations
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for instance in &self.instances {
            if let Err(e) = instance.validate() {
                errors.push(format!("instance '{}': {}", instance.name, e));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

impl InstanceConfig {
    fn validate(&self) -> Result<(), String> {
        if self.link.listen_port == 0 {
            return Err("'listen_port' must be greater than 0".to_string());
        }
        if self.link.service_port == 0 {
            return Err("'service_port' must be greater than 0".to_string());
        }

        let ControllerConfig::Deployment { idle_timeout, .. } = &self.controller;
        if let Some(t) = idle_timeout {
            parse_duration(t).map_err(|e| e.to_string())?;
        }

        for ext in &self.extensions {
            if let ExtensionConfig::CompanionDeployment {
                head_start,
                delay_start,
                head_stop,
                delay_stop,
                ..
            } = ext
            {
                if head_start.is_some() && delay_start.is_some() {
                    return Err("cannot specify both 'head_start' and 'delay_start'".to_string());
                }
                if head_stop.is_some() && delay_stop.is_some() {
                    return Err("cannot specify both 'head_stop' and 'delay_stop'".to_string());
                }
                for t in [head_start, delay_start, head_stop, delay_stop]
                    .into_iter()
                    .flatten()
                {
                    parse_duration(t).map_err(|e| e.to_string())?;
                }
            }
        }

        Ok(())
    }
}

/// Parse a human-friendly duration: `"500ms"`, `"90s"`, `"5m"`, `"1h"`,
/// or a plain number of seconds.
pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (value, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = value
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration '{}'", s))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => anyhow::bail!("invalid duration unit '{}' in '{}'", unit, s),
    }
}
