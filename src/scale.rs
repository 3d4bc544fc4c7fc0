//! Kubernetes scale subresource client
//!
//! The controller and the companion extension only ever read and patch the
//! `/scale` subresource of a deployment. That narrow surface is captured by
//! the [`ScaleClient`] trait so the rest of the crate never touches the API
//! server directly and tests can substitute a canned implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Default in-cluster service account paths
const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// A deployment whose replica count is being controlled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTarget {
    pub namespace: String,
    pub name: String,
}

impl ScaleTarget {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ScaleTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Desired and observed replica counts reported by the API server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    /// Requested replica count (`spec.replicas`)
    pub desired: i32,
    /// Currently running replica count (`status.replicas`)
    pub observed: i32,
}

/// Error type for scale operations
#[derive(Debug, thiserror::Error)]
pub enum ScaleError {
    #[error("request to API server failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("API server returned {status} for {target}")]
    Api {
        target: String,
        status: reqwest::StatusCode,
    },
    #[error("missing in-cluster environment: {0}")]
    Environment(String),
    #[error("failed to read service account credentials: {0}")]
    Credentials(#[from] std::io::Error),
}

/// Read/patch access to a deployment's scale subresource.
///
/// Implementations must be idempotent under retry; the callers rely on
/// periodic polling rather than watches, so eventual consistency is fine.
#[async_trait]
pub trait ScaleClient: Send + Sync {
    async fn read_scale(&self, target: &ScaleTarget) -> Result<Scale, ScaleError>;
    async fn patch_scale(&self, target: &ScaleTarget, replicas: i32) -> Result<(), ScaleError>;
}

/// Shared scale client, reused across all engines in-process
pub type SharedScaleClient = Arc<dyn ScaleClient>;

#[derive(Debug, Deserialize)]
struct ScaleResource {
    #[serde(default)]
    spec: ScaleSpec,
    #[serde(default)]
    status: ScaleStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ScaleSpec {
    #[serde(default)]
    replicas: i32,
}

#[derive(Debug, Default, Deserialize)]
struct ScaleStatus {
    #[serde(default)]
    replicas: i32,
}

/// Scale client backed by the Kubernetes API server
pub struct ApiServerClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiServerClient {
    /// Build a client from the in-cluster environment: `KUBERNETES_SERVICE_HOST`
    /// / `KUBERNETES_SERVICE_PORT` plus the mounted service account token and CA.
    pub fn in_cluster() -> Result<Self, ScaleError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| ScaleError::Environment("KUBERNETES_SERVICE_HOST not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT")
            .map_err(|_| ScaleError::Environment("KUBERNETES_SERVICE_PORT not set".to_string()))?;

        let token = std::fs::read_to_string(SERVICE_ACCOUNT_TOKEN)?
            .trim()
            .to_string();
        let ca_pem = std::fs::read(SERVICE_ACCOUNT_CA)?;
        let ca = reqwest::Certificate::from_pem(&ca_pem)?;

        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: format!("https://{}:{}", host, port),
            token,
        })
    }

    /// Build a client against an explicit API server URL with a bearer token.
    /// Useful outside the cluster (kubectl proxy, test servers).
    pub fn with_endpoint(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, ScaleError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            token: token.into(),
        })
    }

    fn scale_url(&self, target: &ScaleTarget) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}/scale",
            self.base_url, target.namespace, target.name
        )
    }
}

#[async_trait]
impl ScaleClient for ApiServerClient {
    async fn read_scale(&self, target: &ScaleTarget) -> Result<Scale, ScaleError> {
        let response = self
            .http
            .get(self.scale_url(target))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ScaleError::Api {
                target: target.to_string(),
                status: response.status(),
            });
        }

        let resource: ScaleResource = response.json().await?;
        Ok(Scale {
            desired: resource.spec.replicas,
            observed: resource.status.replicas,
        })
    }

    async fn patch_scale(&self, target: &ScaleTarget, replicas: i32) -> Result<(), ScaleError> {
        let patch = serde_json::json!([
            { "op": "replace", "path": "/spec/replicas", "value": replicas }
        ]);

        let response = self
            .http
            .patch(self.scale_url(target))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json-patch+json")
            .json(&patch)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ScaleError::Api {
                target: target.to_string(),
                status: response.status(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_url() {
        let client = ApiServerClient::with_endpoint("https://10.0.0.1:443", "token").unwrap();
        let target = ScaleTarget::new("default", "webapp");
        assert_eq!(
            client.scale_url(&target),
            "https://10.0.0.1:443/apis/apps/v1/namespaces/default/deployments/webapp/scale"
        );
    }

    #[test]
    fn test_scale_resource_parsing() {
        let json = r#"{
            "kind": "Scale",
            "apiVersion": "autoscaling/v1",
            "metadata": { "name": "webapp", "namespace": "default" },
            "spec": { "replicas": 2 },
            "status": { "replicas": 0 }
        }"#;
        let resource: ScaleResource = serde_json::from_str(json).unwrap();
        assert_eq!(resource.spec.replicas, 2);
        assert_eq!(resource.status.replicas, 0);
    }

    #[test]
    fn test_target_display() {
        let target = ScaleTarget::new("prod", "api");
        assert_eq!(target.to_string(), "prod/api");
    }
}
