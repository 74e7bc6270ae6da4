//! Agent discovery and the HTTP push client.
//!
//! An agent is a ready pod carrying the agent label in the agent namespace.
//! Configuration is pushed as YAML to `http://<podIP>:<port>/<update-path>`;
//! withdrawal is an empty POST to `<cleanup-path>`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;
use tracing::{debug, warn};

use crate::resources::{ObjectKey, Pod, Resource};

/// How agents are found and reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub namespace: String,
    pub label_key: String,
    pub label_value: String,
    pub api_port: u16,
    pub update_path: String,
    pub cleanup_path: String,
    /// Per-attempt request timeout.
    pub timeout: Duration,
    /// Attempts per push, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub retry_delay: Duration,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            namespace: "kube-system".to_string(),
            label_key: "app".to_string(),
            label_value: "ipruler-agent".to_string(),
            api_port: 9301,
            update_path: "update".to_string(),
            cleanup_path: "cleanup".to_string(),
            timeout: Duration::from_millis(5000),
            max_attempts: 2,
            retry_delay: Duration::from_millis(200),
        }
    }
}

impl AgentSettings {
    /// Returns true if `pod` is an agent pod, ready or not.
    pub fn selects(&self, pod: &Pod) -> bool {
        pod.metadata.namespace == self.namespace
            && pod.metadata.labels.get(&self.label_key) == Some(&self.label_value)
    }
}

/// A ready agent and the node it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEndpoint {
    pub pod: ObjectKey,
    pub node_name: String,
    pub address: IpAddr,
}

impl AgentEndpoint {
    /// The endpoint of a ready, addressed pod. `None` otherwise.
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        if !pod.is_ready() {
            return None;
        }
        let address = pod.status.pod_ip.parse().ok()?;
        Some(Self {
            pod: pod.key(),
            node_name: pod.spec.node_name.clone(),
            address,
        })
    }
}

impl fmt::Display for AgentEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.pod, self.address)
    }
}

/// A push that did not reach or was not accepted by an agent.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("agent {agent} unreachable: {source}")]
    Transport {
        agent: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("agent {agent} rejected push with {status}: {body}")]
    Rejected {
        agent: String,
        status: u16,
        body: String,
    },

    #[error("failed to build agent client: {0}")]
    Client(#[source] reqwest::Error),
}

impl DeliveryError {
    /// Transport failures and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Client(_) => false,
        }
    }
}

/// Outbound channel to agents.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Push a rendered configuration. Returns the agent's response body.
    async fn push_config(&self, agent: &AgentEndpoint, payload: &str)
        -> Result<String, DeliveryError>;

    /// Ask the agent to withdraw everything it applied.
    async fn cleanup(&self, agent: &AgentEndpoint) -> Result<String, DeliveryError>;
}

/// [`AgentTransport`] over plain HTTP.
pub struct HttpAgentClient {
    client: reqwest::Client,
    port: u16,
    update_path: String,
    cleanup_path: String,
    max_attempts: u32,
    retry_delay: Duration,
}

impl HttpAgentClient {
    pub fn new(settings: &AgentSettings) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .connect_timeout(settings.timeout)
            .build()
            .map_err(DeliveryError::Client)?;

        Ok(Self {
            client,
            port: settings.api_port,
            update_path: settings.update_path.clone(),
            cleanup_path: settings.cleanup_path.clone(),
            max_attempts: settings.max_attempts.max(1),
            retry_delay: settings.retry_delay,
        })
    }

    fn url(&self, agent: &AgentEndpoint, path: &str) -> String {
        format!(
            "http://{}/{}",
            SocketAddr::new(agent.address, self.port),
            path.trim_start_matches('/')
        )
    }

    async fn post(
        &self,
        agent: &AgentEndpoint,
        path: &str,
        body: String,
    ) -> Result<String, DeliveryError> {
        let url = self.url(agent, path);
        let mut attempt = 1;
        loop {
            match self.post_once(agent, &url, body.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    debug!(agent = %agent, attempt, error = %e, "Agent push failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once(
        &self,
        agent: &AgentEndpoint,
        url: &str,
        body: String,
    ) -> Result<String, DeliveryError> {
        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|source| DeliveryError::Transport {
                agent: agent.to_string(),
                source,
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            warn!(agent = %agent, status = %status, body = %body, "Agent rejected push");
            return Err(DeliveryError::Rejected {
                agent: agent.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl AgentTransport for HttpAgentClient {
    async fn push_config(
        &self,
        agent: &AgentEndpoint,
        payload: &str,
    ) -> Result<String, DeliveryError> {
        self.post(agent, &self.update_path, payload.to_string()).await
    }

    async fn cleanup(&self, agent: &AgentEndpoint) -> Result<String, DeliveryError> {
        self.post(agent, &self.cleanup_path, String::new()).await
    }
}
