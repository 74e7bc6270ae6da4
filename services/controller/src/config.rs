use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::agent::AgentSettings;
use crate::controllers::ControllerSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Optional YAML file applied to the store at startup.
    pub manifest: Option<PathBuf>,
    pub controllers: ControllerSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = AgentSettings::default();

        let agent = AgentSettings {
            namespace: lookup("IPRULER_AGENT_NAMESPACE").unwrap_or(defaults.namespace),
            label_key: lookup("IPRULER_AGENT_LABEL_KEY").unwrap_or(defaults.label_key),
            label_value: lookup("IPRULER_AGENT_LABEL_VALUE").unwrap_or(defaults.label_value),
            api_port: parsed(&lookup, "IPRULER_AGENT_API_PORT", defaults.api_port)?,
            update_path: lookup("IPRULER_AGENT_UPDATE_PATH").unwrap_or(defaults.update_path),
            cleanup_path: lookup("IPRULER_AGENT_CLEANUP_PATH").unwrap_or(defaults.cleanup_path),
            timeout: Duration::from_millis(parsed(
                &lookup,
                "IPRULER_AGENT_TIMEOUT_MS",
                defaults.timeout.as_millis() as u64,
            )?),
            max_attempts: parsed(&lookup, "IPRULER_AGENT_MAX_ATTEMPTS", defaults.max_attempts)?,
            retry_delay: defaults.retry_delay,
        };

        let controller_defaults = ControllerSettings::default();
        let controllers = ControllerSettings {
            agent,
            cleanup_on_delete: lookup("IPRULER_CLEANUP_ON_DELETE")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(controller_defaults.cleanup_on_delete),
            empty_requeue: Duration::from_secs(parsed(
                &lookup,
                "IPRULER_EMPTY_REQUEUE_SECS",
                controller_defaults.empty_requeue.as_secs(),
            )?),
            max_concurrent_pushes: parsed(
                &lookup,
                "IPRULER_AGENT_MAX_CONCURRENT_PUSHES",
                controller_defaults.max_concurrent_pushes,
            )?,
        };

        let listen_addr = lookup("IPRULER_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8081".to_string())
            .parse()
            .context("invalid IPRULER_LISTEN_ADDR")?;

        let log_level = lookup("IPRULER_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let manifest = lookup("IPRULER_MANIFEST")
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);

        Ok(Self {
            listen_addr,
            log_level,
            manifest,
            controllers,
        })
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {raw:?}")),
        None => Ok(default),
    }
}
