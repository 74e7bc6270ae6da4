//! Error types for the configuration model.

use thiserror::Error;

/// Errors raised while rendering or parsing a configuration document.
#[derive(Debug, Error)]
pub enum ModelError {
    /// The configuration could not be rendered as YAML.
    #[error("failed to render configuration: {0}")]
    Render(#[source] serde_yaml::Error),

    /// A YAML document did not describe a valid configuration.
    #[error("failed to parse configuration: {0}")]
    Parse(#[source] serde_yaml::Error),
}
