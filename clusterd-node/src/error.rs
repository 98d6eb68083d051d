use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0}")]
    /// An IO error has occurred,
    IO(#[from] io::Error),

    #[error("Failed to parse the cluster configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to load the cluster configuration: {0}")]
    ConfigSource(anyhow::Error),

    #[error("Malformed command: {0}")]
    /// The command payload is not valid JSON or does not match the action.
    Command(#[from] serde_json::Error),

    #[error("Unknown action `{0}`.")]
    UnknownAction(String),

    #[error("Missing required option `{0}`.")]
    MissingOption(&'static str),
}
