use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Cannot execute an empty command.")]
    /// A hook or crash command was configured without any argv.
    EmptyCommand,

    #[error("Failed to spawn `{program}`: {source}")]
    /// The command could not be started.
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    /// An IO error has occurred,
    IO(#[from] io::Error),

    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
}
