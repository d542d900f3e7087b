use thiserror::Error;

use crate::process::ProcessExit;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to spawn {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed after {attempts} attempt(s); last exit: {exit}")]
    CommandFailed {
        command: String,
        attempts: u32,
        exit: ProcessExit,
    },

    #[error("Channel not live")]
    ChannelNotLive,

    #[error("HLS playlist not ready")]
    PlaylistNotReady,

    #[error("Invalid path")]
    InvalidPath,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
