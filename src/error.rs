use std::{io, time::Duration};

use thiserror::Error;

/// Errors raised inside the live client. Operations that must never fail
/// (`send`, `disconnect`, `stop`, `mark_read`) log these instead of returning them.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake rejected: {0}")]
    Handshake(String),
    #[error("malformed frame: {0}")]
    Frame(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection attempt superseded")]
    Superseded,
    #[error("request failed with HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("resource not found")]
    NotFound,
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("{0} lock poisoned")]
    Poisoned(&'static str),
}

pub type Result<T, E = LiveError> = std::result::Result<T, E>;
