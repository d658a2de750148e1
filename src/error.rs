use thiserror::Error;

/// Errors surfaced by the cluster RPC client.
///
/// Cache and queue unavailability are deliberately not represented here: a
/// failing cache read degrades to a miss and a failing queue publish
/// degrades to an abandoned delivery.
#[derive(Debug, Error)]
pub enum RapiError {
    #[error("not found")]
    NotFound,
    #[error("remote API error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for RapiError {
    fn from(e: reqwest::Error) -> Self {
        RapiError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RapiError>;
