use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The queue could not be reached, or refused to service the request.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    #[error("invalid queue url {0}")]
    InvalidUrl(String),
    /// The queue answered, but with a body that does not follow the queue protocol.
    #[error("queue returned an unexpected schema: {0}")]
    SchemaError(String),
}

impl From<reqwest::Error> for QueueError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return Self::SchemaError(e.to_string());
        }
        match e.status() {
            Some(code) => Self::Unavailable(format!("queue responded with {code}")),
            None => Self::Unavailable(e.to_string()),
        }
    }
}

impl QueueError {
    pub(crate) fn unexpected_status(status: StatusCode) -> Self {
        Self::Unavailable(format!("queue responded with {status}"))
    }
}
