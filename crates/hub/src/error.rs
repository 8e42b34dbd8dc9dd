use thiserror::Error;

/// Failures of the ingest pipeline. Both are terminal for the message being
/// processed; neither is reported back to the device.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),
}

impl From<sqlx::Error> for IngestError {
    fn from(e: sqlx::Error) -> Self {
        Self::StoreUnavailable(e.into())
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;
