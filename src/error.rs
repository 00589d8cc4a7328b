pub type OverlayResult<T> = Result<T, OverlayError>;

/// Error taxonomy for an overlay job.
///
/// Everything below the pipeline either fails the whole job or is downgraded
/// to a warning at the orchestrator; no variant is retried automatically.
#[derive(thiserror::Error, Debug)]
pub enum OverlayError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("invalid stream: {0}")]
    InvalidStream(String),

    #[error("wrong stream type: {0}")]
    WrongStreamType(String),

    #[error("subprocess failed: {0}")]
    Subprocess(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OverlayError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_stream(msg: impl Into<String>) -> Self {
        Self::InvalidStream(msg.into())
    }

    pub fn wrong_stream_type(msg: impl Into<String>) -> Self {
        Self::WrongStreamType(msg.into())
    }

    pub fn subprocess(msg: impl Into<String>) -> Self {
        Self::Subprocess(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl<E: std::error::Error + Send + Sync + 'static>
    From<plotters::drawing::DrawingAreaErrorKind<E>> for OverlayError
{
    fn from(value: plotters::drawing::DrawingAreaErrorKind<E>) -> Self {
        OverlayError::Validation(format!("plot rendering failed: {value}"))
    }
}
