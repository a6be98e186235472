use imagebus_pipeline::HandlerError;
use thiserror::Error;

/// Failures raised by the pipeline stages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// The message structure itself is unrecoverable
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The object key has no `.`-delimited suffix
    #[error("Could not determine image type of {key}")]
    UnknownImageType { key: String },

    /// The object key has a suffix outside the allow-list
    #[error("Unsupported image type {suffix:?} for {key}")]
    UnsupportedImageType { key: String, suffix: String },

    /// The metadata store rejected or failed the write
    #[error("Metadata store failure: {0}")]
    StoreFailure(String),

    /// The outbound notification could not be sent
    #[error("Notification failure: {0}")]
    SendFailure(String),
}

impl PipelineError {
    /// Stable reason code, used as the dead-letter reason and in rejection records
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MalformedEnvelope(_) => "MalformedEnvelope",
            Self::UnknownImageType { .. } => "UnknownImageType",
            Self::UnsupportedImageType { .. } => "UnsupportedImageType",
            Self::StoreFailure(_) => "StoreFailure",
            Self::SendFailure(_) => "SendFailure",
        }
    }

    /// Whether redelivery could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreFailure(_) | Self::SendFailure(_))
    }
}

impl From<PipelineError> for HandlerError {
    fn from(error: PipelineError) -> Self {
        let message = error.to_string();
        if error.is_transient() {
            HandlerError::transient(error.reason(), message)
        } else {
            HandlerError::fatal(error.reason(), message)
        }
    }
}
