use thiserror::Error;

/// The only failures the assessment boundary ever sees. Everything else
/// (bad individual boxes, overlay encoding trouble) is contained inside the
/// pipeline and degrades the optional parts of the output.
#[derive(Debug, Error)]
pub enum AssessError {
    /// The model reply could not be parsed as structured data after fence
    /// stripping. Non-retryable; no partial assessment is produced.
    #[error("model reply is not parseable as JSON: {0}")]
    MalformedReply(String),
    /// The assembled assessment failed response-model validation.
    #[error("assessment failed schema validation: {0}")]
    SchemaViolation(String),
}
