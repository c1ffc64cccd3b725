use thiserror::Error;

/// Error kinds that drive control flow at the queue boundary.
///
/// `CodeGenerationFailed` is the one kind the scheduler branches on: it sends
/// the job to the dead queue instead of done/error. Everything else reaches
/// `done_error` with the message recorded on the job.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("response parse failed: {0}")]
    ParseFailed(String),

    #[error("Code generation failed: {0}")]
    CodeGenerationFailed(String),

    #[error("restore not supported for {0}")]
    RestoreUnsupported(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, AgentError::CodeGenerationFailed(_))
    }
}
