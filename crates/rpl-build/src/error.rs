use rpl_core::PipelineError;
use rpl_step::CommandError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("artifact not found at {0}")]
    MissingArtifact(String),
    #[error("source error: {0}")]
    Source(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BuildError> for PipelineError {
    fn from(e: BuildError) -> Self {
        PipelineError::Build(e.to_string())
    }
}
