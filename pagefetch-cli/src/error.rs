//! CLI error types.

use thiserror::Error;

/// Errors surfaced to the terminal user.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid URL: {0}")]
    Url(#[from] pagefetch::uri::UriError),

    #[error("{0}")]
    Fetch(String),

    #[error("authentication required for {0}; pass --user and --password")]
    AuthRequired(String),

    #[error(transparent)]
    Auth(#[from] pagefetch::auth::AuthError),

    #[error(transparent)]
    Pipeline(#[from] pagefetch::pipeline::PipelineError),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}
