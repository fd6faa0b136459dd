use camino::Utf8PathBuf;
use thiserror::Error;

/// Top-level error returned by [`DotRenderer`](crate::DotRenderer) operations.
#[derive(Debug, Error)]
pub enum DotbatchError {
    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Couldn't run glob.\n{0}")]
    Glob(#[from] glob::GlobError),

    #[error("Couldn't convert path to UTF-8.\n{0}")]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("Couldn't build the render worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// A single render job that failed, paired with the reason.
#[derive(Debug, Error)]
#[error("'{file}': {error}")]
pub struct JobFailure {
    /// The source file whose render job failed.
    pub file: Utf8PathBuf,
    /// Why it failed.
    pub error: anyhow::Error,
}

/// Every job failure collected during one batch run.
///
/// This is the only error a caller of the batch operation observes; an
/// individual failure is recorded here and never aborts sibling jobs.
#[derive(Debug, Error)]
#[error("Problem(s) generating images:\n{}", list(.0))]
pub struct BatchError(pub Vec<JobFailure>);

fn list(failures: &[JobFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}
