/// Structural failures that end a run without producing an archive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunFailure {
    #[error("login failed: {reason}")]
    Authentication { reason: String },

    #[error("failed evaluating toc: {reason}")]
    TocParse { reason: String },

    #[error("toc could not be fetched: {reason}")]
    TocUnavailable { reason: String },

    #[error("failed rendering manifests: {reason}")]
    ManifestRender { reason: String },
}
