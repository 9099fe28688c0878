use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds callers need to tell apart. They travel inside
/// `anyhow::Error` and can be recovered with `downcast_ref::<MwError>()`.
#[derive(Debug, Error)]
pub enum MwError {
    #[error("invalid extension name {input:?}: {reason}")]
    InvalidName { input: String, reason: String },

    #[error(
        "{} is not a MediaWiki installation root (expected index.php, extensions/ and skins/)",
        path.display()
    )]
    NotAnInstallationRoot { path: PathBuf },

    #[error("operation cancelled")]
    Cancelled,
}

impl MwError {
    pub fn invalid_name(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidName {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// True when `error` (or anything in its context chain) is a cancellation.
pub fn is_cancelled(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| matches!(cause.downcast_ref::<MwError>(), Some(MwError::Cancelled)))
}
