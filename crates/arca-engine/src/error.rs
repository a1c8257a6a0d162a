use std::fmt;

use arca_core::ArcaError;
use thiserror::Error;

/// Top-level operation an engine call performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Backup,
    Restore,
    Verify,
    Forward,
    ExportKey,
    Read,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Backup => "backup",
            Action::Restore => "restore",
            Action::Verify => "verify",
            Action::Forward => "forward",
            Action::ExportKey => "export key",
            Action::Read => "read",
        })
    }
}

/// The single error type returned by [`crate::Engine`] operations.
///
/// Archive decoding failures stay opaque: the cause of a format error is
/// always "archive unreadable".
#[derive(Debug, Error)]
#[error("{action} failed: {source}")]
pub struct SecureError {
    action: Action,
    #[source]
    source: ArcaError,
}

impl SecureError {
    pub fn new(action: Action, source: ArcaError) -> Self {
        Self { action, source }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn is_format(&self) -> bool {
        self.source.is_format()
    }

    pub fn into_inner(self) -> ArcaError {
        self.source
    }
}

pub(crate) trait ForAction<T> {
    fn for_action(self, action: Action) -> Result<T, SecureError>;
}

impl<T> ForAction<T> for Result<T, ArcaError> {
    fn for_action(self, action: Action) -> Result<T, SecureError> {
        self.map_err(|e| SecureError::new(action, e))
    }
}
