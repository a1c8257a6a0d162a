use thiserror::Error;

pub type ArcaResult<T> = Result<T, ArcaError>;

#[derive(Debug, Error)]
pub enum ArcaError {
    /// Any structural, integrity, or bounds failure while decoding an archive.
    /// Carries no detail about which check failed.
    #[error("archive unreadable")]
    Format,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ArcaError {
    pub fn is_format(&self) -> bool {
        matches!(self, ArcaError::Format)
    }
}

/// Collapse any failure into [`ArcaError::Format`].
///
/// Used on every decode path that consumes archive bytes, so that a short
/// read, a bad digest and a failed signature are indistinguishable to callers.
pub trait OrFormat<T> {
    fn or_format(self) -> ArcaResult<T>;
}

impl<T, E> OrFormat<T> for Result<T, E> {
    fn or_format(self) -> ArcaResult<T> {
        self.map_err(|_| ArcaError::Format)
    }
}

impl<T> OrFormat<T> for Option<T> {
    fn or_format(self) -> ArcaResult<T> {
        self.ok_or(ArcaError::Format)
    }
}
