use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error raised while building an image.
pub struct Error(Box<ErrorInner>);

#[derive(Debug)]
pub(crate) enum ErrorInner {
    /// Bad input: the root is not a directory, a listed path cannot be
    /// resolved, or filters were combined with a path list.
    InvalidInput(String),
    /// Bad configuration, e.g. an illegal block size.
    Config(&'static str),
    /// A structural limit was exceeded.
    Limit(&'static str),
    /// A build-time invariant was violated; always a bug.
    Internal(&'static str),
    SerializeMetadata(dwarfs_img::metadata::Error),
    Io(std::io::Error),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            ErrorInner::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ErrorInner::Config(msg) => write!(f, "invalid configuration: {msg}"),
            ErrorInner::Limit(msg) => f.pad(msg),
            ErrorInner::Internal(msg) => write!(f, "internal inconsistency: {msg}"),
            ErrorInner::SerializeMetadata(err) => err.fmt(f),
            ErrorInner::Io(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &*self.0 {
            ErrorInner::Io(err) => Some(err),
            ErrorInner::SerializeMetadata(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ErrorInner> for Error {
    #[cold]
    fn from(err: ErrorInner) -> Self {
        Self(Box::new(err))
    }
}

impl From<std::io::Error> for Error {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        Self(Box::new(ErrorInner::Io(err)))
    }
}

impl From<dwarfs_img::metadata::Error> for Error {
    #[cold]
    fn from(err: dwarfs_img::metadata::Error) -> Self {
        Self(Box::new(ErrorInner::SerializeMetadata(err)))
    }
}
