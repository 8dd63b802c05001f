//! Error types for this crate.

use std::fmt::Display;
use std::sync::Arc;

/// A convenience type alias for a `Result` with an `Error` type.
pub type Result<T> = std::result::Result<T, Error>;

/// An error reported by the connection lifecycle or by a host Bluetooth stack.
#[derive(Debug, Clone)]
pub struct Error {
    data: ErrorData,
}

/// The kind of error that occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    /// A connection attempt did not complete.
    ConnectFailed,
    /// Service or characteristic discovery failed or found nothing usable.
    DiscoveryFailed,
    /// Enabling notifications on the target characteristic failed.
    SubscribeFailed,
    /// The peripheral disconnected without being asked to.
    UnexpectedDisconnect,
    /// A characteristic value was not valid UTF-8.
    InvalidPayload,
    /// A scan was requested while a session is in progress.
    SessionActive,
    /// The lifecycle has already been started or restored.
    AlreadyStarted,
    /// The adapter stopped being usable while a session was in progress.
    PoweredOff,
    /// The event queue was closed.
    Closed,
    /// An unknown or other error.
    Other,
}

#[derive(Debug, Clone)]
enum ErrorData {
    Os(ErrorKind, Arc<dyn std::error::Error + Send + Sync>),
    Simple(ErrorKind),
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            ErrorData::Os(kind, error) => write!(f, "{kind}: {error}"),
            ErrorData::Simple(kind) => kind.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.data {
            ErrorData::Os(_, error) => Some(&**error),
            ErrorData::Simple(_) => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            data: ErrorData::Simple(kind),
        }
    }
}

impl Error {
    /// Creates an error of the given kind wrapping an error from the host Bluetooth stack.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error {
            data: ErrorData::Os(kind, Arc::from(error.into())),
        }
    }

    /// Returns a copy of this error reclassified as `kind`, keeping any host error.
    pub fn with_kind(&self, kind: ErrorKind) -> Self {
        match &self.data {
            ErrorData::Os(_, error) => Error {
                data: ErrorData::Os(kind, error.clone()),
            },
            ErrorData::Simple(_) => kind.into(),
        }
    }

    /// If this error wraps a host error, returns a reference to it.
    pub fn get_ref(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match &self.data {
            ErrorData::Os(_, error) => Some(&**error),
            ErrorData::Simple(_) => None,
        }
    }

    /// If this error wraps a host error, returns it.
    pub fn into_inner(self) -> Option<Arc<dyn std::error::Error + Send + Sync>> {
        match self.data {
            ErrorData::Os(_, error) => Some(error),
            ErrorData::Simple(_) => None,
        }
    }

    /// Returns the kind of error.
    pub fn kind(&self) -> ErrorKind {
        match &self.data {
            ErrorData::Os(kind, _) | ErrorData::Simple(kind) => *kind,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ConnectFailed => f.write_str("connection failed"),
            ErrorKind::DiscoveryFailed => f.write_str("discovery failed"),
            ErrorKind::SubscribeFailed => f.write_str("subscribe failed"),
            ErrorKind::UnexpectedDisconnect => f.write_str("unexpected disconnect"),
            ErrorKind::InvalidPayload => f.write_str("invalid payload"),
            ErrorKind::SessionActive => f.write_str("a session is already active"),
            ErrorKind::AlreadyStarted => f.write_str("already started"),
            ErrorKind::PoweredOff => f.write_str("adapter powered off"),
            ErrorKind::Closed => f.write_str("event queue closed"),
            ErrorKind::Other => f.write_str("other error"),
        }
    }
}
