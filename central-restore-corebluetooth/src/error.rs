//! Conversion of CoreBluetooth errors into lifecycle errors.

use std::fmt::Display;

use central_restore::{Error, ErrorKind};
use objc2_core_bluetooth::{CBATTErrorDomain, CBErrorDomain};
use objc2_foundation::NSError;

/// The error domain an [`OsError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsErrorDomain {
    Bluetooth,
    ATT,
    Other,
}

/// A snapshot of an `NSError` that can leave the dispatch queue it was reported on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsError {
    domain: OsErrorDomain,
    code: isize,
    description: String,
}

impl OsError {
    pub(crate) fn new(error: &NSError) -> Self {
        let domain = error.domain();
        let domain = if &*domain == unsafe { CBErrorDomain } {
            OsErrorDomain::Bluetooth
        } else if &*domain == unsafe { CBATTErrorDomain } {
            OsErrorDomain::ATT
        } else {
            OsErrorDomain::Other
        };

        OsError {
            domain,
            code: error.code(),
            description: error.localizedDescription().to_string(),
        }
    }

    pub fn domain(&self) -> OsErrorDomain {
        self.domain
    }

    pub fn code(&self) -> isize {
        self.code
    }
}

impl Display for OsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?} {})", self.description, self.domain, self.code)
    }
}

impl std::error::Error for OsError {}

pub(crate) fn from_nserror(kind: ErrorKind, error: &NSError) -> Error {
    Error::new(kind, OsError::new(error))
}

pub(crate) fn from_nserror_or_kind(error: Option<&NSError>, kind: ErrorKind) -> Error {
    match error {
        Some(error) => from_nserror(kind, error),
        None => kind.into(),
    }
}

pub(crate) fn or_err<T>(value: T, error: Option<&NSError>, kind: ErrorKind) -> central_restore::Result<T> {
    match error {
        Some(error) => Err(from_nserror(kind, error)),
        None => Ok(value),
    }
}
