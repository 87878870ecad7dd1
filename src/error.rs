use core::fmt;
use core::num::ParseIntError;

/// Errors surfaced by the cellular data core.
///
/// Transient radio failures never show up here; they are absorbed by the
/// retry policy and only become visible as connection state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // Boundary validation
    InvalidParameter,
    InvalidSlot(i32),
    BufferTooLarge(usize),
    MissingCallback,

    // Lookup failures
    ApnHolderNotFound,
    NoMatchedApn,
    ConnectionNotFound,
    /// A bounded table is full.
    CapacityExceeded(usize),

    // Collaborator failures
    Radio(i32),
    Supplier(i32),
    SimAccount(i32),

    QueueFull,
    NotSupported,
    PermissionDenied,
    Parse,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidSlot(slot) => write!(f, "invalid slot id {}", slot),
            Self::BufferTooLarge(len) => write!(f, "buffer of {} bytes exceeds limit", len),
            Self::MissingCallback => write!(f, "callback missing"),
            Self::ApnHolderNotFound => write!(f, "no apn holder for type"),
            Self::NoMatchedApn => write!(f, "no matched apn"),
            Self::ConnectionNotFound => write!(f, "connection not found"),
            Self::CapacityExceeded(max) => write!(f, "table of {} entries is full", max),
            Self::Radio(code) => write!(f, "radio error {}", code),
            Self::Supplier(code) => write!(f, "net supplier error {}", code),
            Self::SimAccount(code) => write!(f, "sim account error {}", code),
            Self::QueueFull => write!(f, "event queue full"),
            Self::NotSupported => write!(f, "not supported"),
            Self::PermissionDenied => write!(f, "permission denied"),
            Self::Parse => write!(f, "parse error"),
        }
    }
}

impl std::error::Error for Error {}

impl From<ParseIntError> for Error {
    fn from(_: ParseIntError) -> Self {
        Self::Parse
    }
}

impl<T> From<embassy_sync::channel::TrySendError<T>> for Error {
    fn from(_: embassy_sync::channel::TrySendError<T>) -> Self {
        Self::QueueFull
    }
}

/// Stable result codes handed back across the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Success = 0,
    InvalidParameter = 8_300_001,
    InternalError = 8_300_003,
    PermissionDenied = 8_300_004,
    NotSupported = 8_300_005,
    SlotNotActive = 8_300_006,
}

impl From<&Error> for ResultCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::InvalidParameter
            | Error::InvalidSlot(_)
            | Error::BufferTooLarge(_)
            | Error::MissingCallback
            | Error::Parse => Self::InvalidParameter,
            Error::NotSupported => Self::NotSupported,
            Error::PermissionDenied => Self::PermissionDenied,
            Error::QueueFull => Self::SlotNotActive,
            _ => Self::InternalError,
        }
    }
}

impl<T> From<Result<T, Error>> for ResultCode {
    fn from(r: Result<T, Error>) -> Self {
        match r {
            Ok(_) => Self::Success,
            Err(e) => Self::from(&e),
        }
    }
}
