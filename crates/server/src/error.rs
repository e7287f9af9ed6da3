use std::fmt;

use gridserve_core::AddressError;
use gridserve_engine::EngineError;

/// Server-side error taxonomy. The session boundary maps each variant
/// to its wire behavior: `Protocol` and `NotFound` close the session
/// after their fixed status reply, `Validation` is reported as
/// `{"ERROR": msg}` with the session kept alive, `LockRequired` is an
/// internal contract violation that aborts only the offending session,
/// and `Io` terminates the session silently.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerError {
    /// Malformed handshake or frame shape.
    Protocol,
    /// Resource never appeared within the handshake retry budget.
    NotFound(String),
    /// Bad cell reference, unknown sheet, or malformed data shape.
    Validation(String),
    /// An operation requiring the content lock ran without holding it.
    /// Unreachable through the public protocol; binding acquires the
    /// lock before any operation is dispatched.
    LockRequired,
    /// Transport or filesystem failure.
    Io(String),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol => write!(f, "protocol violation"),
            Self::NotFound(name) => write!(f, "resource not found: {}", name),
            Self::Validation(msg) => f.write_str(msg),
            Self::LockRequired => {
                write!(f, "lock for this resource has not been acquired")
            }
            Self::Io(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<AddressError> for ServerError {
    fn from(err: AddressError) -> Self {
        ServerError::Validation(err.to_string())
    }
}

impl From<EngineError> for ServerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownSheet(_) | EngineError::Malformed(_) => {
                ServerError::Validation(err.to_string())
            }
            EngineError::Io(msg) => ServerError::Io(msg),
        }
    }
}
