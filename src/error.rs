use std::fmt;

/// Error codes carried by `ON_ERROR` responses from the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    GenericError,
    InvalidChannel,
    UnknownSubscription,
    UnknownPublication,
    UnknownCounter,
    UnknownCommandTypeId,
    MalformedCommand,
    NotSupported,
    ResourceExhausted,
    Unknown(i32),
}

impl ErrorCode {
    pub fn value(self) -> i32 {
        match self {
            ErrorCode::GenericError => 0,
            ErrorCode::InvalidChannel => 1,
            ErrorCode::UnknownSubscription => 2,
            ErrorCode::UnknownPublication => 3,
            ErrorCode::UnknownCounter => 5,
            ErrorCode::UnknownCommandTypeId => 6,
            ErrorCode::MalformedCommand => 7,
            ErrorCode::NotSupported => 8,
            ErrorCode::ResourceExhausted => 9,
            ErrorCode::Unknown(code) => code,
        }
    }

    pub fn from_value(value: i32) -> Self {
        match value {
            0 => ErrorCode::GenericError,
            1 => ErrorCode::InvalidChannel,
            2 => ErrorCode::UnknownSubscription,
            3 => ErrorCode::UnknownPublication,
            5 => ErrorCode::UnknownCounter,
            6 => ErrorCode::UnknownCommandTypeId,
            7 => ErrorCode::MalformedCommand,
            8 => ErrorCode::NotSupported,
            9 => ErrorCode::ResourceExhausted,
            other => ErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::GenericError => write!(f, "generic error"),
            ErrorCode::InvalidChannel => write!(f, "invalid channel"),
            ErrorCode::UnknownSubscription => write!(f, "unknown subscription"),
            ErrorCode::UnknownPublication => write!(f, "unknown publication"),
            ErrorCode::UnknownCounter => write!(f, "unknown counter"),
            ErrorCode::UnknownCommandTypeId => write!(f, "unknown command type id"),
            ErrorCode::MalformedCommand => write!(f, "malformed command"),
            ErrorCode::NotSupported => write!(f, "not supported"),
            ErrorCode::ResourceExhausted => write!(f, "resource exhausted"),
            ErrorCode::Unknown(code) => write!(f, "error code {code}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("registration {correlation_id} rejected ({code}): {message}")]
    Registration {
        correlation_id: i64,
        code: ErrorCode,
        message: String,
    },
    #[error("driver timeout: {0}")]
    DriverTimeout(String),
    #[error("client timed out by driver")]
    ClientTimeout,
    #[error("client closed")]
    ClientClosed,
    #[error("back pressured")]
    BackPressured,
    #[error("not connected")]
    NotConnected,
    #[error("administrative action in progress, retry")]
    AdminAction,
    #[error("max position exceeded")]
    MaxPositionExceeded,
    #[error("{0} is closed")]
    ClosedResource(&'static str),
    #[error("administration error: {0}")]
    Administration(String),
    #[error("unknown registration: {0}")]
    UnknownRegistration(i64),
    #[error("message length {length} exceeds max {max}")]
    MessageTooLarge { length: usize, max: usize },
    #[error("invalid channel: {0}")]
    InvalidChannel(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("driver broadcast lapped the client listener")]
    ListenerLapped,
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(&'static str),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u32),
}

impl Error {
    /// True for conditions a caller is expected to retry: back pressure,
    /// no connected counterpart, or an in-progress term rotation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackPressured | Error::NotConnected | Error::AdminAction
        )
    }

    /// True when the agent that returned the error must stop its duty cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::ClientClosed | Error::ClientTimeout)
    }
}

/// Receives errors raised off the application thread (duty cycles, driver
/// responses that match no pending call).
pub type ErrorHandler = std::sync::Arc<dyn Fn(&Error) + Send + Sync + 'static>;

pub fn default_error_handler() -> ErrorHandler {
    std::sync::Arc::new(|err: &Error| log::error!("{err}"))
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::{Error, ErrorCode};

    #[test]
    fn error_codes_map_back_from_wire_values() {
        for code in [
            ErrorCode::GenericError,
            ErrorCode::InvalidChannel,
            ErrorCode::UnknownPublication,
            ErrorCode::NotSupported,
            ErrorCode::ResourceExhausted,
        ] {
            assert_eq!(ErrorCode::from_value(code.value()), code);
        }
        assert_eq!(ErrorCode::from_value(42), ErrorCode::Unknown(42));
    }

    #[test]
    fn only_flow_conditions_are_transient() {
        assert!(Error::BackPressured.is_transient());
        assert!(Error::NotConnected.is_transient());
        assert!(Error::AdminAction.is_transient());
        assert!(!Error::ClosedResource("publication").is_transient());
        assert!(!Error::DriverTimeout("stale".into()).is_transient());
    }

    #[test]
    fn client_shutdown_conditions_are_terminal() {
        assert!(Error::ClientClosed.is_terminal());
        assert!(Error::ClientTimeout.is_terminal());
        assert!(!Error::ListenerLapped.is_terminal());
    }
}
