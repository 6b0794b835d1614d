use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Caller-visible integer error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    Failed = -1,
    InvalidParameter = -2,
    InvalidOperation = -3,
    NotSupported = -4,
    InvalidLicense = -5,
    RequestServerTimeout = -6,
    ServerProcessFailed = -7,
    ReadTryAgain = -102,
    NetworkUnreachable = -103,
    BannedByServer = -205,
    EnterRoomFailed = -3301,
    InvalidSdkAppId = -3317,
    InvalidRoomId = -3318,
    InvalidUserId = -3319,
    InvalidUserSig = -3320,
    ServiceSuspended = -100_013,
}

impl ErrorCode {
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Codes after which the server will not admit the session again
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::InvalidLicense
                | Self::BannedByServer
                | Self::ServiceSuspended
                | Self::InvalidSdkAppId
                | Self::InvalidUserSig
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Operation failed: {0}")]
    Failed(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Invalid license")]
    InvalidLicense,

    #[error("Request to server timed out")]
    RequestServerTimeout,

    #[error("Server failed to process request: {0}")]
    ServerProcessFailed(String),

    #[error("No data available yet, try again")]
    TryAgain,

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Banned by server")]
    BannedByServer,

    #[error("Enter room failed: {0}")]
    EnterRoomFailed(String),

    #[error("Invalid sdk app id")]
    InvalidSdkAppId,

    #[error("Invalid room id: {0}")]
    InvalidRoomId(String),

    #[error("Invalid user id: {0}")]
    InvalidUserId(String),

    #[error("Invalid user signature")]
    InvalidUserSig,

    #[error("Service suspended")]
    ServiceSuspended,
}

impl EngineError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Failed(_) => ErrorCode::Failed,
            Self::InvalidParameter(_) => ErrorCode::InvalidParameter,
            Self::InvalidOperation(_) => ErrorCode::InvalidOperation,
            Self::NotSupported(_) => ErrorCode::NotSupported,
            Self::InvalidLicense => ErrorCode::InvalidLicense,
            Self::RequestServerTimeout => ErrorCode::RequestServerTimeout,
            Self::ServerProcessFailed(_) => ErrorCode::ServerProcessFailed,
            Self::TryAgain => ErrorCode::ReadTryAgain,
            Self::NetworkUnreachable(_) => ErrorCode::NetworkUnreachable,
            Self::BannedByServer => ErrorCode::BannedByServer,
            Self::EnterRoomFailed(_) => ErrorCode::EnterRoomFailed,
            Self::InvalidSdkAppId => ErrorCode::InvalidSdkAppId,
            Self::InvalidRoomId(_) => ErrorCode::InvalidRoomId,
            Self::InvalidUserId(_) => ErrorCode::InvalidUserId,
            Self::InvalidUserSig => ErrorCode::InvalidUserSig,
            Self::ServiceSuspended => ErrorCode::ServiceSuspended,
        }
    }

    /// Build the error a server-side rejection code stands for
    #[must_use]
    pub fn from_code(code: ErrorCode, context: impl Into<String>) -> Self {
        let context = context.into();
        match code {
            ErrorCode::Ok | ErrorCode::Failed => Self::Failed(context),
            ErrorCode::InvalidParameter => Self::InvalidParameter(context),
            ErrorCode::InvalidOperation => Self::InvalidOperation(context),
            ErrorCode::NotSupported => Self::NotSupported(context),
            ErrorCode::InvalidLicense => Self::InvalidLicense,
            ErrorCode::RequestServerTimeout => Self::RequestServerTimeout,
            ErrorCode::ServerProcessFailed => Self::ServerProcessFailed(context),
            ErrorCode::ReadTryAgain => Self::TryAgain,
            ErrorCode::NetworkUnreachable => Self::NetworkUnreachable(context),
            ErrorCode::BannedByServer => Self::BannedByServer,
            ErrorCode::EnterRoomFailed => Self::EnterRoomFailed(context),
            ErrorCode::InvalidSdkAppId => Self::InvalidSdkAppId,
            ErrorCode::InvalidRoomId => Self::InvalidRoomId(context),
            ErrorCode::InvalidUserId => Self::InvalidUserId(context),
            ErrorCode::InvalidUserSig => Self::InvalidUserSig,
            ErrorCode::ServiceSuspended => Self::ServiceSuspended,
        }
    }

    pub(crate) fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub(crate) fn invalid_parameter(msg: impl Into<String>) -> Self {
        Self::InvalidParameter(msg.into())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Terminal recording failures reported through the record delegate
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordError {
    #[error("Room not found")]
    NotFoundRoom,

    #[error("Disk I/O failure")]
    DiskIo,
}

impl RecordError {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::NotFoundRoom => -1,
            Self::DiskIo => -2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_match_wire_values() {
        assert_eq!(EngineError::TryAgain.code().as_i32(), -102);
        assert_eq!(EngineError::InvalidRoomId(String::new()).code().as_i32(), -3318);
        assert_eq!(EngineError::ServiceSuspended.code().as_i32(), -100_013);
        assert_eq!(RecordError::DiskIo.code(), -2);
    }

    #[test]
    fn test_from_code_round_trips_code() {
        for code in [
            ErrorCode::BannedByServer,
            ErrorCode::InvalidUserSig,
            ErrorCode::NetworkUnreachable,
            ErrorCode::EnterRoomFailed,
        ] {
            assert_eq!(EngineError::from_code(code, "server").code(), code);
        }
    }

    #[test]
    fn test_fatal_codes() {
        assert!(ErrorCode::BannedByServer.is_fatal());
        assert!(ErrorCode::ServiceSuspended.is_fatal());
        assert!(!ErrorCode::NetworkUnreachable.is_fatal());
        assert!(!ErrorCode::RequestServerTimeout.is_fatal());
    }
}
