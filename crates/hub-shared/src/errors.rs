use thiserror::Error;

/// Closed error set for the hub core. Wire-facing variants map onto
/// [`ErrorCode`]; internal variants never leave the process (see
/// `ErrorCode::from` below).
#[derive(Error, Debug)]
pub enum HubError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid message type for this connection")]
    InvalidMessageType,

    #[error("unauthorized")]
    Unauthorized,

    #[error("authentication timed out")]
    AuthTimeout,

    #[error("token expired")]
    TokenExpired,

    #[error("refresh token invalid")]
    InvalidRefreshToken,

    #[error("agent {0} is not known to the hub")]
    UnknownAgent(uuid::Uuid),

    #[error("agent not found")]
    AgentNotFound,

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("not authenticated")]
    NotAuthenticated,

    #[error("repository error: {0}")]
    Repository(String),
}

pub type Result<T> = std::result::Result<T, HubError>;

/// Wire error code, serialized into `ERROR` frames. Kept distinct from
/// `HubError`'s `Display` text so internal detail never leaks onto the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    InvalidMessage,
    InvalidMessageType,
    Unauthorized,
    AuthTimeout,
    TokenExpired,
    InvalidRefreshToken,
    UnknownAgent,
    AgentNotFound,
    ValidationError,
    InternalError,
    ConnectionFailed,
    NotAuthenticated,
    Superseded,
}

impl From<&HubError> for ErrorCode {
    fn from(err: &HubError) -> Self {
        match err {
            HubError::InvalidMessage(_) => Self::InvalidMessage,
            HubError::InvalidMessageType => Self::InvalidMessageType,
            HubError::Unauthorized => Self::Unauthorized,
            HubError::AuthTimeout => Self::AuthTimeout,
            HubError::TokenExpired => Self::TokenExpired,
            HubError::InvalidRefreshToken => Self::InvalidRefreshToken,
            HubError::UnknownAgent(_) => Self::UnknownAgent,
            HubError::AgentNotFound => Self::AgentNotFound,
            HubError::Validation(_) => Self::ValidationError,
            HubError::Internal(_) | HubError::Repository(_) => Self::InternalError,
            HubError::ConnectionFailed(_) => Self::ConnectionFailed,
            HubError::NotAuthenticated => Self::NotAuthenticated,
        }
    }
}
