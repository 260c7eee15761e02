use thiserror::Error;

use crate::app::asset_manager::AssetKind;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("malformed address: {0}")]
    MalformedAddress(String),

    #[error("malformed credentials: {0}")]
    MalformedCredentials(String),

    #[error("port out of range: {0}")]
    PortOutOfRange(String),

    #[error("unsupported share link scheme")]
    UnsupportedScheme,

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("at least one inbound is required")]
    MissingInbound,

    #[error("at least one outbound is required")]
    MissingOutbound,

    #[error("handle {0} not found")]
    HandleNotFound(i64),

    #[error("config not loaded")]
    NotConfigured,

    #[error("instance is already running")]
    AlreadyRunning,

    #[error("instance is not running")]
    NotRunning,

    #[error("asset {0} is already being downloaded")]
    AlreadyDownloading(AssetKind),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Whether the caller may simply retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::AlreadyDownloading(_)
                | BridgeError::Transport(_)
                | BridgeError::Io(_)
                | BridgeError::Engine(_)
        )
    }

    /// Whether the error stems from caller-supplied text that should be re-entered.
    pub fn is_input_error(&self) -> bool {
        self.kind().status_code() == -3
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::MalformedPayload(_) => ErrorKind::MalformedPayload,
            BridgeError::MalformedAddress(_) => ErrorKind::MalformedAddress,
            BridgeError::MalformedCredentials(_) => ErrorKind::MalformedCredentials,
            BridgeError::PortOutOfRange(_) => ErrorKind::PortOutOfRange,
            BridgeError::UnsupportedScheme => ErrorKind::UnsupportedScheme,
            BridgeError::UnsupportedProtocol(_) => ErrorKind::UnsupportedProtocol,
            BridgeError::MissingInbound => ErrorKind::MissingInbound,
            BridgeError::MissingOutbound => ErrorKind::MissingOutbound,
            BridgeError::HandleNotFound(_) => ErrorKind::HandleNotFound,
            BridgeError::NotConfigured => ErrorKind::NotConfigured,
            BridgeError::AlreadyRunning => ErrorKind::AlreadyRunning,
            BridgeError::NotRunning => ErrorKind::NotRunning,
            BridgeError::AlreadyDownloading(_) => ErrorKind::AlreadyDownloading,
            BridgeError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            BridgeError::Io(_) => ErrorKind::Io,
            BridgeError::Transport(_) => ErrorKind::Transport,
            BridgeError::Engine(_) => ErrorKind::Engine,
            BridgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 边界层上报的错误文本：`CODE: message`
    pub fn report(&self) -> String {
        format!("{}: {}", self.kind().as_str(), self)
    }
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedPayload,
    MalformedAddress,
    MalformedCredentials,
    PortOutOfRange,
    UnsupportedScheme,
    UnsupportedProtocol,
    MissingInbound,
    MissingOutbound,
    HandleNotFound,
    NotConfigured,
    AlreadyRunning,
    NotRunning,
    AlreadyDownloading,
    InvalidConfig,
    Io,
    Transport,
    Engine,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedPayload => "MALFORMED_PAYLOAD",
            ErrorKind::MalformedAddress => "MALFORMED_ADDRESS",
            ErrorKind::MalformedCredentials => "MALFORMED_CREDENTIALS",
            ErrorKind::PortOutOfRange => "PORT_OUT_OF_RANGE",
            ErrorKind::UnsupportedScheme => "UNSUPPORTED_SCHEME",
            ErrorKind::UnsupportedProtocol => "UNSUPPORTED_PROTOCOL",
            ErrorKind::MissingInbound => "MISSING_INBOUND",
            ErrorKind::MissingOutbound => "MISSING_OUTBOUND",
            ErrorKind::HandleNotFound => "HANDLE_NOT_FOUND",
            ErrorKind::NotConfigured => "NOT_CONFIGURED",
            ErrorKind::AlreadyRunning => "ALREADY_RUNNING",
            ErrorKind::NotRunning => "NOT_RUNNING",
            ErrorKind::AlreadyDownloading => "ALREADY_DOWNLOADING",
            ErrorKind::InvalidConfig => "INVALID_CONFIG",
            ErrorKind::Io => "IO",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Engine => "ENGINE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// C ABI 返回码（稳定，不可随意变更）
    pub fn status_code(self) -> i32 {
        match self {
            ErrorKind::NotRunning => -1,
            ErrorKind::AlreadyRunning => -2,
            ErrorKind::MalformedPayload
            | ErrorKind::MalformedAddress
            | ErrorKind::MalformedCredentials
            | ErrorKind::PortOutOfRange
            | ErrorKind::UnsupportedScheme
            | ErrorKind::UnsupportedProtocol
            | ErrorKind::MissingInbound
            | ErrorKind::MissingOutbound
            | ErrorKind::InvalidConfig => -3,
            ErrorKind::Io | ErrorKind::Transport | ErrorKind::Engine | ErrorKind::Internal => -4,
            ErrorKind::HandleNotFound => -5,
            ErrorKind::NotConfigured => -6,
            ErrorKind::AlreadyDownloading => -7,
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        BridgeError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::InvalidConfig(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for BridgeError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        BridgeError::Internal(e.to_string())
    }
}

impl From<BridgeError> for std::io::Error {
    fn from(e: BridgeError) -> Self {
        std::io::Error::other(e.to_string())
    }
}
