use serde::Serialize;
use thiserror::Error;

/// Backend error taxonomy.
///
/// Every per-connection failure is recoverable by the caller; only process
/// level faults (OOM etc.) are allowed to abort.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Channel limit exceeded: {0}")]
    ChannelLimitExceeded(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Transfer interrupted: {0}")]
    TransferInterrupted(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Serializable error for the caller side of the boundary
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    pub code: String,
    pub message: String,
}

impl From<&AppError> for SerializableError {
    fn from(err: &AppError) -> Self {
        let code = match err {
            AppError::AuthFailure(_) => "AUTH_FAILURE",
            AppError::NetworkUnreachable(_) => "NETWORK_UNREACHABLE",
            AppError::Timeout(_) => "TIMEOUT",
            AppError::NotConnected(_) => "NOT_CONNECTED",
            AppError::ChannelLimitExceeded(_) => "CHANNEL_LIMIT_EXCEEDED",
            AppError::PermissionDenied(_) => "PERMISSION_DENIED",
            AppError::PathNotFound(_) => "PATH_NOT_FOUND",
            AppError::TransferInterrupted(_) => "TRANSFER_INTERRUPTED",
            AppError::Ssh(_) => "SSH_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Unknown(_) => "UNKNOWN_ERROR",
        };

        SerializableError {
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// Serialize AppError directly so it can cross the boundary as a value
impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        SerializableError::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Unknown(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_stable() {
        let err = AppError::NotConnected("abc".to_string());
        let ser = SerializableError::from(&err);
        assert_eq!(ser.code, "NOT_CONNECTED");
        assert!(ser.message.contains("abc"));
    }

    #[test]
    fn test_serialize_as_value() {
        let err = AppError::PathNotFound("/nonexistent".to_string());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "PATH_NOT_FOUND");
        assert!(json["message"].as_str().unwrap().contains("/nonexistent"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err: AppError = io.into();
        assert!(matches!(err, AppError::Io(_)));
    }
}
