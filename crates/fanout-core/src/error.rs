use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("malformed identity {0}")]
    MalformedIdentity(String),
    #[error("directory {0}")]
    Directory(String),
    #[error("session establish {0}")]
    SessionEstablish(String),
    #[error("encrypt for {device}: {reason}")]
    PerDeviceEncrypt { device: String, reason: String },
    #[error("media retry failed with code {code}")]
    MediaRetryFailed { code: i64 },
    #[error("media retry notification {0}")]
    MediaRetryNotification(String),
    #[error("missing ids in receipt")]
    InvalidReceipt,
    #[error("upstream {0}")]
    Upstream(String),
    #[error("transport {0}")]
    Transport(String),
    #[error("storage")]
    Storage,
    #[error("crypto")]
    Crypto,
    #[error("config {0}")]
    Config(String),
    #[error("not found")]
    NotFound,
}

impl CoreError {
    pub fn encrypt(device: impl ToString, reason: impl ToString) -> Self {
        CoreError::PerDeviceEncrypt {
            device: device.to_string(),
            reason: reason.to_string(),
        }
    }
}
