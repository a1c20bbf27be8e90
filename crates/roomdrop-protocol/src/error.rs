/// Protocol-level errors for roomdrop.
///
/// Per-file failures (`Upload`, `Download`, `Encryption`,
/// `ConditionNotSatisfied`) are reported per item and never abort a batch.
/// `Connection` failures are retried by the session's background loop.
#[derive(Debug, thiserror::Error)]
pub enum RoomdropError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },

    #[error("upload of {file_name} failed: {reason}")]
    Upload { file_name: String, reason: String },

    #[error("download of {file_id} failed: {reason}")]
    Download { file_id: String, reason: String },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("access condition not satisfied: {condition}")]
    ConditionNotSatisfied { condition: String },

    #[error("no transfer item with id {id}")]
    NotFound { id: String },

    #[error("session is not connected")]
    NotConnected,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("background task failed: {0}")]
    Task(String),
}

impl RoomdropError {
    /// Whether repeating the same operation could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RoomdropError::ConditionNotSatisfied { .. }
                | RoomdropError::NotFound { .. }
                | RoomdropError::MalformedRecord { .. }
                | RoomdropError::Config(_)
        )
    }

    /// Text suitable for showing to the person who triggered the operation.
    pub fn user_message(&self) -> String {
        match self {
            RoomdropError::ConditionNotSatisfied { condition } if condition.is_empty() => {
                "You do not meet the access condition for this file.".to_string()
            }
            RoomdropError::ConditionNotSatisfied { condition } => format!(
                "This file is only available to accounts meeting \"{condition}\". \
                 Meet the condition, then download again."
            ),
            RoomdropError::NotConnected => {
                "Not connected to the room yet. The file was not announced.".to_string()
            }
            RoomdropError::NotFound { .. } => "That file is no longer listed.".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for RoomdropError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RoomdropError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RoomdropError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RoomdropError::MalformedRecord {
            reason: e.to_string(),
        }
    }
}

impl From<roomdrop_transport::TransportError> for RoomdropError {
    fn from(e: roomdrop_transport::TransportError) -> Self {
        RoomdropError::Connection(e.to_string())
    }
}
