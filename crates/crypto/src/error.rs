use murmur_shared::error::MurmurError;

/// Errors produced by the crypto engine.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("no session exists for {address}")]
    SessionNotFound { address: String },

    #[error("session with {address} is corrupted: {detail}")]
    SessionCorrupted { address: String, detail: String },

    #[error("identity has not been initialized on this device")]
    IdentityNotInitialized,

    #[error("identity already initialized on this device")]
    AlreadyInitialized,

    #[error("master key is not loaded; unlock or recover first")]
    MasterKeyUnavailable,

    #[error("one-time pre-key {key_id} has already been consumed")]
    PreKeyAlreadyConsumed { key_id: u32 },

    #[error("pre-key {key_id} not found")]
    PreKeyNotFound { key_id: u32 },

    #[error("timed out fetching pre-key bundle from directory")]
    BundleFetchTimeout,

    #[error("directory service unavailable: {0}")]
    DirectoryUnavailable(String),

    #[error("recovery phrase is invalid")]
    InvalidRecoveryPhrase,

    #[error("recovery phrase is no longer available on this device")]
    RecoveryPhraseUnavailable,

    #[error("message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

impl From<rusqlite::Error> for CryptoError {
    fn from(err: rusqlite::Error) -> Self {
        CryptoError::StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(err: serde_json::Error) -> Self {
        CryptoError::SerializationError(err.to_string())
    }
}

impl From<CryptoError> for MurmurError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::SessionCorrupted { .. } => MurmurError::SessionCompromised,
            CryptoError::BundleFetchTimeout | CryptoError::DirectoryUnavailable(_) => {
                MurmurError::ServiceUnavailable(err.to_string())
            }
            CryptoError::MessageTooLarge { .. } => MurmurError::Validation(err.to_string()),
            other => MurmurError::Crypto(other.to_string()),
        }
    }
}
