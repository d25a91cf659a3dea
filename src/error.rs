use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Unauthenticated!")]
    NoUser,
    #[error("Box key pair not loaded!")]
    NoBoxPair,
    #[error("Failed to generate secret!")]
    NoSecret,
    #[error("Empty data!")]
    NoEncryptionData,
    #[error("Failed to encrypt data!")]
    EncryptFailed,
    #[error("Failed to decrypt data!")]
    DecryptFailed,
    #[error("Failed to sign out!")]
    SignOutFailed,
    #[error("Invalid cipher content!")]
    InvalidCipher,
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("User already created!")]
    UserExists,
    #[error("Wrong user or password.")]
    WrongCredentials,
    #[error("User not found")]
    UserNotFound,
    #[error("Friend already exists")]
    FriendExists,
    #[error("Friend not found!")]
    FriendNotFound,

    #[error("Unauthorized write to {0}")]
    Unauthorized(String),
    #[error("Content address mismatch for {soul}/{key}")]
    AddressMismatch { soul: String, key: String },
    #[error("Immutable field {soul}/{key} already written")]
    Immutable { soul: String, key: String },
    #[error("Cannot put a scalar on root node {0}")]
    ScalarOnRoot(String),
    #[error("Failed to set values! {0}")]
    SetValues(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;
