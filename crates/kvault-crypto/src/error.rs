use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("passphrase must not be empty")]
    EmptyPassphrase,

    #[error("invalid KDF parameters: {0}")]
    InvalidParams(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("encryption failed")]
    Encryption,

    /// Tag mismatch: wrong passphrase or modified ciphertext, deliberately not
    /// told apart.
    #[error("authentication failed")]
    Authentication,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// True for every failure that means "this data does not open with this
    /// passphrase". Callers must not report these differently.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self,
            CryptoError::Authentication
                | CryptoError::Malformed(_)
                | CryptoError::UnsupportedVersion(_)
        )
    }
}
