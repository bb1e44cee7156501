use thiserror::Error;

pub type VaultResult<T> = Result<T, VaultError>;

/// Message returned for every failed authentication, whatever the cause.
pub const AUTHENTICATION_FAILED: &str = "invalid passphrase or data integrity check failed";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Wrong passphrase, tampered data and malformed ciphertext all land here.
    #[error("{}", AUTHENTICATION_FAILED)]
    Authentication,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VaultError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::NotFound(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, VaultError::Authentication)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_message_is_generic() {
        let msg = VaultError::Authentication.to_string();
        assert_eq!(msg, AUTHENTICATION_FAILED);
        assert!(!msg.contains("tag"));
    }

    #[test]
    fn test_predicates() {
        assert!(VaultError::NotFound("k".into()).is_not_found());
        assert!(!VaultError::NotFound("k".into()).is_authentication());
        assert!(VaultError::Authentication.is_authentication());
    }
}
