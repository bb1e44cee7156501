//! Caller-supplied passphrase.
//!
//! `Passphrase` is deliberately not `Clone`, `Serialize` or `Display`: it is
//! moved into the call that needs it and zeroized when that call drops it.

use secrecy::{ExposeSecret, SecretString};

use crate::error::CryptoError;

pub struct Passphrase(SecretString);

impl Passphrase {
    /// Wrap a passphrase. Empty passphrases are rejected.
    pub fn new(value: impl Into<String>) -> Result<Self, CryptoError> {
        let value: String = value.into();
        if value.is_empty() {
            return Err(CryptoError::EmptyPassphrase);
        }
        Ok(Self(SecretString::from(value)))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.expose_secret().as_bytes()
    }
}

impl TryFrom<String> for Passphrase {
    type Error = CryptoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Passphrase {
    type Error = CryptoError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Passphrase([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(
            Passphrase::new(""),
            Err(CryptoError::EmptyPassphrase)
        ));
        assert!(Passphrase::try_from(String::new()).is_err());
    }

    #[test]
    fn test_debug_is_redacted() {
        let p = Passphrase::new("hunter2-but-longer").unwrap();
        let dbg = format!("{p:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("REDACTED"));
    }

    #[test]
    fn test_bytes_preserved() {
        let p = Passphrase::try_from("zażółć gęślą jaźń").unwrap();
        assert_eq!(p.as_bytes(), "zażółć gęślą jaźń".as_bytes());
    }
}
