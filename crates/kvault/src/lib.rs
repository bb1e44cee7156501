//! kvault: passphrase-protected secrets and files
//!
//! [`SecretVault`] encrypts short values into [`kvault_core::SecretRecord`]s;
//! [`FileVault`] streams files through chunked AES-256-GCM into a blob store.
//! Neither keeps the passphrase: it is moved into the call that needs it and
//! dropped on the worker thread that derives the key.

pub mod files;
pub mod secrets;

use kvault_core::config::{CryptoConfig, KdfAlgorithm};
use kvault_core::{VaultError, VaultResult};
use kvault_crypto::{CryptoError, KdfParams};

pub use files::{FileVault, PlaintextStream};
pub use kvault_crypto::Passphrase;
pub use secrets::SecretVault;

/// Wrap a caller-supplied passphrase, rejecting empty input.
pub fn passphrase(value: impl Into<String>) -> VaultResult<Passphrase> {
    Passphrase::new(value).map_err(map_crypto_error)
}

/// KDF parameters for new writes, from the `[crypto]` config section
pub fn kdf_params_from_config(config: &CryptoConfig) -> KdfParams {
    match config.kdf {
        KdfAlgorithm::Pbkdf2Sha256 => KdfParams::Pbkdf2Sha256 {
            iterations: config.pbkdf2_iterations,
        },
        KdfAlgorithm::Argon2id => KdfParams::Argon2id {
            mem_cost_kib: config.argon2_mem_cost_kib,
            time_cost: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
        },
    }
}

/// Collapse crypto errors into the vault taxonomy.
///
/// Every "does not open" outcome becomes `VaultError::Authentication`, with
/// no detail about the cause.
pub(crate) fn map_crypto_error(err: CryptoError) -> VaultError {
    if err.is_integrity_failure() {
        return VaultError::Authentication;
    }
    match err {
        CryptoError::EmptyPassphrase => VaultError::Validation("passphrase is required".into()),
        CryptoError::InvalidParams(msg) => VaultError::Config(msg),
        CryptoError::Io(e) => VaultError::Io(e),
        other => VaultError::Other(anyhow::anyhow!(other)),
    }
}

/// Run CPU-bound crypto off the async reactor.
pub(crate) async fn run_blocking<T, F>(f: F) -> VaultResult<T>
where
    F: FnOnce() -> VaultResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VaultError::Other(anyhow::anyhow!("crypto worker failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrity_failures_collapse() {
        for err in [
            CryptoError::Authentication,
            CryptoError::Malformed("short".into()),
            CryptoError::UnsupportedVersion(9),
        ] {
            let mapped = map_crypto_error(err);
            assert!(mapped.is_authentication());
            assert_eq!(mapped.to_string(), kvault_core::error::AUTHENTICATION_FAILED);
        }
    }

    #[test]
    fn test_other_mappings() {
        assert!(matches!(
            map_crypto_error(CryptoError::EmptyPassphrase),
            VaultError::Validation(_)
        ));
        assert!(matches!(
            map_crypto_error(CryptoError::InvalidParams("x".into())),
            VaultError::Config(_)
        ));
        assert!(matches!(
            map_crypto_error(CryptoError::Encryption),
            VaultError::Other(_)
        ));
    }

    #[test]
    fn test_empty_passphrase_is_validation_error() {
        assert!(matches!(passphrase(""), Err(VaultError::Validation(_))));
        assert!(passphrase("x").is_ok());
    }

    #[test]
    fn test_kdf_params_from_config() {
        let mut config = CryptoConfig::default();
        assert_eq!(
            kdf_params_from_config(&config),
            KdfParams::Pbkdf2Sha256 {
                iterations: 100_000
            }
        );

        config.kdf = KdfAlgorithm::Argon2id;
        assert_eq!(kdf_params_from_config(&config), KdfParams::argon2id_default());
    }

    #[tokio::test]
    async fn test_run_blocking_propagates() {
        let ok = run_blocking(|| Ok::<_, VaultError>(7)).await.unwrap();
        assert_eq!(ok, 7);
        let err = run_blocking(|| Err::<(), _>(VaultError::Authentication)).await;
        assert!(matches!(err, Err(VaultError::Authentication)));
    }
}
