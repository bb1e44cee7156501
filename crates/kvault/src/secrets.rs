//! Secret vault: encrypt-on-write, decrypt-on-read for short values

use kvault_core::types::now_epoch;
use kvault_core::{SecretRecord, VaultError, VaultResult, WriteOutcome};
use kvault_crypto::{KdfParams, Passphrase, SealedSecret, SecretCipher};
use kvault_storage::SecretStore;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::{map_crypto_error, run_blocking};

pub struct SecretVault<S> {
    store: S,
    cipher: SecretCipher,
}

impl<S: SecretStore> SecretVault<S> {
    /// `params` apply to new writes; existing records keep their own.
    pub fn new(store: S, params: KdfParams) -> VaultResult<Self> {
        let cipher = SecretCipher::new(params).map_err(map_crypto_error)?;
        Ok(Self { store, cipher })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Encrypt `value` and store it under `key`, creating or replacing it.
    ///
    /// An update re-encrypts with a fresh salt and nonce; only `created_at`
    /// survives from the previous record.
    pub async fn set(
        &self,
        key: &str,
        value: SecretString,
        passphrase: Passphrase,
    ) -> VaultResult<WriteOutcome> {
        validate_key(key)?;
        if value.expose_secret().is_empty() {
            return Err(VaultError::Validation("secret value must not be empty".into()));
        }

        let existing = self.store.get(key).await?;

        let cipher = self.cipher.clone();
        let plaintext = Zeroizing::new(value.expose_secret().as_bytes().to_vec());
        drop(value);
        let sealed = run_blocking(move || {
            cipher
                .encrypt(&plaintext, &passphrase)
                .map_err(map_crypto_error)
        })
        .await?;

        let now = now_epoch();
        let record = SecretRecord {
            key: key.to_string(),
            version: sealed.version,
            kdf: sealed.kdf_bytes(),
            ciphertext: sealed.ciphertext,
            nonce: sealed.nonce.to_vec(),
            salt: sealed.salt.to_vec(),
            tag: sealed.tag.to_vec(),
            created_at: existing.as_ref().map_or(now, |r| r.created_at),
            updated_at: now,
        };

        let outcome = match existing {
            Some(_) => self.replace_or_add(record).await?,
            None => self.add_or_replace(record).await?,
        };

        info!(key = %key, outcome = ?outcome, "stored secret");
        Ok(outcome)
    }

    /// Replace, or insert if a concurrent writer deleted the key first.
    async fn replace_or_add(&self, record: SecretRecord) -> VaultResult<WriteOutcome> {
        let key = record.key.clone();
        let retry = record.clone();
        match self.store.update(record).await {
            Ok(()) => Ok(WriteOutcome::Updated),
            Err(VaultError::NotFound(_)) => {
                debug!(key = %key, "secret deleted concurrently, re-creating");
                self.add_or_replace(retry).await
            }
            Err(e) => Err(e),
        }
    }

    /// Insert, or replace if a concurrent writer created the key first.
    /// Concurrent writers are last-write-wins.
    async fn add_or_replace(&self, record: SecretRecord) -> VaultResult<WriteOutcome> {
        let key = record.key.clone();
        let retry = record.clone();
        match self.store.add(record).await {
            Ok(()) => Ok(WriteOutcome::Created),
            Err(VaultError::Storage(msg)) => {
                if !self.store.exists(&key).await? {
                    return Err(VaultError::Storage(msg));
                }
                debug!(key = %key, "secret created concurrently, replacing");
                self.store.update(retry).await?;
                Ok(WriteOutcome::Updated)
            }
            Err(e) => Err(e),
        }
    }

    /// Decrypt the secret stored under `key`.
    ///
    /// Unknown keys are `NotFound`; every other failure to open, whether a
    /// wrong passphrase or modified data, is `Authentication`.
    pub async fn get(&self, key: &str, passphrase: Passphrase) -> VaultResult<SecretString> {
        validate_key(key)?;
        let record = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("secret: {key}")))?;

        let sealed = SealedSecret::from_parts(
            record.version,
            &record.kdf,
            record.ciphertext,
            &record.nonce,
            &record.salt,
            &record.tag,
        )
        .map_err(map_crypto_error)?;

        let plaintext = run_blocking(move || {
            SecretCipher::decrypt(&sealed, &passphrase).map_err(map_crypto_error)
        })
        .await
        .inspect_err(|e| {
            if e.is_authentication() {
                warn!(key = %key, "secret failed authentication");
            }
        })?;

        let text = std::str::from_utf8(&plaintext)
            .map_err(|_| VaultError::Storage(format!("secret {key} is not valid UTF-8")))?;
        debug!(key = %key, "decrypted secret");
        Ok(SecretString::from(text.to_owned()))
    }

    /// Remove the secret stored under `key`. Returns whether it existed.
    pub async fn delete(&self, key: &str) -> VaultResult<bool> {
        validate_key(key)?;
        let removed = self.store.delete(key).await?;
        info!(key = %key, removed, "deleted secret");
        Ok(removed)
    }

    pub async fn exists(&self, key: &str) -> VaultResult<bool> {
        validate_key(key)?;
        self.store.exists(key).await
    }
}

fn validate_key(key: &str) -> VaultResult<()> {
    if key.trim().is_empty() {
        return Err(VaultError::Validation("secret key must not be empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvault_storage::MemorySecretStore;

    fn vault() -> SecretVault<MemorySecretStore> {
        SecretVault::new(
            MemorySecretStore::new(),
            KdfParams::Pbkdf2Sha256 { iterations: 1_000 },
        )
        .unwrap()
    }

    fn pass(s: &str) -> Passphrase {
        Passphrase::new(s).unwrap()
    }

    fn value(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[tokio::test]
    async fn test_set_get() {
        let v = vault();
        let outcome = v.set("k", value("v"), pass("pw")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Created);
        assert_eq!(v.get("k", pass("pw")).await.unwrap().expose_secret(), "v");
    }

    #[tokio::test]
    async fn test_record_holds_only_ciphertext() {
        let v = vault();
        v.set("k", value("plain-marker-value"), pass("pw")).await.unwrap();
        let record = v.store().get("k").await.unwrap().unwrap();
        assert_eq!(record.ciphertext.len(), "plain-marker-value".len());
        assert_ne!(record.ciphertext, b"plain-marker-value");
        assert_eq!(record.salt.len(), 32);
        assert_eq!(record.nonce.len(), 12);
        assert_eq!(record.tag.len(), 16);
        assert_eq!(record.version, kvault_crypto::FORMAT_VERSION);
    }

    #[tokio::test]
    async fn test_update_replaces_crypto_fields() {
        let v = vault();
        v.set("k", value("first"), pass("pw")).await.unwrap();
        let before = v.store().get("k").await.unwrap().unwrap();

        let outcome = v.set("k", value("second"), pass("pw2")).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Updated);

        let after = v.store().get("k").await.unwrap().unwrap();
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at >= before.updated_at);
        assert_ne!(after.salt, before.salt);
        assert_ne!(after.nonce, before.nonce);

        assert_eq!(v.get("k", pass("pw2")).await.unwrap().expose_secret(), "second");
        assert!(matches!(
            v.get("k", pass("pw")).await,
            Err(VaultError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_validation() {
        let v = vault();
        assert!(matches!(
            v.set("", value("v"), pass("pw")).await,
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            v.set("k", value(""), pass("pw")).await,
            Err(VaultError::Validation(_))
        ));
        assert!(matches!(
            v.get("  ", pass("pw")).await,
            Err(VaultError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_record_is_authentication_error() {
        let v = vault();
        v.set("k", value("value"), pass("pw")).await.unwrap();
        let mut record = v.store().get("k").await.unwrap().unwrap();
        record.ciphertext[0] ^= 1;
        v.store().update(record.clone()).await.unwrap();
        assert!(matches!(
            v.get("k", pass("pw")).await,
            Err(VaultError::Authentication)
        ));

        record.tag.truncate(8);
        v.store().update(record).await.unwrap();
        assert!(matches!(
            v.get("k", pass("pw")).await,
            Err(VaultError::Authentication)
        ));
    }

    #[tokio::test]
    async fn test_delete_and_exists() {
        let v = vault();
        v.set("k", value("v"), pass("pw")).await.unwrap();
        assert!(v.exists("k").await.unwrap());
        assert!(v.delete("k").await.unwrap());
        assert!(!v.exists("k").await.unwrap());
        assert!(!v.delete("k").await.unwrap());
        assert!(v.get("k", pass("pw")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_records_keep_their_kdf_params() {
        let store = MemorySecretStore::new();
        let old = SecretVault::new(store, KdfParams::Pbkdf2Sha256 { iterations: 1_000 }).unwrap();
        old.set("k", value("v"), pass("pw")).await.unwrap();

        let newer = SecretVault::new(old.store, KdfParams::Pbkdf2Sha256 { iterations: 2_000 })
            .unwrap();
        assert_eq!(newer.get("k", pass("pw")).await.unwrap().expose_secret(), "v");
    }

    mod races {
        use super::*;
        use std::sync::atomic::{AtomicBool, Ordering};

        /// Store where another writer deletes or creates the key just before
        /// the vault's own write lands.
        #[derive(Default)]
        struct RacingStore {
            inner: MemorySecretStore,
            delete_before_update: AtomicBool,
            create_before_add: AtomicBool,
        }

        #[async_trait::async_trait]
        impl SecretStore for RacingStore {
            async fn get(&self, key: &str) -> VaultResult<Option<SecretRecord>> {
                self.inner.get(key).await
            }

            async fn add(&self, record: SecretRecord) -> VaultResult<()> {
                if self.create_before_add.swap(false, Ordering::SeqCst) {
                    let mut other = record.clone();
                    other.ciphertext = vec![0; 3];
                    self.inner.add(other).await?;
                }
                self.inner.add(record).await
            }

            async fn update(&self, record: SecretRecord) -> VaultResult<()> {
                if self.delete_before_update.swap(false, Ordering::SeqCst) {
                    self.inner.delete(&record.key).await?;
                }
                self.inner.update(record).await
            }

            async fn delete(&self, key: &str) -> VaultResult<bool> {
                self.inner.delete(key).await
            }

            async fn exists(&self, key: &str) -> VaultResult<bool> {
                self.inner.exists(key).await
            }
        }

        fn racing_vault() -> SecretVault<RacingStore> {
            SecretVault::new(
                RacingStore::default(),
                KdfParams::Pbkdf2Sha256 { iterations: 1_000 },
            )
            .unwrap()
        }

        #[tokio::test]
        async fn test_set_recreates_key_deleted_concurrently() {
            let v = racing_vault();
            v.set("k", value("first"), pass("pw")).await.unwrap();

            v.store().delete_before_update.store(true, Ordering::SeqCst);
            let outcome = v.set("k", value("second"), pass("pw")).await.unwrap();
            assert_eq!(outcome, WriteOutcome::Created);
            assert_eq!(v.get("k", pass("pw")).await.unwrap().expose_secret(), "second");
        }

        #[tokio::test]
        async fn test_set_replaces_key_created_concurrently() {
            let v = racing_vault();
            v.store().create_before_add.store(true, Ordering::SeqCst);

            let outcome = v.set("k", value("mine"), pass("pw")).await.unwrap();
            assert_eq!(outcome, WriteOutcome::Updated);
            assert_eq!(v.get("k", pass("pw")).await.unwrap().expose_secret(), "mine");
        }
    }
}
