//! Keyed storage for encrypted secret records
//!
//! Two backends:
//!   - [`MemorySecretStore`]: process-local map, for tests and ephemeral use.
//!   - [`JsonSecretStore`]: whole map in memory, flushed to a JSON file
//!     atomically (temp file + rename) after every mutation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kvault_core::{SecretRecord, VaultError, VaultResult};
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, key: &str) -> VaultResult<Option<SecretRecord>>;

    /// Insert a new record. Fails with `VaultError::Storage` if the key exists.
    async fn add(&self, record: SecretRecord) -> VaultResult<()>;

    /// Replace an existing record. Fails with `VaultError::NotFound` if absent.
    async fn update(&self, record: SecretRecord) -> VaultResult<()>;

    /// Remove a record. Returns whether anything was removed.
    async fn delete(&self, key: &str) -> VaultResult<bool>;

    async fn exists(&self, key: &str) -> VaultResult<bool>;
}

fn insert_new(map: &mut HashMap<String, SecretRecord>, record: SecretRecord) -> VaultResult<()> {
    if map.contains_key(&record.key) {
        return Err(VaultError::Storage(format!(
            "secret already exists: {}",
            record.key
        )));
    }
    map.insert(record.key.clone(), record);
    Ok(())
}

fn replace_existing(
    map: &mut HashMap<String, SecretRecord>,
    record: SecretRecord,
) -> VaultResult<SecretRecord> {
    match map.get_mut(&record.key) {
        Some(slot) => Ok(std::mem::replace(slot, record)),
        None => Err(VaultError::NotFound(format!("secret: {}", record.key))),
    }
}

#[derive(Debug, Default)]
pub struct MemorySecretStore {
    records: RwLock<HashMap<String, SecretRecord>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, key: &str) -> VaultResult<Option<SecretRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn add(&self, record: SecretRecord) -> VaultResult<()> {
        insert_new(&mut *self.records.write().await, record)
    }

    async fn update(&self, record: SecretRecord) -> VaultResult<()> {
        replace_existing(&mut *self.records.write().await, record).map(|_| ())
    }

    async fn delete(&self, key: &str) -> VaultResult<bool> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> VaultResult<bool> {
        Ok(self.records.read().await.contains_key(key))
    }
}

/// JSON-file-backed secret store.
///
/// Writers hold the lock across the flush, so the file on disk always matches
/// the in-memory map. A failed flush rolls the mutation back.
#[derive(Debug)]
pub struct JsonSecretStore {
    path: PathBuf,
    records: RwLock<HashMap<String, SecretRecord>>,
}

impl JsonSecretStore {
    /// Open or create the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> VaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                VaultError::Storage(format!("parsing secret store {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!(path = %path.display(), count = records.len(), "opened secret store");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn flush(&self, records: &HashMap<String, SecretRecord>) -> VaultResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| VaultError::Storage(format!("serializing secret store: {e}")))?;

        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &json).await?;
        restrict_permissions(&tmp_path).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> VaultResult<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> VaultResult<()> {
    Ok(())
}

#[async_trait]
impl SecretStore for JsonSecretStore {
    async fn get(&self, key: &str) -> VaultResult<Option<SecretRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn add(&self, record: SecretRecord) -> VaultResult<()> {
        let mut records = self.records.write().await;
        let key = record.key.clone();
        insert_new(&mut records, record)?;
        if let Err(e) = self.flush(&records).await {
            records.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    async fn update(&self, record: SecretRecord) -> VaultResult<()> {
        let mut records = self.records.write().await;
        let previous = replace_existing(&mut records, record)?;
        if let Err(e) = self.flush(&records).await {
            records.insert(previous.key.clone(), previous);
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> VaultResult<bool> {
        let mut records = self.records.write().await;
        let Some(previous) = records.remove(key) else {
            return Ok(false);
        };
        if let Err(e) = self.flush(&records).await {
            records.insert(previous.key.clone(), previous);
            return Err(e);
        }
        Ok(true)
    }

    async fn exists(&self, key: &str) -> VaultResult<bool> {
        Ok(self.records.read().await.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, fill: u8) -> SecretRecord {
        SecretRecord {
            key: key.into(),
            version: 1,
            kdf: vec![1, 0, 0, 3, 232],
            ciphertext: vec![fill; 8],
            nonce: vec![fill; 12],
            salt: vec![fill; 32],
            tag: vec![fill; 16],
            created_at: 100,
            updated_at: 100,
        }
    }

    async fn exercise(store: &dyn SecretStore) {
        assert!(store.get("k").await.unwrap().is_none());
        assert!(!store.exists("k").await.unwrap());

        store.add(record("k", 1)).await.unwrap();
        assert!(store.exists("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap().unwrap(), record("k", 1));

        let dup = store.add(record("k", 2)).await;
        assert!(matches!(dup, Err(VaultError::Storage(_))));

        store.update(record("k", 3)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().ciphertext, vec![3; 8]);

        let missing = store.update(record("other", 1)).await;
        assert!(matches!(missing, Err(VaultError::NotFound(_))));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_contract() {
        let store = MemorySecretStore::new();
        exercise(&store).await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_json_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonSecretStore::open(dir.path().join("secrets.json"))
            .await
            .unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_json_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("secrets.json");

        {
            let store = JsonSecretStore::open(&path).await.unwrap();
            store.add(record("a", 1)).await.unwrap();
            store.add(record("b", 2)).await.unwrap();
            store.delete("a").await.unwrap();
        }

        let reopened = JsonSecretStore::open(&path).await.unwrap();
        assert_eq!(reopened.len().await, 1);
        assert!(!reopened.exists("a").await.unwrap());
        assert_eq!(reopened.get("b").await.unwrap().unwrap(), record("b", 2));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_holds_no_plaintext_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let store = JsonSecretStore::open(&path).await.unwrap();
        store.add(record("api-token", 0xAB)).await.unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["api-token"]["ciphertext"].is_string());
        assert_eq!(value["api-token"]["version"], 1);
    }

    #[tokio::test]
    async fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "{ not json").unwrap();
        let result = JsonSecretStore::open(&path).await;
        assert!(matches!(result, Err(VaultError::Storage(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_json_store_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets.json");
        let store = JsonSecretStore::open(&path).await.unwrap();
        store.add(record("k", 1)).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
