//! Storage health check

use std::path::Path;

use kvault_core::{VaultError, VaultResult};

/// Verify the blob directory exists and is writable by creating and removing
/// a probe file.
pub async fn check_blob_dir(dir: &Path) -> VaultResult<()> {
    let meta = tokio::fs::metadata(dir).await.map_err(|e| {
        VaultError::Storage(format!("blob directory {} unavailable: {e}", dir.display()))
    })?;
    if !meta.is_dir() {
        return Err(VaultError::Storage(format!(
            "blob path is not a directory: {}",
            dir.display()
        )));
    }

    let probe = dir.join(format!(".kvault-health-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&probe, b"ok").await.map_err(|e| {
        VaultError::Storage(format!("blob directory {} not writable: {e}", dir.display()))
    })?;
    tokio::fs::remove_file(&probe).await?;
    Ok(())
}

/// Returns true if the blob directory is usable, false otherwise
pub async fn is_healthy(dir: &Path) -> bool {
    check_blob_dir(dir).await.is_ok()
}
