//! kvault-storage: persistence for encrypted secrets and file blobs
//!
//! Stores only ever see opaque ciphertext. Two traits define the seams:
//! [`SecretStore`] for keyed secret records and [`FileBlobStore`] for
//! encrypted byte streams addressed by generated names.

pub mod blob_store;
pub mod health;
pub mod secret_store;

pub use blob_store::{validate_blob_name, BlobReader, FileBlobStore, FsBlobStore, MemoryBlobStore};
pub use health::{check_blob_dir, is_healthy};
pub use secret_store::{JsonSecretStore, MemorySecretStore, SecretStore};
