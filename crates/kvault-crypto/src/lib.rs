//! kvault-crypto: passphrase-based encryption at rest
//!
//! Two paths share one key-derivation engine:
//!
//! ```text
//! passphrase + random salt ──KDF (PBKDF2-HMAC-SHA256 | Argon2id)──► 256-bit key
//!   ├── SecretCipher: AES-256-GCM, random 96-bit nonce, detached 128-bit tag
//!   └── StreamCipher: AES-256-GCM over 64 KiB chunks
//!         nonce = prefix(7) || counter(u32 BE) || last_flag(1), AAD = blob header
//! ```
//!
//! Every persisted record and blob starts from a format version byte followed
//! by the encoded KDF parameters, so the parameters travel with the data.

pub mod error;
pub mod kdf;
pub mod passphrase;
pub mod random;
pub mod secret;
pub mod stream;

pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_key, derive_key_into, DerivedKey, KdfParams};
pub use passphrase::Passphrase;
pub use secret::{SealedSecret, SecretCipher};
pub use stream::{
    DecryptReader, StreamCipher, StreamDecryptor, StreamEncryptor, StreamHeader,
};

/// Current on-disk format version (AES-256-GCM + encoded KDF params)
pub const FORMAT_VERSION: u8 = 1;

/// Size of a derived AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of an AES-GCM authentication tag
pub const TAG_SIZE: usize = 16;
