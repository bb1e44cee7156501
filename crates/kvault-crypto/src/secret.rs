//! AES-256-GCM encryption of short secret values
//!
//! Each call draws a fresh 32-byte salt and 12-byte nonce, derives a key from
//! the passphrase, and produces ciphertext of the same length as the
//! plaintext plus a detached 16-byte tag.
//!
//! AAD = format_version (1 byte) || encoded KDF parameters

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce, Tag,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::kdf::{derive_key, KdfParams};
use crate::passphrase::Passphrase;
use crate::random::random_array;
use crate::{FORMAT_VERSION, NONCE_SIZE, TAG_SIZE};

/// Size of the per-secret KDF salt
pub const SECRET_SALT_SIZE: usize = 32;

/// Everything needed to decrypt a secret, given the passphrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub version: u8,
    pub kdf: KdfParams,
    pub salt: [u8; SECRET_SALT_SIZE],
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_SIZE],
}

impl SealedSecret {
    /// Rebuild a sealed secret from persisted opaque fields.
    pub fn from_parts(
        version: u8,
        kdf: &[u8],
        ciphertext: Vec<u8>,
        nonce: &[u8],
        salt: &[u8],
        tag: &[u8],
    ) -> Result<Self, CryptoError> {
        if version != FORMAT_VERSION {
            return Err(CryptoError::UnsupportedVersion(version));
        }
        let kdf = KdfParams::decode_exact(kdf)?;
        Ok(Self {
            version,
            kdf,
            salt: fixed(salt, "salt")?,
            nonce: fixed(nonce, "nonce")?,
            ciphertext,
            tag: fixed(tag, "tag")?,
        })
    }

    /// Encoded KDF parameters, as persisted
    pub fn kdf_bytes(&self) -> Vec<u8> {
        self.kdf.encode()
    }
}

fn fixed<const N: usize>(bytes: &[u8], field: &str) -> Result<[u8; N], CryptoError> {
    bytes.try_into().map_err(|_| {
        CryptoError::Malformed(format!(
            "{field} has {} bytes (expected {N})",
            bytes.len()
        ))
    })
}

fn build_aad(version: u8, kdf: &KdfParams) -> Vec<u8> {
    let mut aad = Vec::with_capacity(14);
    aad.push(version);
    aad.extend_from_slice(&kdf.encode());
    aad
}

/// Authenticated passphrase encryption for short values
#[derive(Debug, Clone)]
pub struct SecretCipher {
    params: KdfParams,
}

impl SecretCipher {
    pub fn new(params: KdfParams) -> Result<Self, CryptoError> {
        params.validate()?;
        Ok(Self { params })
    }

    pub fn params(&self) -> &KdfParams {
        &self.params
    }

    /// Encrypt `plaintext` under a key derived from `passphrase`.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        passphrase: &Passphrase,
    ) -> Result<SealedSecret, CryptoError> {
        let salt: [u8; SECRET_SALT_SIZE] = random_array();
        let nonce: [u8; NONCE_SIZE] = random_array();

        let key = derive_key(passphrase, &salt, &self.params)?;
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        drop(key);

        let aad = build_aad(FORMAT_VERSION, &self.params);
        let mut buffer = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut buffer)
            .map_err(|_| CryptoError::Encryption)?;

        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);

        Ok(SealedSecret {
            version: FORMAT_VERSION,
            kdf: self.params,
            salt,
            nonce,
            ciphertext: buffer,
            tag: tag_bytes,
        })
    }

    /// Decrypt a sealed secret.
    ///
    /// Uses the salt and KDF parameters stored with the secret, not the
    /// cipher's current defaults. Any tag mismatch yields
    /// `CryptoError::Authentication`.
    pub fn decrypt(
        sealed: &SealedSecret,
        passphrase: &Passphrase,
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if sealed.version != FORMAT_VERSION {
            return Err(CryptoError::UnsupportedVersion(sealed.version));
        }
        sealed.kdf.validate_stored()?;

        let key = derive_key(passphrase, &sealed.salt, &sealed.kdf)?;
        let cipher = Aes256Gcm::new(key.as_bytes().into());
        drop(key);

        let aad = build_aad(sealed.version, &sealed.kdf);
        let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&sealed.nonce),
                &aad,
                &mut buffer,
                Tag::from_slice(&sealed.tag),
            )
            .map_err(|_| CryptoError::Authentication)?;

        Ok(buffer)
    }
}
