//! Key derivation: passphrase + salt → symmetric key
//!
//! Persisted parameter encoding (big-endian):
//! ```text
//! 0x01 || iterations(u32)                              PBKDF2-HMAC-SHA256
//! 0x02 || mem_cost_kib(u32) || time_cost(u32) || parallelism(u32)   Argon2id v1.3
//! ```

use argon2::{Algorithm, Argon2, Params, Version};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CryptoError;
use crate::passphrase::Passphrase;
use crate::KEY_SIZE;

const KDF_ID_PBKDF2_SHA256: u8 = 0x01;
const KDF_ID_ARGON2ID: u8 = 0x02;

// Refused on write and on read; stored parameters are unauthenticated until
// the tag verifies.
pub const MAX_PBKDF2_ITERATIONS: u32 = 2_000_000;
pub const MAX_ARGON2_MEM_COST_KIB: u32 = 1024 * 1024;
pub const MAX_ARGON2_TIME_COST: u32 = 16;
pub const MAX_ARGON2_PARALLELISM: u32 = 16;

/// A 256-bit key derived from a passphrase.
///
/// Not `Clone`; zeroized on drop so every exit path wipes it.
pub struct DerivedKey {
    bytes: [u8; KEY_SIZE],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Key-derivation algorithm and cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfParams {
    /// PBKDF2 with HMAC-SHA256
    Pbkdf2Sha256 { iterations: u32 },
    /// Argon2id v1.3
    Argon2id {
        /// Memory cost in KiB
        mem_cost_kib: u32,
        /// Time cost (passes)
        time_cost: u32,
        parallelism: u32,
    },
}

impl Default for KdfParams {
    fn default() -> Self {
        KdfParams::Pbkdf2Sha256 {
            iterations: 100_000,
        }
    }
}

impl KdfParams {
    /// Argon2id with the default costs (64 MiB, 3 passes, 4 lanes)
    pub fn argon2id_default() -> Self {
        KdfParams::Argon2id {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        match *self {
            KdfParams::Pbkdf2Sha256 { iterations } => {
                if iterations == 0 || iterations > MAX_PBKDF2_ITERATIONS {
                    return Err(CryptoError::InvalidParams(format!(
                        "PBKDF2 iterations must be in 1..={MAX_PBKDF2_ITERATIONS}, got {iterations}"
                    )));
                }
            }
            KdfParams::Argon2id {
                mem_cost_kib,
                time_cost,
                parallelism,
            } => {
                if mem_cost_kib > MAX_ARGON2_MEM_COST_KIB
                    || time_cost == 0
                    || time_cost > MAX_ARGON2_TIME_COST
                    || parallelism == 0
                    || parallelism > MAX_ARGON2_PARALLELISM
                {
                    return Err(CryptoError::InvalidParams(format!(
                        "Argon2id costs out of range: m={mem_cost_kib} t={time_cost} p={parallelism}"
                    )));
                }
                argon2_params(mem_cost_kib, time_cost, parallelism, KEY_SIZE)?;
            }
        }
        Ok(())
    }

    /// `validate` for parameters read back from storage: anything out of
    /// range is malformed data.
    pub fn validate_stored(&self) -> Result<(), CryptoError> {
        self.validate()
            .map_err(|e| CryptoError::Malformed(e.to_string()))
    }

    /// Persisted byte form
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            KdfParams::Pbkdf2Sha256 { iterations } => {
                let mut out = Vec::with_capacity(5);
                out.push(KDF_ID_PBKDF2_SHA256);
                out.extend_from_slice(&iterations.to_be_bytes());
                out
            }
            KdfParams::Argon2id {
                mem_cost_kib,
                time_cost,
                parallelism,
            } => {
                let mut out = Vec::with_capacity(13);
                out.push(KDF_ID_ARGON2ID);
                out.extend_from_slice(&mem_cost_kib.to_be_bytes());
                out.extend_from_slice(&time_cost.to_be_bytes());
                out.extend_from_slice(&parallelism.to_be_bytes());
                out
            }
        }
    }

    /// Length of the encoded form that starts with `kdf_id`
    pub fn encoded_len(kdf_id: u8) -> Result<usize, CryptoError> {
        match kdf_id {
            KDF_ID_PBKDF2_SHA256 => Ok(5),
            KDF_ID_ARGON2ID => Ok(13),
            other => Err(CryptoError::Malformed(format!("unknown KDF id {other:#04x}"))),
        }
    }

    /// Decode parameters from the front of `bytes`.
    ///
    /// Returns the parameters and the number of bytes consumed. Out-of-range
    /// values, including costs above the `MAX_*` ceilings, are reported as
    /// malformed data before any key is derived.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), CryptoError> {
        let id = *bytes
            .first()
            .ok_or_else(|| CryptoError::Malformed("missing KDF parameters".into()))?;
        let len = Self::encoded_len(id)?;
        if bytes.len() < len {
            return Err(CryptoError::Malformed(format!(
                "KDF parameters truncated: {} bytes (expected {len})",
                bytes.len()
            )));
        }

        let word = |i: usize| {
            let start = 1 + 4 * i;
            u32::from_be_bytes([
                bytes[start],
                bytes[start + 1],
                bytes[start + 2],
                bytes[start + 3],
            ])
        };

        let params = match id {
            KDF_ID_PBKDF2_SHA256 => KdfParams::Pbkdf2Sha256 { iterations: word(0) },
            _ => KdfParams::Argon2id {
                mem_cost_kib: word(0),
                time_cost: word(1),
                parallelism: word(2),
            },
        };

        params.validate_stored()?;
        Ok((params, len))
    }

    /// Decode parameters that must span the whole of `bytes`
    pub fn decode_exact(bytes: &[u8]) -> Result<Self, CryptoError> {
        let (params, used) = Self::decode(bytes)?;
        if used != bytes.len() {
            return Err(CryptoError::Malformed(format!(
                "{} trailing bytes after KDF parameters",
                bytes.len() - used
            )));
        }
        Ok(params)
    }
}

fn argon2_params(
    mem_cost_kib: u32,
    time_cost: u32,
    parallelism: u32,
    output_len: usize,
) -> Result<Params, CryptoError> {
    Params::new(mem_cost_kib, time_cost, parallelism, Some(output_len))
        .map_err(|e| CryptoError::InvalidParams(format!("invalid Argon2id params: {e}")))
}

/// Derive `out.len()` key bytes from a passphrase and salt.
///
/// Deterministic for identical inputs. This is the slow part of every
/// encrypt/decrypt call; async callers must run it off the reactor.
pub fn derive_key_into(
    passphrase: &Passphrase,
    salt: &[u8],
    params: &KdfParams,
    out: &mut [u8],
) -> Result<(), CryptoError> {
    params.validate()?;
    tracing::trace!(params = ?params, out_len = out.len(), "deriving key");

    match *params {
        KdfParams::Pbkdf2Sha256 { iterations } => {
            pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, iterations, out);
        }
        KdfParams::Argon2id {
            mem_cost_kib,
            time_cost,
            parallelism,
        } => {
            let argon2 = Argon2::new(
                Algorithm::Argon2id,
                Version::V0x13,
                argon2_params(mem_cost_kib, time_cost, parallelism, out.len())?,
            );
            if let Err(e) = argon2.hash_password_into(passphrase.as_bytes(), salt, out) {
                out.zeroize();
                return Err(CryptoError::Kdf(format!("Argon2id KDF failed: {e}")));
            }
        }
    }

    Ok(())
}

/// Derive a 256-bit key from a passphrase and salt.
pub fn derive_key(
    passphrase: &Passphrase,
    salt: &[u8],
    params: &KdfParams,
) -> Result<DerivedKey, CryptoError> {
    let mut key = DerivedKey {
        bytes: [0u8; KEY_SIZE],
    };
    derive_key_into(passphrase, salt, params, &mut key.bytes)?;
    Ok(key)
}
