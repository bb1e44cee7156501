use serde::{Deserialize, Serialize};

/// A persisted, encrypted vault secret.
///
/// All byte fields are opaque to the store. `version` and `kdf` identify the
/// cipher suite and key-derivation parameters that produced the ciphertext,
/// so older records stay readable when defaults change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Caller-owned identifier, unique within the store
    pub key: String,
    /// Format version byte
    pub version: u8,
    /// Encoded key-derivation parameters
    #[serde(with = "base64_bytes")]
    pub kdf: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub tag: Vec<u8>,
    /// Unix timestamp (seconds) of the first write
    pub created_at: u64,
    /// Unix timestamp (seconds) of the latest write
    pub updated_at: u64,
}

/// Whether a write created a new item or replaced an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOutcome {
    Created,
    Updated,
}

/// Current Unix time in seconds.
pub fn now_epoch() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SecretRecord {
        SecretRecord {
            key: "db-password".into(),
            version: 1,
            kdf: vec![1, 0, 1, 134, 160],
            ciphertext: vec![0xde, 0xad, 0xbe, 0xef],
            nonce: vec![7u8; 12],
            salt: vec![9u8; 32],
            tag: vec![3u8; 16],
            created_at: 1_700_000_000,
            updated_at: 1_700_000_100,
        }
    }

    #[test]
    fn test_record_bytes_are_base64_in_json() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"ciphertext\":\"3q2+7w==\""));
        assert!(!json.contains("[222"), "byte fields must not serialize as arrays");
    }

    #[test]
    fn test_record_json_roundtrip() {
        let record = sample();
        let json = serde_json::to_vec(&record).unwrap();
        let parsed: SecretRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_record_rejects_invalid_base64() {
        let json = r#"{"key":"k","version":1,"kdf":"!!","ciphertext":"","nonce":"","salt":"","tag":"","created_at":0,"updated_at":0}"#;
        assert!(serde_json::from_str::<SecretRecord>(json).is_err());
    }
}
