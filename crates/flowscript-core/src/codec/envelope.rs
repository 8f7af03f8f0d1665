//! Sealed state envelope stored on the flow context between requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{RestoreError, SandboxResult};
use crate::sandbox::DIALECT;

use super::SerializedBinding;

/// SHA-256 hex digest of the canonical JSON encoding of `bindings`.
///
/// Bindings are keyed by `BTreeMap`, so the encoding is stable.
pub fn digest_of(bindings: &SerializedBinding) -> serde_json::Result<String> {
    let bytes = serde_json::to_vec(bindings)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Captured bindings plus what is needed to refuse a bad restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEnvelope {
    /// Scripting dialect the closures were compiled with.
    pub dialect: String,
    pub captured_at: DateTime<Utc>,
    pub digest: String,
    pub bindings: SerializedBinding,
}

impl StateEnvelope {
    pub fn seal(bindings: SerializedBinding) -> SandboxResult<Self> {
        Ok(Self {
            dialect: DIALECT.to_string(),
            captured_at: Utc::now(),
            digest: digest_of(&bindings)?,
            bindings,
        })
    }

    /// Verify dialect and digest, then hand back the bindings.
    pub fn open(self) -> Result<SerializedBinding, RestoreError> {
        if self.dialect != DIALECT {
            return Err(RestoreError::DialectMismatch {
                captured: self.dialect,
                running: DIALECT.to_string(),
            });
        }
        let actual = digest_of(&self.bindings).map_err(|e| RestoreError::Malformed(e.to_string()))?;
        if actual != self.digest {
            return Err(RestoreError::DigestMismatch {
                expected: self.digest,
                actual,
            });
        }
        Ok(self.bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::SerializedValue;
    use crate::value::Scalar;

    fn bindings() -> SerializedBinding {
        [(
            "x".to_string(),
            SerializedValue::Scalar {
                value: Scalar::Int(5),
            },
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_seal_then_open() {
        let envelope = StateEnvelope::seal(bindings()).unwrap();
        assert_eq!(envelope.dialect, DIALECT);
        assert_eq!(envelope.digest.len(), 64);

        let json = serde_json::to_string(&envelope).unwrap();
        let back: StateEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.open().unwrap(), bindings());
    }

    #[test]
    fn test_dialect_mismatch() {
        let mut envelope = StateEnvelope::seal(bindings()).unwrap();
        envelope.dialect = "rhai/0".into();
        assert!(matches!(
            envelope.open(),
            Err(RestoreError::DialectMismatch { .. })
        ));
    }

    #[test]
    fn test_tampered_bindings_fail_digest() {
        let mut envelope = StateEnvelope::seal(bindings()).unwrap();
        envelope.bindings.insert(
            "y",
            SerializedValue::Scalar {
                value: Scalar::Bool(true),
            },
        );
        assert!(matches!(
            envelope.open(),
            Err(RestoreError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_digest_is_stable() {
        assert_eq!(digest_of(&bindings()).unwrap(), digest_of(&bindings()).unwrap());
    }
}
