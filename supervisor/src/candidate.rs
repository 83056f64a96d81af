//! Candidate payloads offered to the supervisor.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::UpgradeError;

/// Provenance tags longer than this are cut; they are meant to be short labels.
const MAX_PROVENANCE_CHARS: usize = 120;

/// A proposed replacement for the live payload.
///
/// Immutable once created. Construction is the only place where input is
/// checked, so every value that reaches the supervisor is non-empty text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeCandidate {
    payload: String,
    provenance: String,
    received_at: DateTime<Utc>,
}

impl CodeCandidate {
    /// Build a candidate from text.
    ///
    /// Rejects empty or whitespace-only payloads and payloads containing NUL
    /// bytes with [`UpgradeError::MalformedCandidate`].
    pub fn new(
        payload: impl Into<String>,
        provenance: impl Into<String>,
    ) -> Result<Self, UpgradeError> {
        let payload = payload.into();
        let provenance = normalize_provenance(&provenance.into());
        if payload.trim().is_empty() {
            return Err(malformed(provenance, "payload is empty"));
        }
        if payload.contains('\0') {
            return Err(malformed(provenance, "payload contains NUL bytes (not text)"));
        }
        Ok(Self {
            payload,
            provenance,
            received_at: Utc::now(),
        })
    }

    /// Build a candidate from raw bytes, rejecting anything that is not UTF-8.
    pub fn from_bytes(bytes: Vec<u8>, provenance: impl Into<String>) -> Result<Self, UpgradeError> {
        let provenance = provenance.into();
        match String::from_utf8(bytes) {
            Ok(text) => Self::new(text, provenance),
            Err(err) => Err(malformed(
                normalize_provenance(&provenance),
                &format!("payload is not valid UTF-8 ({})", err.utf8_error()),
            )),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn provenance(&self) -> &str {
        &self.provenance
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    /// Hex SHA-256 of the payload.
    pub fn digest(&self) -> String {
        payload_digest(self.payload.as_bytes())
    }
}

/// Hex SHA-256 of arbitrary payload bytes.
pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn normalize_provenance(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unspecified".to_string();
    }
    trimmed.chars().take(MAX_PROVENANCE_CHARS).collect()
}

fn malformed(provenance: String, reason: &str) -> UpgradeError {
    UpgradeError::MalformedCandidate {
        provenance,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_text_payload() {
        let candidate = CodeCandidate::new("print('hi')\n", "manual paste").expect("candidate");
        assert_eq!(candidate.payload(), "print('hi')\n");
        assert_eq!(candidate.provenance(), "manual paste");
    }

    #[test]
    fn rejects_whitespace_only_payload() {
        let err = CodeCandidate::new(" \n\t\n", "paste").unwrap_err();
        assert!(matches!(err, UpgradeError::MalformedCandidate { .. }));
        assert!(err.to_string().contains("payload is empty"));
    }

    #[test]
    fn rejects_nul_bytes() {
        let err = CodeCandidate::new("abc\0def", "hub:agent.py").unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn rejects_invalid_utf8() {
        let err = CodeCandidate::from_bytes(vec![0xff, 0xfe, 0x41], "hub:blob.py").unwrap_err();
        assert!(err.to_string().contains("not valid UTF-8"));
        assert!(err.to_string().contains("hub:blob.py"));
    }

    #[test]
    fn blank_provenance_gets_placeholder() {
        let candidate = CodeCandidate::new("x = 1", "   ").expect("candidate");
        assert_eq!(candidate.provenance(), "unspecified");
    }

    #[test]
    fn long_provenance_is_cut() {
        let candidate = CodeCandidate::new("x = 1", "r".repeat(500)).expect("candidate");
        assert_eq!(candidate.provenance().chars().count(), MAX_PROVENANCE_CHARS);
    }

    #[test]
    fn digest_depends_only_on_payload() {
        let a = CodeCandidate::new("x = 1", "a").expect("a");
        let b = CodeCandidate::new("x = 1", "b").expect("b");
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest(), payload_digest(b"x = 1"));
        assert_eq!(a.digest().len(), 64);
    }
}
