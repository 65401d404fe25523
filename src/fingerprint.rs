//! Content fingerprints used as cache keys and job deduplication keys.

use std::fmt;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::ocr::BackendKind;

/// SHA-256 digest of an input.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Digest of the raw input bytes.
    pub fn of_content(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Key for a recognition of this content with a given backend and language.
    ///
    /// Distinct profiles over the same bytes never collide, identical
    /// profiles always agree.
    pub fn with_profile(&self, backend: BackendKind, language: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(self.0);
        hasher.update([0u8]);
        hasher.update(backend.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(language.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
