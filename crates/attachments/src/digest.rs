//! Content digests over original (uncompressed) payloads

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha224, Sha256, Sha384, Sha512};

use crate::error::{AttachmentError, Result};

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 4] = [
        DigestAlgorithm::Sha224,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ];

    /// Canonical lowercase name, as stored in the database
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha224 => "sha224",
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
        }
    }

    /// Resolve an optional algorithm name.
    ///
    /// `None` selects `default`; an empty or unknown name is a validation error.
    pub fn select(name: Option<&str>, default: DigestAlgorithm) -> Result<Self> {
        match name {
            None => Ok(default),
            Some(name) => name.parse(),
        }
    }

    /// Hash the whole payload in one pass
    pub fn compute(&self, data: &[u8]) -> Digest {
        let value = match self {
            DigestAlgorithm::Sha224 => Sha224::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        };
        Digest {
            algorithm: *self,
            value,
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = AttachmentError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(AttachmentError::invalid("digest algorithm name is empty"));
        }
        let wanted = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.name() == wanted)
            .ok_or_else(|| AttachmentError::invalid(format!("unknown digest algorithm {s:?}")))
    }
}

/// A computed digest tagged with its algorithm
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: DigestAlgorithm,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
}

impl Digest {
    /// Lowercase hex rendering of the digest value
    pub fn hex(&self) -> String {
        hex::encode(&self.value)
    }

    /// Recompute over `data` and compare
    pub fn verify(&self, data: &[u8]) -> bool {
        self.algorithm.compute(data).value == self.value
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_known_sha256_vector() {
        let digest = DigestAlgorithm::Sha256.compute(b"abc");
        assert_eq!(
            digest.hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_lengths() {
        assert_eq!(DigestAlgorithm::Sha224.compute(b"x").value.len(), 28);
        assert_eq!(DigestAlgorithm::Sha256.compute(b"x").value.len(), 32);
        assert_eq!(DigestAlgorithm::Sha384.compute(b"x").value.len(), 48);
        assert_eq!(DigestAlgorithm::Sha512.compute(b"x").value.len(), 64);
    }

    #[test]
    fn test_deterministic() {
        for algorithm in DigestAlgorithm::ALL {
            let first = algorithm.compute(b"Hello from the test framework");
            let second = algorithm.compute(b"Hello from the test framework");
            assert_eq!(first, second);
            assert!(first.verify(b"Hello from the test framework"));
            assert!(!first.verify(b"Hello from the test framework!"));
        }
    }

    #[test]
    fn test_select() {
        assert_eq!(
            DigestAlgorithm::select(None, DigestAlgorithm::Sha512).unwrap(),
            DigestAlgorithm::Sha512
        );
        assert_eq!(
            DigestAlgorithm::select(Some("SHA256"), DigestAlgorithm::Sha512).unwrap(),
            DigestAlgorithm::Sha256
        );

        let empty = DigestAlgorithm::select(Some(""), DigestAlgorithm::Sha256).unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::Validation);

        let unknown = DigestAlgorithm::select(Some("md4"), DigestAlgorithm::Sha256).unwrap_err();
        assert_eq!(unknown.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_display() {
        let digest = DigestAlgorithm::Sha256.compute(b"");
        assert!(digest.to_string().starts_with("sha256:e3b0c442"));
    }
}
