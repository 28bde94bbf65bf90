//! Content digests and checksum algorithms.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::Digest as _;

use crate::error::{RegistryError, RegistryResult};

/// The digest of the well-known empty gzipped tar layer.
///
/// Schema 1 manifests reference this layer many times and some upstreams never serve it.
pub const EMPTY_LAYER_DIGEST: &str =
    "sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4";

/// The bytes of the empty gzipped tar layer.
pub const EMPTY_LAYER: &[u8] = &[
    31, 139, 8, 0, 0, 9, 110, 136, 0, 255, 98, 24, 5, 163, 96, 20, 140, 88, 0, 8, 0, 0, 255, 255,
    46, 175, 181, 239, 0, 4, 0, 0,
];

/// A checksum algorithm usable for content digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// SHA-256, the registry default.
    Sha256,

    /// SHA-512.
    Sha512,
}

impl Algorithm {
    /// The algorithm prefix used in digest strings.
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }

    /// Start an incremental hash.
    pub fn hasher(&self) -> Hasher {
        match self {
            Algorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }

    /// Hash `content` in one go.
    pub fn digest(&self, content: &[u8]) -> Digest {
        let mut hasher = self.hasher();
        hasher.update(content);
        hasher.finish()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Algorithm {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha256" => Ok(Algorithm::Sha256),
            "sha512" => Ok(Algorithm::Sha512),
            other => Err(RegistryError::AlgorithmNotAllowed(other.to_owned())),
        }
    }
}

/// Incremental hashing state for one [`Algorithm`].
#[derive(Debug, Clone)]
pub enum Hasher {
    /// SHA-256 state.
    Sha256(sha2::Sha256),

    /// SHA-512 state.
    Sha512(sha2::Sha512),
}

impl Hasher {
    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Finish hashing and produce the digest.
    pub fn finish(self) -> Digest {
        match self {
            Hasher::Sha256(h) => Digest {
                algorithm: Algorithm::Sha256,
                hex: hex::encode(h.finalize()),
            },
            Hasher::Sha512(h) => Digest {
                algorithm: Algorithm::Sha512,
                hex: hex::encode(h.finalize()),
            },
        }
    }
}

/// An algorithm-tagged content digest, printed as `<algorithm>:<hex>`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    hex: String,
}

impl Digest {
    /// The algorithm that produced this digest.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// The lowercase hex encoded hash.
    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check that `content` hashes to this digest.
    pub fn verify(&self, content: &[u8]) -> RegistryResult<()> {
        let actual = self.algorithm.digest(content);
        if &actual != self {
            return Err(RegistryError::DigestMismatch {
                expected: self.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Whether this is the empty gzipped layer digest.
    pub fn is_empty_layer(&self) -> bool {
        self.algorithm == Algorithm::Sha256 && self.hex == EMPTY_LAYER_DIGEST[7..]
    }

    /// The empty gzipped layer digest.
    pub fn empty_layer() -> Digest {
        Digest {
            algorithm: Algorithm::Sha256,
            hex: EMPTY_LAYER_DIGEST[7..].to_owned(),
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RegistryError::InvalidDigest(s.to_owned());
        let (algorithm, hex) = s.split_once(':').ok_or_else(invalid)?;
        let algorithm: Algorithm = algorithm.parse().map_err(|_| invalid())?;
        let well_formed = hex.len() == algorithm.hex_len()
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(invalid());
        }

        Ok(Digest {
            algorithm,
            hex: hex.to_owned(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = RegistryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(value: Digest) -> Self {
        value.to_string()
    }
}

/// The allow-list of checksum algorithms content may be stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowedAlgorithms(Vec<Algorithm>);

impl Default for AllowedAlgorithms {
    fn default() -> Self {
        AllowedAlgorithms(vec![Algorithm::Sha256])
    }
}

impl AllowedAlgorithms {
    /// Allow exactly these algorithms.
    pub fn new(algorithms: impl IntoIterator<Item = Algorithm>) -> Self {
        AllowedAlgorithms(algorithms.into_iter().collect())
    }

    /// Whether `algorithm` is allowed.
    pub fn allows(&self, algorithm: Algorithm) -> bool {
        self.0.contains(&algorithm)
    }

    /// Reject algorithms outside the allow-list.
    pub fn check(&self, algorithm: Algorithm) -> RegistryResult<()> {
        if self.allows(algorithm) {
            Ok(())
        } else {
            Err(RegistryError::AlgorithmNotAllowed(algorithm.to_string()))
        }
    }

    /// The preferred algorithm for newly computed digests.
    pub fn preferred(&self) -> Algorithm {
        self.0.first().copied().unwrap_or(Algorithm::Sha256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let digest: Digest = EMPTY_LAYER_DIGEST.parse().unwrap();
        assert_eq!(digest.to_string(), EMPTY_LAYER_DIGEST);
        assert_eq!(digest.algorithm(), Algorithm::Sha256);
        assert!(digest.is_empty_layer());
    }

    #[test]
    fn empty_layer_bytes_match_digest() {
        Digest::empty_layer().verify(EMPTY_LAYER).unwrap();
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "sha256",
            "sha256:abc",
            "md5:d41d8cd98f00b204e9800998ecf8427e",
            "sha256:A3ED95CAEB02FFE68CDD9FD84406680AE93D633CB16422D00E8A7C22955B46D4",
        ] {
            assert!(bad.parse::<Digest>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn sha512_digest() {
        let digest = Algorithm::Sha512.digest(b"hello");
        assert_eq!(digest.hex().len(), 128);
        assert_eq!(digest.to_string().parse::<Digest>().unwrap(), digest);
    }

    #[test]
    fn verify_reports_mismatch() {
        let digest = Algorithm::Sha256.digest(b"one");
        let err = digest.verify(b"two").unwrap_err();
        assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    }

    #[test]
    fn allow_list() {
        let allowed = AllowedAlgorithms::default();
        assert!(allowed.check(Algorithm::Sha256).is_ok());
        assert!(allowed.check(Algorithm::Sha512).is_err());
    }

    #[test]
    fn serde_as_string() {
        let digest = Algorithm::Sha256.digest(b"x");
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{digest}\""));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }
}
