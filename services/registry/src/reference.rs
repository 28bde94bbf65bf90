//! Repository names and manifest references.

use std::fmt;

use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

const MAX_NAME_LENGTH: usize = 255;
const MAX_TAG_LENGTH: usize = 128;

/// Check a repository name: `/`-separated components of lowercase alphanumerics, joined
/// within a component by `.`, `_`, `__` or runs of `-`.
pub fn validate_repository(name: &str) -> RegistryResult<()> {
    let invalid = || RegistryError::InvalidRepository(name.to_owned());
    if name.is_empty() || name.len() > MAX_NAME_LENGTH {
        return Err(invalid());
    }
    if name.split('/').all(valid_component) {
        Ok(())
    } else {
        Err(invalid())
    }
}

fn valid_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !bytes.first().is_some_and(alnum) || !bytes.last().is_some_and(alnum) {
        return false;
    }

    let mut i = 0;
    while i < bytes.len() {
        if alnum(&bytes[i]) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && !alnum(&bytes[i]) {
            i += 1;
        }
        let separator = &component[start..i];
        let allowed = matches!(separator, "." | "_" | "__") || separator.bytes().all(|b| b == b'-');
        if !allowed {
            return false;
        }
    }
    true
}

/// Check a tag: up to 128 of `[A-Za-z0-9_.-]`, not starting with `.` or `-`.
pub fn validate_tag(tag: &str) -> RegistryResult<()> {
    let valid = tag.len() <= MAX_TAG_LENGTH
        && tag
            .bytes()
            .next()
            .is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_')
        && tag
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidManifest(format!("invalid tag {tag:?}")))
    }
}

/// What a manifest request names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// A mutable tag.
    Tag(String),

    /// A content digest.
    Digest(Digest),
}

impl Reference {
    /// Parse a reference: anything containing `:` must be a digest, everything else a tag.
    pub fn parse(reference: &str) -> RegistryResult<Self> {
        if reference.contains(':') {
            return Ok(Reference::Digest(reference.parse()?));
        }
        validate_tag(reference)?;
        Ok(Reference::Tag(reference.to_owned()))
    }

    /// The tag, if this is one.
    pub fn tag(&self) -> Option<&str> {
        match self {
            Reference::Tag(tag) => Some(tag),
            Reference::Digest(_) => None,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}
