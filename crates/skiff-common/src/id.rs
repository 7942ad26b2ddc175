//! Random identifiers for containers and anonymous volumes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{SkiffError, SkiffResult};

/// Identifier of a container; names its directory under `containers/`.
///
/// Generated ids are 12 lowercase hex digits. Ids read back from disk are
/// only checked to be a single safe path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

impl ContainerId {
    /// Longest accepted id.
    pub const MAX_LENGTH: usize = 64;

    /// Wrap an existing id.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::InvalidContainerId`] unless `id` is 1 to
    /// [`Self::MAX_LENGTH`] characters of `[A-Za-z0-9_-]` starting with a
    /// letter or digit.
    pub fn new(id: impl Into<String>) -> SkiffResult<Self> {
        let id = id.into();
        let path_safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_');
        let well_formed = id.len() <= Self::MAX_LENGTH
            && id.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
            && id.chars().all(path_safe);

        if well_formed {
            Ok(Self(id))
        } else {
            Err(SkiffError::InvalidContainerId { id })
        }
    }

    /// Fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(random_hex(6))
    }

    /// The id text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// At most the first `len` characters; veth names are built from this.
    #[must_use]
    pub fn prefix(&self, len: usize) -> &str {
        self.0.get(..len).unwrap_or(&self.0)
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Directory name for an anonymous volume under `volumes/`.
#[must_use]
pub fn volume_id() -> String {
    random_hex(5)
}

/// `bytes` random bytes from a v4 UUID, hex encoded.
fn random_hex(bytes: usize) -> String {
    let uuid = uuid::Uuid::new_v4();
    hex::encode(&uuid.as_bytes()[..bytes.min(16)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_generated_and_named_forms() {
        for id in ["4f2a9c1e0b7d", "c1", "web_1", "Build-7"] {
            assert_eq!(ContainerId::new(id).unwrap().as_str(), id);
        }
    }

    #[test]
    fn rejects_unsafe_components() {
        let long = "f".repeat(ContainerId::MAX_LENGTH + 1);
        for id in ["", "-x", "_x", "..", "a/b", "a b", long.as_str()] {
            assert!(
                matches!(ContainerId::new(id), Err(SkiffError::InvalidContainerId { .. })),
                "{id:?} should be rejected"
            );
        }
    }

    #[test]
    fn generated_ids_are_twelve_hex_digits() {
        let a = ContainerId::generate();
        let b = ContainerId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 12);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(a.as_str().parse::<ContainerId>().is_ok());
    }

    #[test]
    fn prefix_never_overruns() {
        assert_eq!(ContainerId::new("abc").unwrap().prefix(8), "abc");
        assert_eq!(ContainerId::new("0123456789ab").unwrap().prefix(8), "01234567");
    }

    #[test]
    fn volume_ids_are_ten_hex_digits() {
        let id = volume_id();
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
