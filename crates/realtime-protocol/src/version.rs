//! Protocol versioning.
//!
//! The version is negotiated through the `vsn` query parameter of the socket
//! URL. Version 2 is the array-framed serializer with binary broadcasts.

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version::new(2, 0, 0);

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
    /// Patch version.
    pub patch: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Check if this version can talk to a peer using `other`.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Parse a `major.minor.patch` string. Missing components default to 0.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split('.').map(str::parse::<u8>);
        let major = parts.next()?.ok()?;
        let minor = parts.next().transpose().ok()?.unwrap_or(0);
        let patch = parts.next().transpose().ok()?.unwrap_or(0);
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v2_0 = Version::new(2, 0, 0);
        let v2_1 = Version::new(2, 1, 3);
        let v1_0 = Version::new(1, 0, 0);

        assert!(v2_0.is_compatible_with(&v2_1));
        assert!(!v2_0.is_compatible_with(&v1_0));
    }

    #[test]
    fn test_version_display_and_parse() {
        assert_eq!(PROTOCOL_VERSION.to_string(), "2.0.0");
        assert_eq!(Version::parse("2.0.0"), Some(PROTOCOL_VERSION));
        assert_eq!(Version::parse("1.0"), Some(Version::new(1, 0, 0)));
        assert_eq!(Version::parse("x.1"), None);
        assert_eq!(Version::parse("1.2.3.4"), None);
    }
}
