// ABOUTME: Validated application version string.
// ABOUTME: Rejects empty or whitespace-only versions at construction time.

use serde::{Deserialize, Deserializer, Serialize};

/// An application version label, e.g. "1.4.2" or "2024-06-01".
///
/// The orchestrator treats versions as opaque labels; it never compares
/// them semantically, only for equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Version(String);

impl Version {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err("version must not be empty".to_string());
        }
        if value.chars().any(char::is_whitespace) {
            return Err(format!("version must not contain whitespace: {value:?}"));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Version::new(value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_versions() {
        assert!(Version::new("1.0.0").is_ok());
        assert!(Version::new("v2").is_ok());
        assert!(Version::new("2024-06-01+build.3").is_ok());
    }

    #[test]
    fn rejects_empty_and_whitespace() {
        assert!(Version::new("").is_err());
        assert!(Version::new("   ").is_err());
        assert!(Version::new("1.0 beta").is_err());
    }
}
