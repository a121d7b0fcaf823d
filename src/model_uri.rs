use std::fmt;

use serde::{Deserialize, Serialize};

/// A normalized model identifier. Equality and hashing are by the normalized
/// string, so the same model addressed with different casing in its scheme
/// maps to a single transaction slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelUri(String);

impl ModelUri {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(Self::normalize(raw.as_ref()))
    }

    /// Lowercases the scheme (the part before the first `:`) and trims
    /// trailing slashes. The rest of the URI is left untouched since model
    /// paths on disk are often case-sensitive.
    fn normalize(raw: &str) -> String {
        let trimmed = raw.trim().trim_end_matches('/');

        match trimmed.split_once(':') {
            Some((scheme, rest)) => format!("{}:{rest}", scheme.to_lowercase()),
            None => trimmed.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ModelUri {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for ModelUri {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_scheme_case_and_trailing_slash() {
        let a = ModelUri::new("FILE:/models/m1.json/");
        let b = ModelUri::new("file:/models/m1.json");
        assert_eq!(a, b);
    }

    #[test]
    fn preserves_path_case() {
        let uri = ModelUri::new("file:/Models/M1.json");
        assert_eq!(uri.as_str(), "file:/Models/M1.json");
    }

    #[test]
    fn opaque_uri_without_scheme_is_trimmed_only() {
        let uri = ModelUri::new("  m1  ");
        assert_eq!(uri.as_str(), "m1");
    }
}
