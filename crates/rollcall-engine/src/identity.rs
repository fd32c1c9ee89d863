use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_IDENTITY_CHARS: usize = 64;

/// A validated person name/code.
///
/// Doubles as the sample bucket directory name, so it never contains path
/// separators, never starts with a dot and carries no surrounding whitespace.
/// Ordering is plain byte order of the name, which is the label order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity(String);

impl Identity {
    pub fn parse(raw: &str) -> Result<Self, EngineError> {
        let invalid = |why: &str| EngineError::InvalidIdentity(format!("{raw:?}: {why}"));

        if raw.is_empty() {
            return Err(invalid("empty"));
        }
        if raw.chars().count() > MAX_IDENTITY_CHARS {
            return Err(invalid("longer than 64 characters"));
        }
        if raw.trim() != raw {
            return Err(invalid("leading or trailing whitespace"));
        }
        if raw.starts_with('.') {
            return Err(invalid("starts with '.'"));
        }
        if let Some(c) = raw
            .chars()
            .find(|c| !(c.is_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.')))
        {
            return Err(invalid(&format!("character {c:?} not allowed")));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Identity {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Identity::parse(&value)
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_names_and_codes() {
        for ok in ["ana", "Juan Jose", "2023_0147", "maría-lópez", "a.b"] {
            assert_eq!(Identity::parse(ok).unwrap().as_str(), ok);
        }
    }

    #[test]
    fn test_rejects_path_like_names() {
        for bad in ["", "..", ".hidden", "a/b", "a\\b", " ana", "ana ", "tab\there"] {
            assert!(
                matches!(Identity::parse(bad), Err(EngineError::InvalidIdentity(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_overlong() {
        assert!(Identity::parse(&"x".repeat(64)).is_ok());
        assert!(Identity::parse(&"x".repeat(65)).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: Identity = serde_json::from_str("\"ana\"").unwrap();
        assert_eq!(ok.as_str(), "ana");
        assert!(serde_json::from_str::<Identity>("\"../etc\"").is_err());
    }
}
