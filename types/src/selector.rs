use serde::Deserialize;

use crate::RULE_LANGUAGE_ID;

/// Which documents a session serves: a URI scheme plus a language identifier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DocumentSelector {
    pub scheme: String,
    pub language_id: String,
}

impl Default for DocumentSelector {
    fn default() -> Self {
        Self {
            scheme: String::from("file"),
            language_id: String::from(RULE_LANGUAGE_ID),
        }
    }
}

impl DocumentSelector {
    /// Whether a document with this URI and declared language belongs to the session.
    ///
    /// The scheme is compared case-insensitively (RFC 3986); the language id exactly.
    #[must_use]
    pub fn matches(&self, uri: &str, language_id: &str) -> bool {
        let Some((scheme, _)) = uri.split_once(':') else {
            return false;
        };
        scheme.eq_ignore_ascii_case(&self.scheme) && language_id == self.language_id
    }

    /// Language id for a path, judged by extension (`.yar`, `.yara`).
    #[must_use]
    pub fn language_for_extension(ext: &str) -> Option<&'static str> {
        match ext.to_ascii_lowercase().as_str() {
            "yar" | "yara" => Some(RULE_LANGUAGE_ID),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_local_rule_files_only() {
        let selector = DocumentSelector::default();
        assert!(selector.matches("file:///rules/peek_rules.yara", "yara"));
        assert!(selector.matches("FILE:///rules/a.yar", "yara"));
        assert!(!selector.matches("untitled:Untitled-1", "yara"));
        assert!(!selector.matches("file:///src/main.rs", "rust"));
        assert!(!selector.matches("not a uri", "yara"));
    }

    #[test]
    fn extension_lookup() {
        assert_eq!(DocumentSelector::language_for_extension("YARA"), Some("yara"));
        assert_eq!(DocumentSelector::language_for_extension("yar"), Some("yara"));
        assert_eq!(DocumentSelector::language_for_extension("rs"), None);
    }
}
