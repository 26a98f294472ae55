//! Glob-style key patterns for subscriptions.

use std::fmt;

use regex::Regex;
use thiserror::Error;

use voxbus_core::StateKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("Empty key pattern")]
    Empty,

    #[error("Invalid key pattern '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },
}

/// `*` matches any run of characters, `?` exactly one; everything else is literal.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let mut re = String::with_capacity(pattern.len() + 8);
        re.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                other => re.push_str(&regex::escape(&other.to_string())),
            }
        }
        re.push('$');

        let regex = Regex::new(&re).map_err(|e| PatternError::Invalid {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    /// Pattern matching every key.
    pub fn all() -> Self {
        Self {
            raw: "*".to_string(),
            regex: Regex::new("^.*$").expect("match-all pattern compiles"),
        }
    }

    pub fn matches(&self, key: &StateKey) -> bool {
        self.regex.is_match(key.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
