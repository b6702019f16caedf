//! kernel command-line arguments of a deployment

use std::fmt;

/// key of the token selecting the deployment root at boot
pub const ROOT_KEY: &str = "ostree";

/// ordered kernel arguments, each token kept exactly as written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootArguments(Vec<String>);

impl BootArguments {
    /// split on ASCII whitespace outside double quotes
    pub fn parse(input: &str) -> Self {
        let mut in_quotes = false;
        let tokens = input
            .split(move |c: char| {
                if c == '"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        Self(tokens)
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// the key part of a token, `key` for both `key` and `key=value`
    fn key_of(token: &str) -> &str {
        token.split_once('=').map_or(token, |(k, _)| k)
    }

    /// value of the first `key=value` token
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|t| Self::key_of(t) == key)
            .and_then(|t| t.split_once('=').map(|(_, v)| v))
    }

    /// copy with every token for `key` removed
    pub fn without(&self, key: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|t| Self::key_of(t) != key)
                .cloned()
                .collect(),
        )
    }

    pub fn push(&mut self, token: impl Into<String>) {
        self.0.push(token.into());
    }
}

impl fmt::Display for BootArguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}
