//! Secret handling utilities.
//!
//! Re-exports secrecy types and wraps analysis credentials so they never end
//! up in logs.

pub use secrecy::{ExposeSecret, SecretString};

/// One externally rate-limited credential for the analysis backend.
///
/// `name` is safe to log; `key` is not.
#[derive(Debug)]
pub struct Credential {
    pub name: String,
    key: SecretString,
}

impl Credential {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: SecretString::from(key.into()),
        }
    }

    pub fn key(&self) -> &SecretString {
        &self.key
    }
}

/// Parse a comma-separated credential list. Entries may be `name=key`;
/// unnamed entries are called `cred-N`.
pub fn parse_credentials(raw: &str) -> Vec<Credential> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, entry)| match entry.split_once('=') {
            Some((name, key)) if !name.trim().is_empty() => Credential::new(name.trim(), key.trim()),
            _ => Credential::new(format!("cred-{i}"), entry),
        })
        .collect()
}
