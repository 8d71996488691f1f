//! Repository model and lifecycle management.

pub mod lifecycle;
pub mod retention;

use std::collections::BTreeMap;
use std::fmt;

pub use lifecycle::{RepositoryManager, RepositoryStats};
pub use retention::RetentionWindow;

/// Environment variable the engine reads the repository passphrase from.
pub const PASSWORD_ENV: &str = "RESTIC_PASSWORD";

/// A remote content-addressed store.
///
/// Built once from configuration with secrets already resolved; never mutated
/// afterwards. Secrets are only exposed through [`Repository::environment`].
#[derive(Clone, PartialEq, Eq)]
pub struct Repository {
    pub name: String,
    pub location: String,
    credentials: BTreeMap<String, String>,
    passphrase: String,
}

impl Repository {
    pub fn new(
        name: impl Into<String>,
        location: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            location: location.into(),
            credentials: BTreeMap::new(),
            passphrase: passphrase.into(),
        }
    }

    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    /// Environment overlay for engine calls against this repository.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.credentials.clone();
        env.insert(PASSWORD_ENV.to_string(), self.passphrase.clone());
        env
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("location", &self.location)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_contains_passphrase_and_credentials() {
        let repo = Repository::new("vm", "b2:bucket:host/vm", "pw")
            .with_credential("B2_ACCOUNT_ID", "id");
        let env = repo.environment();

        assert_eq!(env.get(PASSWORD_ENV).map(String::as_str), Some("pw"));
        assert_eq!(env.get("B2_ACCOUNT_ID").map(String::as_str), Some("id"));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let repo = Repository::new("vm", "b2:bucket:host/vm", "pw-secret")
            .with_credential("B2_ACCOUNT_KEY", "key-secret");
        let rendered = format!("{repo:?}");

        assert!(rendered.contains("B2_ACCOUNT_KEY"));
        assert!(!rendered.contains("pw-secret"));
        assert!(!rendered.contains("key-secret"));
    }
}
