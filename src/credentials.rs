//! API credential loading from a `.env` file with process-environment fallback.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use tracing::{debug, warn};

/// Credentials file read when no other path is given.
pub const DEFAULT_ENV_FILE: &str = ".env";

/// Key holding the Battle.net OAuth client id.
pub const CLIENT_ID_KEY: &str = "CLIENT_ID";

/// Key holding the Battle.net OAuth client secret.
pub const CLIENT_SECRET_KEY: &str = "CLIENT_SECRET";

/// Runtime credentials loaded from `.env` and the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a key-value map.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Returns a credential value for a key, if present and non-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    /// Returns a required credential or an error when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the key is absent or empty.
    pub fn require(&self, key: &str) -> anyhow::Result<String> {
        self.get(key)
            .map(ToOwned::to_owned)
            .ok_or_else(|| anyhow::anyhow!("missing required credential: {key}"))
    }

    /// OAuth client id and secret for the game-data API.
    ///
    /// # Errors
    ///
    /// Returns an error when either value is missing.
    pub fn oauth_client(&self) -> anyhow::Result<(String, String)> {
        Ok((self.require(CLIENT_ID_KEY)?, self.require(CLIENT_SECRET_KEY)?))
    }
}

/// Load credentials from a `.env` file, falling back to the process
/// environment for keys the file does not define.
///
/// A missing file is logged and treated as empty.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    load_credentials_with(path, |key| std::env::var(key).ok())
}

/// Same as [`load_credentials`] with an injectable environment resolver.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be parsed.
pub fn load_credentials_with(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Credentials> {
    let mut vars = BTreeMap::new();

    if path.exists() {
        let iter = dotenvy::from_path_iter(path)
            .with_context(|| format!("failed to read credentials at {}", path.display()))?;
        for item in iter {
            let (key, value) = item.with_context(|| {
                format!(
                    "failed to parse key-value entry in credentials file {}",
                    path.display()
                )
            })?;
            vars.insert(key, value);
        }
        debug!(path = %path.display(), keys = vars.len(), "loaded credentials file");
    } else {
        warn!(
            path = %path.display(),
            "credentials file not found, falling back to environment variables"
        );
    }

    for key in [CLIENT_ID_KEY, CLIENT_SECRET_KEY] {
        if !vars.contains_key(key) {
            if let Some(value) = env(key) {
                vars.insert(key.to_owned(), value);
            }
        }
    }

    Ok(Credentials { vars })
}
