//! Secrets document loading (spec §6: "Secrets are referenced by
//! indirection ... and resolved from a separate secrets document with
//! 0600 file mode").

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(path).map_err(|e| ConfigError::Io(e.to_string()))?;
    let mode = meta.permissions().mode() & 0o777;
    if mode != 0o600 {
        return Err(ConfigError::InsecureSecretsFile(format!(
            "{} has mode {:o}, expected 0600",
            path.display(),
            mode
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

/// The loaded secrets document, keyed by dotted path (e.g.
/// `telegram.bot_token`) matching the `token_ref` indirection module
/// fragments carry. Never serialized, never cloned into a broadcast
/// payload — `Debug` is intentionally not derived for the inner map.
pub struct Secrets {
    path: PathBuf,
    tree: toml::Value,
}

impl Secrets {
    /// Loads and validates the secrets document's file mode. Missing file
    /// is not an error here — `resolve` fails lazily per missing key, since
    /// a deployment with no module requiring secrets need not provide one.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                tree: toml::Value::Table(toml::map::Map::new()),
            });
        }
        check_permissions(&path)?;
        let raw = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let tree: toml::Value = toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self { path, tree })
    }

    /// Resolves a dotted `token_ref` such as `telegram.bot_token` (the
    /// `secrets.` prefix used in config documents is stripped by the
    /// caller before reaching here).
    pub fn resolve(&self, dotted_path: &str) -> Result<String, ConfigError> {
        let mut cursor = &self.tree;
        for segment in dotted_path.split('.') {
            cursor = cursor
                .get(segment)
                .ok_or_else(|| ConfigError::MissingSecret(dotted_path.to_string()))?;
        }
        cursor
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingSecret(dotted_path.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Strips the conventional `secrets.` prefix from a `token_ref` field, per
/// spec §6's example `token_ref: secrets.telegram.bot_token`.
pub fn strip_secrets_prefix(token_ref: &str) -> &str {
    token_ref.strip_prefix("secrets.").unwrap_or(token_ref)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_resolves_to_empty_tree() {
        let secrets = Secrets::load("/nonexistent/path/secrets.toml").unwrap();
        assert!(secrets.resolve("telegram.bot_token").is_err());
    }

    #[test]
    fn strip_prefix_removes_secrets_dot() {
        assert_eq!(strip_secrets_prefix("secrets.telegram.bot_token"), "telegram.bot_token");
        assert_eq!(strip_secrets_prefix("telegram.bot_token"), "telegram.bot_token");
    }
}
