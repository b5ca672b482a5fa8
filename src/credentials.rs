//! API token resolution and persistence.
//!
//! The token authenticates requests to the local server. It comes from an
//! explicit argument, the persisted token file, or is freshly generated.

use crate::error::Result;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the persisted token inside the state directory.
pub const TOKEN_FILE_NAME: &str = "api_key";

/// A bearer token. `Debug` and `Display` only show a short prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a 128-bit random token rendered as 32 hex characters.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(4).collect();
        format!("{}…", prefix)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.redacted())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// The token file under the service state directory.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(TOKEN_FILE_NAME),
        }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Explicit token > persisted token > newly generated token.
    pub fn resolve_token(&self, explicit: Option<&str>) -> Token {
        if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
            debug!("Using explicit API token");
            return Token::new(token);
        }
        if let Some(token) = self.load() {
            debug!("Loaded API token from {}", self.path.display());
            return token;
        }
        let token = Token::generate();
        debug!("Generated new API token {}", token);
        token
    }

    /// Read the persisted token, if present and non-empty.
    pub fn load(&self) -> Option<Token> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Token::new(trimmed))
        }
    }

    /// Write the token with owner-only permissions.
    pub fn persist(&self, token: &Token) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = open_private(&self.path)?;
        file.write_all(token.as_str().as_bytes())?;
        file.sync_all()?;
        debug!("API token written to {}", self.path.display());
        Ok(())
    }

    /// Remove the token file, tolerating its absence.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Create or truncate `path` so it is never readable by other users.
#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // The mode above only applies on creation.
    file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_is_hex() {
        let token = Token::generate();
        assert_eq!(token.as_str().len(), 32);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(token.as_str(), token.as_str().to_lowercase());
        assert_eq!(hex::decode(token.as_str()).unwrap().len(), 16);
        assert_ne!(token, Token::generate());
    }

    #[test]
    fn test_explicit_token_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        store.persist(&Token::new("persisted")).unwrap();

        assert_eq!(store.resolve_token(Some("explicit")).as_str(), "explicit");
    }

    #[test]
    fn test_persisted_token_beats_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        std::fs::write(store.path(), "persisted\n").unwrap();

        assert_eq!(store.resolve_token(None).as_str(), "persisted");
        assert_eq!(store.resolve_token(Some("  ")).as_str(), "persisted");
    }

    #[test]
    fn test_generates_when_nothing_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path());
        std::fs::write(store.path(), "   \n").unwrap();

        assert_eq!(store.resolve_token(None).as_str().len(), 32);
    }

    #[test]
    fn test_debug_is_redacted() {
        let token = Token::new("abcdef0123456789");
        let shown = format!("{:?} {}", token, token);
        assert!(!shown.contains("0123456789"));
    }

    #[cfg(unix)]
    #[test]
    fn test_persist_restricts_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(&dir.path().join("state"));
        store.persist(&Token::new("secret")).unwrap();

        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(store.load().unwrap().as_str(), "secret");

        store.remove().unwrap();
        assert!(!store.path().exists());
        store.remove().unwrap();
    }
}
