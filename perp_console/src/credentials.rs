/// credentials.rs — Exchange API key pair + its on-disk key-value store
///
/// The store is a small JSON object file; the credential pair lives under
/// the fixed key `bingx_creds`. Other keys in the file are preserved.
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;

pub const CREDENTIALS_KEY: &str = "bingx_creds";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "apiKey")]
    pub api_key:    String,
    #[serde(rename = "apiSecret")]
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), api_secret: api_secret.into() }
    }

    /// Both halves present.
    pub fn is_complete(&self) -> bool {
        !self.api_key.trim().is_empty() && !self.api_secret.trim().is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: String = self.api_key.chars().take(4).collect();
        f.debug_struct("Credentials")
            .field("api_key", &format!("{shown}…"))
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<Credentials>, StoreError> {
        let entries = self.read_entries()?;
        match entries.get(CREDENTIALS_KEY) {
            Some(v) => {
                let creds: Credentials = serde_json::from_value(v.clone())?;
                Ok(creds.is_complete().then_some(creds))
            }
            None => Ok(None),
        }
    }

    /// Overwrites any previously stored pair.
    pub fn save(&self, creds: &Credentials) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        entries.insert(CREDENTIALS_KEY.to_owned(), serde_json::to_value(creds)?);
        self.write_entries(&entries)?;
        info!(path = %self.path.display(), "Credentials saved");
        Ok(())
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        let mut entries = self.read_entries()?;
        if entries.remove(CREDENTIALS_KEY).is_some() {
            self.write_entries(&entries)?;
            info!(path = %self.path.display(), "Credentials removed");
        }
        Ok(())
    }

    fn read_entries(&self) -> Result<BTreeMap<String, Value>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(s) if s.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(s) => Ok(serde_json::from_str(&s)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No credential store yet");
                Ok(BTreeMap::new())
            }
            Err(e) => Err(self.io_err(e)),
        }
    }

    fn write_entries(&self, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }
        let body = serde_json::to_string_pretty(entries)?;
        fs::write(&self.path, body).map_err(|e| self.io_err(e))?;
        restrict_permissions(&self.path).map_err(|e| self.io_err(e))
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io { path: self.path.display().to_string(), source }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> CredentialStore {
        let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let path = std::env::temp_dir()
            .join(format!("perp_console_{tag}_{}_{nanos}", std::process::id()))
            .join("store.json");
        CredentialStore::new(path)
    }

    #[test]
    fn missing_file_means_disconnected() {
        let store = temp_store("missing");
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn save_load_clear() {
        let store = temp_store("roundtrip");
        let creds = Credentials::new("key-123", "secret-456");
        store.save(&creds).unwrap();
        assert_eq!(store.load().unwrap(), Some(creds));

        let overwritten = Credentials::new("key-789", "secret-000");
        store.save(&overwritten).unwrap();
        assert_eq!(store.load().unwrap(), Some(overwritten));

        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn foreign_keys_survive() {
        let store = temp_store("foreign");
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), r#"{"theme":"dark"}"#).unwrap();
        store.save(&Credentials::new("k", "s")).unwrap();
        store.clear().unwrap();
        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("theme"));
    }

    #[test]
    fn debug_never_shows_secret() {
        let creds = Credentials::new("abcdefgh", "top-secret-value");
        let shown = format!("{creds:?}");
        assert!(!shown.contains("top-secret-value"));
        assert!(!shown.contains("abcdefgh"));
    }
}
