// Aviary Engine — Secret Store
// Provider API keys behind one small interface: the OS keychain by default,
// an on-disk fallback for headless machines. Only the interface matters to
// the rest of the engine; intermediate buffers are zeroized.

use crate::atoms::error::{EngineError, EngineResult};
use base64::Engine as _;
use log::warn;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const SERVICE: &str = "aviary";

pub enum SecretStore {
    Keyring,
    File { path: PathBuf },
}

impl SecretStore {
    /// `security.secret_backend`: "keyring" (default) or "file".
    pub fn from_config(backend: &str, workspace: &Path) -> Self {
        match backend {
            "file" => SecretStore::File { path: workspace.join(".secrets.json") },
            _ => SecretStore::Keyring,
        }
    }

    pub fn get(&self, name: &str) -> EngineResult<Option<String>> {
        match self {
            SecretStore::Keyring => {
                let entry = keyring::Entry::new(SERVICE, name)
                    .map_err(|e| EngineError::Keyring(e.to_string()))?;
                match entry.get_password() {
                    Ok(secret) => Ok(Some(secret)),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(e) => {
                        warn!("[secrets] Keyring read failed for '{}': {}", name, e);
                        Err(EngineError::Keyring(e.to_string()))
                    }
                }
            }
            SecretStore::File { path } => {
                let map = read_file_map(path)?;
                Ok(map.get(name).map(|v| {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(v)
                        .unwrap_or_default();
                    String::from_utf8_lossy(&decoded).to_string()
                }))
            }
        }
    }

    pub fn set(&self, name: &str, value: &str) -> EngineResult<()> {
        match self {
            SecretStore::Keyring => {
                let entry = keyring::Entry::new(SERVICE, name)
                    .map_err(|e| EngineError::Keyring(e.to_string()))?;
                entry
                    .set_password(value)
                    .map_err(|e| EngineError::Keyring(e.to_string()))
            }
            SecretStore::File { path } => {
                let mut map = read_file_map(path)?;
                map.insert(
                    name.to_string(),
                    base64::engine::general_purpose::STANDARD.encode(value.as_bytes()),
                );
                let serialized = Zeroizing::new(serde_json::to_string(&map)?);
                std::fs::write(path, serialized.as_bytes())?;
                Ok(())
            }
        }
    }

    pub fn delete(&self, name: &str) -> EngineResult<()> {
        match self {
            SecretStore::Keyring => {
                let entry = keyring::Entry::new(SERVICE, name)
                    .map_err(|e| EngineError::Keyring(e.to_string()))?;
                match entry.delete_credential() {
                    Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                    Err(e) => Err(EngineError::Keyring(e.to_string())),
                }
            }
            SecretStore::File { path } => {
                let mut map = read_file_map(path)?;
                map.remove(name);
                let serialized = Zeroizing::new(serde_json::to_string(&map)?);
                std::fs::write(path, serialized.as_bytes())?;
                Ok(())
            }
        }
    }
}

fn read_file_map(path: &Path) -> EngineResult<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = Zeroizing::new(std::fs::read_to_string(path)?);
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::from_config("file", dir.path());
        assert!(store.get("openai_api_key").unwrap().is_none());
        store.set("openai_api_key", "sk-test-value").unwrap();
        assert_eq!(store.get("openai_api_key").unwrap().as_deref(), Some("sk-test-value"));
        store.delete("openai_api_key").unwrap();
        assert!(store.get("openai_api_key").unwrap().is_none());
    }

    #[test]
    fn file_backend_never_stores_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = SecretStore::from_config("file", dir.path());
        store.set("k", "super-secret-token").unwrap();
        let raw = std::fs::read_to_string(dir.path().join(".secrets.json")).unwrap();
        assert!(!raw.contains("super-secret-token"));
    }
}
