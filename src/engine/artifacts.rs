// Aviary Engine — Artifact Store
// Content-addressed files under `artifacts/`. Bots hand outputs to each
// other by artifact path instead of re-parsing prior prose. Fetched web
// content is isolated under the `external_source` namespace with a trust
// score and is always banner-wrapped before a provider sees it.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::room_types::ArtifactDescriptor;
use log::info;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Namespace for untrusted web-fetched content.
pub const EXTERNAL_NAMESPACE: &str = "external_source";

pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(workspace: &Path) -> EngineResult<Self> {
        let dir = workspace.join("artifacts");
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(dir.join(EXTERNAL_NAMESPACE))?;
        Ok(ArtifactStore { dir })
    }

    /// Store bytes under their content hash. Returns the descriptor whose
    /// `path` is relative to the workspace (stable across moves).
    pub fn put(&self, bytes: &[u8], kind: &str, ext: &str) -> EngineResult<ArtifactDescriptor> {
        self.put_in(None, bytes, kind, ext)
    }

    /// Store untrusted external content in its own namespace.
    pub fn put_external(&self, bytes: &[u8], kind: &str, ext: &str) -> EngineResult<ArtifactDescriptor> {
        self.put_in(Some(EXTERNAL_NAMESPACE), bytes, kind, ext)
    }

    fn put_in(
        &self,
        namespace: Option<&str>,
        bytes: &[u8],
        kind: &str,
        ext: &str,
    ) -> EngineResult<ArtifactDescriptor> {
        let hash = hex_digest(bytes);
        let file_name = format!("{}.{}", hash, sanitize_ext(ext));
        let (rel, abs) = match namespace {
            Some(ns) => (
                format!("artifacts/{}/{}", ns, file_name),
                self.dir.join(ns).join(&file_name),
            ),
            None => (format!("artifacts/{}", file_name), self.dir.join(&file_name)),
        };
        if !abs.exists() {
            std::fs::write(&abs, bytes)?;
            info!("[artifacts] Stored {} ({} bytes)", rel, bytes.len());
        }
        Ok(ArtifactDescriptor {
            path: rel,
            kind: kind.to_string(),
            size: bytes.len() as u64,
            sha256: hash,
            created_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Read an artifact back by its workspace-relative path, verifying the
    /// content hash embedded in the file name.
    pub fn get(&self, rel_path: &str) -> EngineResult<Vec<u8>> {
        let stripped = rel_path
            .strip_prefix("artifacts/")
            .ok_or_else(|| EngineError::user(format!("not an artifact path: {}", rel_path)))?;
        if stripped.contains("..") {
            return Err(EngineError::Security(format!("artifact path escapes store: {}", rel_path)));
        }
        let abs = self.dir.join(stripped);
        let bytes = std::fs::read(&abs)
            .map_err(|_| EngineError::user(format!("artifact not found: {}", rel_path)))?;
        let expected = abs
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        let actual = hex_digest(&bytes);
        if !expected.is_empty() && actual != expected {
            return Err(EngineError::Corruption(format!(
                "artifact {} hash mismatch (expected {}, got {})",
                rel_path, expected, actual
            )));
        }
        Ok(bytes)
    }

    pub fn is_external(rel_path: &str) -> bool {
        rel_path.starts_with(&format!("artifacts/{}/", EXTERNAL_NAMESPACE))
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn sanitize_ext(ext: &str) -> String {
    let cleaned: String = ext.chars().filter(|c| c.is_alphanumeric()).take(8).collect();
    if cleaned.is_empty() { "bin".into() } else { cleaned }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_roundtrip_with_hash_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let desc = store.put(b"hello artifacts", "text", "txt").unwrap();
        assert!(desc.path.starts_with("artifacts/"));
        assert_eq!(desc.size, 15);
        let bytes = store.get(&desc.path).unwrap();
        assert_eq!(bytes, b"hello artifacts");
    }

    #[test]
    fn identical_content_deduplicates() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let a = store.put(b"same", "text", "txt").unwrap();
        let b = store.put(b"same", "text", "txt").unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(a.sha256, b.sha256);
    }

    #[test]
    fn external_namespace_is_detectable() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let desc = store.put_external(b"<html>buy now</html>", "web", "html").unwrap();
        assert!(ArtifactStore::is_external(&desc.path));
        assert!(!ArtifactStore::is_external("artifacts/abc.txt"));
    }

    #[test]
    fn tampered_artifact_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let desc = store.put(b"original", "text", "txt").unwrap();
        let abs = dir.path().join(&desc.path);
        std::fs::write(&abs, b"tampered").unwrap();
        assert!(matches!(store.get(&desc.path), Err(EngineError::Corruption(_))));
    }

    #[test]
    fn traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        assert!(store.get("artifacts/../secrets.txt").is_err());
    }
}
