// Aviary Engine — Audit Chain
// Append-only `audit.log` of security-relevant happenings: tool calls,
// delegations, escalations, promotions. Each line is JSON carrying an
// HMAC-SHA256 over (previous mac || payload), so truncation or tampering
// anywhere breaks verification from that point on.

use crate::atoms::error::{EngineError, EngineResult};
use base64::Engine as _;
use hmac::{Hmac, Mac};
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::io::Write;
use std::path::{Path, PathBuf};

type HmacSha256 = Hmac<Sha256>;

const GENESIS_MAC: &str = "genesis";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub timestamp: String,
    pub kind: String,
    pub actor: String,
    pub detail: String,
    pub prev_mac: String,
    pub mac: String,
}

pub struct AuditLog {
    path: PathBuf,
    key: Vec<u8>,
    state: Mutex<ChainState>,
}

struct ChainState {
    seq: u64,
    last_mac: String,
}

impl AuditLog {
    /// Open (or start) the chain. The signing key is created on first use
    /// and kept next to the log; losing it only disables verification,
    /// never reading.
    pub fn open(workspace: &Path) -> EngineResult<Self> {
        let path = workspace.join("audit.log");
        let key_path = workspace.join(".audit.key");
        let key = match std::fs::read(&key_path) {
            Ok(key) if !key.is_empty() => key,
            _ => {
                let fresh: Vec<u8> = uuid::Uuid::new_v4()
                    .as_bytes()
                    .iter()
                    .chain(uuid::Uuid::new_v4().as_bytes().iter())
                    .copied()
                    .collect();
                std::fs::write(&key_path, &fresh)?;
                fresh
            }
        };

        // Resume the chain from the last readable line.
        let mut seq = 0u64;
        let mut last_mac = GENESIS_MAC.to_string();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            for line in raw.lines() {
                match serde_json::from_str::<AuditEntry>(line) {
                    Ok(entry) => {
                        seq = entry.seq;
                        last_mac = entry.mac;
                    }
                    Err(e) => warn!("[audit] Skipping unreadable audit line: {}", e),
                }
            }
        }

        Ok(AuditLog { path, key, state: Mutex::new(ChainState { seq, last_mac }) })
    }

    fn mac_for(&self, prev_mac: &str, seq: u64, timestamp: &str, kind: &str, actor: &str, detail: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(prev_mac.as_bytes());
        mac.update(seq.to_le_bytes().as_ref());
        mac.update(timestamp.as_bytes());
        mac.update(kind.as_bytes());
        mac.update(actor.as_bytes());
        mac.update(detail.as_bytes());
        base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
    }

    /// Append one audited happening. Failures here are logged, never fatal
    /// to the calling turn.
    pub fn record(&self, kind: &str, actor: &str, detail: &str) -> EngineResult<()> {
        let mut state = self.state.lock();
        let seq = state.seq + 1;
        let timestamp = chrono::Utc::now().to_rfc3339();
        let mac = self.mac_for(&state.last_mac, seq, &timestamp, kind, actor, detail);
        let entry = AuditEntry {
            seq,
            timestamp,
            kind: kind.to_string(),
            actor: actor.to_string(),
            detail: detail.to_string(),
            prev_mac: state.last_mac.clone(),
            mac: mac.clone(),
        };
        let line = serde_json::to_string(&entry)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;
        state.seq = seq;
        state.last_mac = mac;
        Ok(())
    }

    /// Walk the chain and verify every mac. Returns the entry count, or the
    /// seq where verification first failed.
    pub fn verify(&self) -> EngineResult<u64> {
        if !self.path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let mut prev_mac = GENESIS_MAC.to_string();
        let mut count = 0u64;
        for line in raw.lines() {
            let entry: AuditEntry = serde_json::from_str(line)
                .map_err(|e| EngineError::Corruption(format!("audit line unreadable: {}", e)))?;
            if entry.prev_mac != prev_mac {
                return Err(EngineError::Corruption(format!(
                    "audit chain broken at seq {} (prev_mac mismatch)",
                    entry.seq
                )));
            }
            let expected = self.mac_for(
                &entry.prev_mac,
                entry.seq,
                &entry.timestamp,
                &entry.kind,
                &entry.actor,
                &entry.detail,
            );
            if expected != entry.mac {
                return Err(EngineError::Corruption(format!(
                    "audit chain broken at seq {} (mac mismatch)",
                    entry.seq
                )));
            }
            prev_mac = entry.mac;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_appends_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        log.record("tool_call", "coder", "read_file src/main.rs").unwrap();
        log.record("delegation", "leader", "task -> researcher").unwrap();
        log.record("escalation", "leader", "destructive tool at 0.6").unwrap();
        assert_eq!(log.verify().unwrap(), 3);
    }

    #[test]
    fn chain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = AuditLog::open(dir.path()).unwrap();
            log.record("tool_call", "coder", "one").unwrap();
        }
        let log = AuditLog::open(dir.path()).unwrap();
        log.record("tool_call", "coder", "two").unwrap();
        assert_eq!(log.verify().unwrap(), 2);
    }

    #[test]
    fn tampering_breaks_verification() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::open(dir.path()).unwrap();
        log.record("tool_call", "coder", "legit").unwrap();
        let path = dir.path().join("audit.log");
        let tampered = std::fs::read_to_string(&path).unwrap().replace("legit", "evil");
        std::fs::write(&path, tampered).unwrap();
        assert!(matches!(log.verify(), Err(EngineError::Corruption(_))));
    }
}
