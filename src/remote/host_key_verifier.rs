//! Trust decisions for remote host keys.
//!
//! Known keys are kept in memory and, when a path is configured, mirrored to a JSON file so
//! they survive restarts.

use crate::error_handling::types::RemoteError;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostKeyPolicy {
    /// Only hosts whose key is already known may connect.
    Strict,
    /// Any key is trusted and recorded.
    AutoAccept,
}

impl HostKeyPolicy {
    /// Parses the configured value. Unknown values fall back to `AutoAccept` so a typo does
    /// not keep the service from starting.
    pub fn from_config(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "STRICT" => HostKeyPolicy::Strict,
            "AUTO_ACCEPT" => HostKeyPolicy::AutoAccept,
            other => {
                warn!(
                    "Unknown host key policy '{}', falling back to AUTO_ACCEPT",
                    other
                );
                HostKeyPolicy::AutoAccept
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnownHostKey {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    /// Raw key blob, base64.
    pub key: String,
    pub fingerprint: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// The key matched the recorded one.
    Trusted,
    /// First contact, the key was recorded.
    Recorded,
    /// The host presented a different key and the recorded one was replaced.
    Replaced,
}

/// OpenSSH style `SHA256:<base64>` fingerprint of a raw key blob.
pub fn fingerprint(key: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(key)))
}

pub struct HostKeyVerifier {
    policy: HostKeyPolicy,
    store_path: Option<PathBuf>,
    keys: RwLock<HashMap<String, KnownHostKey>>,
}

impl HostKeyVerifier {
    /// In-memory verifier, nothing is persisted.
    pub fn new(policy: HostKeyPolicy) -> Self {
        Self {
            policy,
            store_path: None,
            keys: RwLock::new(HashMap::new()),
        }
    }

    /// Loads known keys from `path` when it exists. The file is rewritten on every change.
    pub fn with_store(policy: HostKeyPolicy, path: PathBuf) -> Result<Self, std::io::Error> {
        let mut keys = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let entries: Vec<KnownHostKey> = serde_json::from_str(&raw)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            for entry in entries {
                keys.insert(host_id(&entry.host, entry.port), entry);
            }
            info!("Loaded {} known host keys from {}", keys.len(), path.display());
        }
        Ok(Self {
            policy,
            store_path: Some(path),
            keys: RwLock::new(keys),
        })
    }

    pub fn policy(&self) -> HostKeyPolicy {
        self.policy
    }

    pub fn verify(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key: &[u8],
    ) -> Result<HostKeyDecision, RemoteError> {
        let id = host_id(host, port);
        let presented = fingerprint(key);

        let decision = {
            let mut keys = match self.keys.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let known = keys.get(&id).map(|k| k.fingerprint.clone());
            match (known, self.policy) {
                (Some(known), _) if known == presented => return Ok(HostKeyDecision::Trusted),
                (Some(known), HostKeyPolicy::Strict) => {
                    error!(
                        "Host key for {} changed: expected {}, got {}",
                        id, known, presented
                    );
                    return Err(RemoteError::HostKeyRejected {
                        host: id,
                        reason: "host key does not match the known key".to_string(),
                    });
                }
                (None, HostKeyPolicy::Strict) => {
                    warn!("Rejecting unknown host key {} for {}", presented, id);
                    return Err(RemoteError::HostKeyRejected {
                        host: id,
                        reason: "host is not in the known hosts".to_string(),
                    });
                }
                (known, HostKeyPolicy::AutoAccept) => {
                    keys.insert(
                        id.clone(),
                        KnownHostKey {
                            host: host.to_string(),
                            port,
                            key_type: key_type.to_string(),
                            key: STANDARD.encode(key),
                            fingerprint: presented.clone(),
                            added_at: Utc::now(),
                        },
                    );
                    match known {
                        Some(old) => {
                            warn!(
                                "Host key for {} changed from {} to {}, accepting",
                                id, old, presented
                            );
                            HostKeyDecision::Replaced
                        }
                        None => {
                            info!("Recorded host key {} for {}", presented, id);
                            HostKeyDecision::Recorded
                        }
                    }
                }
            }
        };
        self.persist();
        Ok(decision)
    }

    pub fn list(&self) -> Vec<KnownHostKey> {
        let keys = match self.keys.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut list: Vec<_> = keys.values().cloned().collect();
        list.sort_by(|a, b| (&a.host, a.port).cmp(&(&b.host, b.port)));
        list
    }

    pub fn get(&self, host: &str, port: u16) -> Option<KnownHostKey> {
        let keys = match self.keys.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        keys.get(&host_id(host, port)).cloned()
    }

    /// Forgets the key of `host:port`. Returns false when nothing was recorded.
    pub fn remove(&self, host: &str, port: u16) -> bool {
        let removed = {
            let mut keys = match self.keys.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            keys.remove(&host_id(host, port)).is_some()
        };
        if removed {
            info!("Removed known host key for {}", host_id(host, port));
            self.persist();
        }
        removed
    }

    fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let entries = self.list();
        let result = serde_json::to_string_pretty(&entries)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            .and_then(|json| {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, json)
            });
        if let Err(e) = result {
            error!("Failed to write known hosts to {}: {}", path.display(), e);
        }
    }
}

fn host_id(host: &str, port: u16) -> String {
    format!("{}:{}", host.to_ascii_lowercase(), port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const KEY_A: &[u8] = b"ssh-ed25519 key material A";
    const KEY_B: &[u8] = b"ssh-ed25519 key material B";

    #[test]
    fn test_policy_parsing_falls_back_to_auto_accept() {
        assert_eq!(HostKeyPolicy::from_config("STRICT"), HostKeyPolicy::Strict);
        assert_eq!(HostKeyPolicy::from_config("strict"), HostKeyPolicy::Strict);
        assert_eq!(
            HostKeyPolicy::from_config("auto-accept"),
            HostKeyPolicy::AutoAccept
        );
        assert_eq!(
            HostKeyPolicy::from_config("ASK_EVERY_TIME"),
            HostKeyPolicy::AutoAccept
        );
    }

    #[test]
    fn test_strict_rejects_unknown_host() {
        let verifier = HostKeyVerifier::new(HostKeyPolicy::Strict);
        let result = verifier.verify("db01", 22, "ssh-ed25519", KEY_A);
        assert!(matches!(
            result,
            Err(RemoteError::HostKeyRejected { host, .. }) if host == "db01:22"
        ));
        assert!(verifier.list().is_empty());
    }

    #[test]
    fn test_auto_accept_records_then_trusts() {
        let verifier = HostKeyVerifier::new(HostKeyPolicy::AutoAccept);
        assert_eq!(
            verifier.verify("db01", 22, "ssh-ed25519", KEY_A).unwrap(),
            HostKeyDecision::Recorded
        );
        assert_eq!(
            verifier.verify("DB01", 22, "ssh-ed25519", KEY_A).unwrap(),
            HostKeyDecision::Trusted
        );
        assert_eq!(
            verifier.verify("db01", 22, "ssh-ed25519", KEY_B).unwrap(),
            HostKeyDecision::Replaced
        );
        let known = verifier.get("db01", 22).unwrap();
        assert_eq!(known.fingerprint, fingerprint(KEY_B));
    }

    #[test]
    fn test_strict_trusts_persisted_key_and_rejects_changed_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts.json");

        let learning =
            HostKeyVerifier::with_store(HostKeyPolicy::AutoAccept, path.clone()).unwrap();
        learning.verify("db01", 2222, "ssh-rsa", KEY_A).unwrap();
        assert!(path.exists());

        let strict = HostKeyVerifier::with_store(HostKeyPolicy::Strict, path).unwrap();
        assert_eq!(
            strict.verify("db01", 2222, "ssh-rsa", KEY_A).unwrap(),
            HostKeyDecision::Trusted
        );
        assert!(strict.verify("db01", 2222, "ssh-rsa", KEY_B).is_err());
        assert!(strict.verify("db01", 22, "ssh-rsa", KEY_A).is_err());
    }

    #[test]
    fn test_remove_forgets_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts").join("known.json");
        let verifier =
            HostKeyVerifier::with_store(HostKeyPolicy::AutoAccept, path.clone()).unwrap();
        verifier.verify("web01", 22, "ssh-ed25519", KEY_A).unwrap();

        assert!(verifier.remove("web01", 22));
        assert!(!verifier.remove("web01", 22));

        let reloaded = HostKeyVerifier::with_store(HostKeyPolicy::Strict, path).unwrap();
        assert!(reloaded.list().is_empty());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(KEY_A);
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
    }
}
