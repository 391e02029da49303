//! Audit Chain: an append-only, hash-chained log of every decision the
//! engine makes. Each entry's hash covers its own fields plus the previous
//! entry's hash, so tampering with or removing any entry breaks the chain
//! from that point forward. Writes are serialized through a single lock and
//! fsynced before the call returns: an entry the caller saw succeed is on
//! disk, not just buffered.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use chrono::Utc;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::AuditConfig;
use crate::error::{Error, Result};

const PBKDF2_ROUNDS: u32 = 100_000;
const DERIVED_KEY_LEN: usize = 32;

/// The closed set of audit-entry kinds. Anything the orchestrator might
/// want to record maps onto one of these; there is no open-ended "other".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// The first entry in a log file; never produced by the pipeline
    /// itself, only by [`AuditChain::open`] and rotation.
    Genesis,
    Classified,
    ActionApplied,
    ProfileLoaded,
    ConfigChanged,
    SecurityViolation,
    SystemStart,
    SystemStop,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Genesis => "genesis",
            Self::Classified => "classified",
            Self::ActionApplied => "action_applied",
            Self::ProfileLoaded => "profile_loaded",
            Self::ConfigChanged => "config_changed",
            Self::SecurityViolation => "security_violation",
            Self::SystemStart => "system_start",
            Self::SystemStop => "system_stop",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: String,
    pub event_type: EventType,
    pub message_id: String,
    pub profile_id: String,
    pub action: String,
    pub confidence: f64,
    pub prev_hash: String,
    pub hash: String,
    pub signature: Option<String>,
    pub metadata: serde_json::Value,
}

/// Canonical JSON: `serde_json` maps JSON objects onto `BTreeMap` unless
/// the `preserve_order` feature is enabled (it isn't here), so keys come
/// out sorted at every nesting level and `to_string` emits no incidental
/// whitespace. That's the whole of "canonical" for our purposes.
fn canonical_json(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

fn compute_hash(
    id: &str,
    timestamp: &str,
    event_type: EventType,
    message_id: &str,
    profile_id: &str,
    action: &str,
    confidence: f64,
    prev_hash: &str,
    metadata: &serde_json::Value,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(message_id.as_bytes());
    hasher.update(profile_id.as_bytes());
    hasher.update(action.as_bytes());
    hasher.update(format!("{confidence:.6}").as_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_json(metadata).as_bytes());
    hex::encode(hasher.finalize())
}

fn derive_signing_key(secret: &str) -> [u8; DERIVED_KEY_LEN] {
    let mut key = [0u8; DERIVED_KEY_LEN];
    pbkdf2_hmac::<Sha256>(secret.as_bytes(), b"mailsentinel-audit-chain", PBKDF2_ROUNDS, &mut key);
    key
}

fn sign(key: &[u8; DERIVED_KEY_LEN], hash: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(hash.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

struct ChainState {
    current_path: PathBuf,
    current_bytes: u64,
    opened_at: SystemTime,
    /// The hash the next entry chains from.
    last_hash: String,
}

pub struct AuditChain {
    directory: PathBuf,
    max_file_bytes: u64,
    max_file_age_secs: u64,
    signing_key: Option<[u8; DERIVED_KEY_LEN]>,
    state: Mutex<ChainState>,
}

impl AuditChain {
    /// Open (or create) the chain rooted at `config.directory`. If prior
    /// log files exist, the most recent one's last line determines the
    /// hash the next entry chains from. An empty directory starts fresh: a
    /// genesis entry (`prev_hash = ""`) is written immediately, and the
    /// first real entry chains from it.
    pub fn open(config: &AuditConfig) -> Result<AuditChain> {
        std::fs::create_dir_all(&config.directory)?;
        let directory = PathBuf::from(&config.directory);

        let mut files = list_log_files(&directory)?;
        files.sort();

        let signing_key = config
            .secret_env_var
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .map(|secret| derive_signing_key(&secret));

        let chain = match files.last() {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                let last_hash = contents
                    .lines()
                    .last()
                    .and_then(|line| serde_json::from_str::<AuditEntry>(line).ok())
                    .map(|entry| entry.hash)
                    .unwrap_or_default();
                AuditChain {
                    directory,
                    max_file_bytes: config.max_file_bytes,
                    max_file_age_secs: config.max_file_age_secs,
                    signing_key,
                    state: Mutex::new(ChainState {
                        current_path: path.clone(),
                        current_bytes: contents.len() as u64,
                        opened_at: SystemTime::now(),
                        last_hash,
                    }),
                }
            }
            None => {
                let chain = AuditChain {
                    directory: directory.clone(),
                    max_file_bytes: config.max_file_bytes,
                    max_file_age_secs: config.max_file_age_secs,
                    signing_key,
                    state: Mutex::new(ChainState {
                        current_path: next_log_path(&directory),
                        current_bytes: 0,
                        opened_at: SystemTime::now(),
                        last_hash: String::new(),
                    }),
                };
                let mut state = chain.state.lock().unwrap();
                let genesis = chain.write_entry(&mut state, EventType::Genesis, "", "", "", 0.0, "", serde_json::json!({}))?;
                state.last_hash = genesis.hash;
                drop(state);
                chain
            }
        };

        Ok(chain)
    }

    /// Append one entry. Serialized through an internal lock; the write is
    /// fsynced before this returns. `event_type` must not be
    /// [`EventType::Genesis`]; genesis entries are only ever produced
    /// internally by [`Self::open`] and rotation.
    pub fn append(
        &self,
        event_type: EventType,
        message_id: &str,
        profile_id: &str,
        action: &str,
        confidence: f64,
        metadata: serde_json::Value,
    ) -> Result<AuditEntry> {
        let mut state = self.state.lock().unwrap();

        if self.should_rotate(&state) {
            self.rotate(&mut state)?;
        }

        let prev_hash = state.last_hash.clone();
        let entry = self.write_entry(&mut state, event_type, message_id, profile_id, action, confidence, &prev_hash, metadata)?;
        state.last_hash = entry.hash.clone();
        Ok(entry)
    }

    /// Start a new log file, writing its leading genesis entry. Unlike the
    /// very first genesis of a chain, a rotation's genesis chains from the
    /// old file's final hash (it doubles as the "first real entry" the
    /// rotation rule describes) and cites the old file in its metadata, so
    /// the hash chain stays unbroken across the file boundary.
    fn rotate(&self, state: &mut ChainState) -> Result<()> {
        let old_path = state.current_path.clone();
        let old_last_hash = state.last_hash.clone();

        state.current_path = next_log_path(&self.directory);
        state.current_bytes = 0;
        state.opened_at = SystemTime::now();

        let metadata = serde_json::json!({
            "rotated_from": old_path.to_string_lossy(),
            "rotated_from_final_hash": old_last_hash,
        });
        let genesis = self.write_entry(state, EventType::Genesis, "", "", "", 0.0, &old_last_hash, metadata)?;
        state.last_hash = genesis.hash;
        Ok(())
    }

    /// Compute, sign, serialize, and fsync one entry. Does not touch
    /// `state.last_hash`; callers decide how the entry fits into the
    /// running chain.
    #[allow(clippy::too_many_arguments)]
    fn write_entry(
        &self,
        state: &mut ChainState,
        event_type: EventType,
        message_id: &str,
        profile_id: &str,
        action: &str,
        confidence: f64,
        prev_hash: &str,
        metadata: serde_json::Value,
    ) -> Result<AuditEntry> {
        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
        let hash = compute_hash(&id, &timestamp, event_type, message_id, profile_id, action, confidence, prev_hash, &metadata);
        let signature = self.signing_key.as_ref().map(|key| sign(key, &hash));

        let entry = AuditEntry {
            id,
            timestamp,
            event_type,
            message_id: message_id.to_string(),
            profile_id: profile_id.to_string(),
            action: action.to_string(),
            confidence,
            prev_hash: prev_hash.to_string(),
            hash: hash.clone(),
            signature,
            metadata,
        };

        let line = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&state.current_path)?;
        writeln!(file, "{line}")?;
        file.sync_all()?;
        state.current_bytes += line.len() as u64 + 1;

        Ok(entry)
    }

    fn should_rotate(&self, state: &ChainState) -> bool {
        if state.current_bytes >= self.max_file_bytes {
            return true;
        }
        state
            .opened_at
            .elapsed()
            .map(|age| age.as_secs() >= self.max_file_age_secs)
            .unwrap_or(false)
    }

    /// Verify hash-chain integrity (and, if a signing key is configured,
    /// HMAC signatures) over a contiguous slice of entries in order.
    /// `expected_prev_hash` is the hash the first entry in `entries` should
    /// chain from (the caller's responsibility to supply correctly for a
    /// partial range; pass `""` to verify a range starting at a genesis
    /// entry).
    pub fn verify(&self, entries: &[AuditEntry], expected_prev_hash: &str) -> Result<()> {
        let mut expected_prev = expected_prev_hash.to_string();
        for (index, entry) in entries.iter().enumerate() {
            if entry.prev_hash != expected_prev {
                return Err(Error::integrity(
                    index as u64,
                    format!("prev_hash mismatch: expected {expected_prev}, got {}", entry.prev_hash),
                ));
            }

            let recomputed = compute_hash(
                &entry.id,
                &entry.timestamp,
                entry.event_type,
                &entry.message_id,
                &entry.profile_id,
                &entry.action,
                entry.confidence,
                &entry.prev_hash,
                &entry.metadata,
            );
            if recomputed != entry.hash {
                return Err(Error::integrity(index as u64, "hash does not match entry contents"));
            }

            if let Some(key) = &self.signing_key {
                let expected_signature = sign(key, &entry.hash);
                if entry.signature.as_deref() != Some(expected_signature.as_str()) {
                    return Err(Error::integrity(index as u64, "signature does not match"));
                }
            }

            expected_prev = entry.hash.clone();
        }
        Ok(())
    }
}

fn list_log_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            files.push(path);
        }
    }
    Ok(files)
}

fn next_log_path(directory: &Path) -> PathBuf {
    let timestamp = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    directory.join(format!("audit-{timestamp}.jsonl"))
}

/// A rotated-out file summary, enough to decide retention eligibility
/// without this module owning deletion I/O.
#[derive(Debug, Clone)]
pub struct LogFileSummary {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub age_secs: u64,
}

/// Pure retention-eligibility check: which files exceed `max_age` or whose
/// removal (oldest-first) would bring total size under `max_total_bytes`.
/// Actually deleting them is the caller's job.
pub fn retention_candidates(files: &[LogFileSummary], max_age_secs: u64, max_total_bytes: u64) -> Vec<PathBuf> {
    let mut by_age_desc: Vec<&LogFileSummary> = files.iter().collect();
    by_age_desc.sort_by(|a, b| b.age_secs.cmp(&a.age_secs));

    let mut candidates = BTreeMap::new();
    let mut total: u64 = files.iter().map(|f| f.size_bytes).sum();

    for file in &by_age_desc {
        if file.age_secs > max_age_secs {
            candidates.insert(file.path.clone(), ());
        }
    }

    for file in by_age_desc {
        if total <= max_total_bytes {
            break;
        }
        if candidates.contains_key(&file.path) {
            total -= file.size_bytes;
            continue;
        }
        candidates.insert(file.path.clone(), ());
        total -= file.size_bytes;
    }

    candidates.into_keys().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> AuditConfig {
        AuditConfig {
            directory: dir.to_string_lossy().to_string(),
            max_file_bytes: 1024 * 1024,
            max_file_age_secs: 7 * 24 * 3600,
            integrity_check_on_write: true,
            secret_env_var: None,
        }
    }

    #[test]
    fn opening_a_fresh_directory_writes_a_genesis_entry_with_empty_prev_hash() {
        let dir = tempfile::tempdir().unwrap();
        let chain = AuditChain::open(&config(dir.path())).unwrap();
        let state = chain.state.lock().unwrap();
        let contents = std::fs::read_to_string(&state.current_path).unwrap();
        drop(state);
        let genesis: AuditEntry = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(genesis.event_type, EventType::Genesis);
        assert_eq!(genesis.prev_hash, "");
    }

    #[test]
    fn first_real_entry_chains_from_genesis_hash() {
        let dir = tempfile::tempdir().unwrap();
        let chain = AuditChain::open(&config(dir.path())).unwrap();
        let genesis_hash = chain.state.lock().unwrap().last_hash.clone();
        let entry = chain
            .append(EventType::ActionApplied, "m1", "spam", "archive", 0.9, serde_json::json!({}))
            .unwrap();
        assert_eq!(entry.prev_hash, genesis_hash);
    }

    #[test]
    fn second_entry_chains_from_first_hash() {
        let dir = tempfile::tempdir().unwrap();
        let chain = AuditChain::open(&config(dir.path())).unwrap();
        let first = chain
            .append(EventType::ActionApplied, "m1", "spam", "archive", 0.9, serde_json::json!({}))
            .unwrap();
        let second = chain
            .append(EventType::ActionApplied, "m2", "spam", "none", 0.1, serde_json::json!({}))
            .unwrap();
        assert_eq!(second.prev_hash, first.hash);
    }

    #[test]
    fn verify_accepts_an_untampered_chain() {
        let dir = tempfile::tempdir().unwrap();
        let chain = AuditChain::open(&config(dir.path())).unwrap();
        let genesis_hash = chain.state.lock().unwrap().last_hash.clone();
        let mut entries = Vec::new();
        for i in 0..3 {
            entries.push(
                chain
                    .append(EventType::Classified, &format!("m{i}"), "spam", "none", 0.1, serde_json::json!({}))
                    .unwrap(),
            );
        }
        assert!(chain.verify(&entries, &genesis_hash).is_ok());
    }

    #[test]
    fn verify_detects_tampered_entry() {
        let dir = tempfile::tempdir().unwrap();
        let chain = AuditChain::open(&config(dir.path())).unwrap();
        let genesis_hash = chain.state.lock().unwrap().last_hash.clone();
        let mut entries = vec![chain
            .append(EventType::ActionApplied, "m1", "spam", "archive", 0.9, serde_json::json!({}))
            .unwrap()];
        entries[0].action = "star".to_string();
        assert!(chain.verify(&entries, &genesis_hash).is_err());
    }

    #[test]
    fn reopening_an_existing_chain_continues_from_last_hash() {
        let dir = tempfile::tempdir().unwrap();
        let first_chain = AuditChain::open(&config(dir.path())).unwrap();
        let entry = first_chain
            .append(EventType::ActionApplied, "m1", "spam", "archive", 0.9, serde_json::json!({}))
            .unwrap();
        drop(first_chain);

        let reopened = AuditChain::open(&config(dir.path())).unwrap();
        let next = reopened
            .append(EventType::ActionApplied, "m2", "spam", "none", 0.1, serde_json::json!({}))
            .unwrap();
        assert_eq!(next.prev_hash, entry.hash);
    }

    #[test]
    fn rotation_genesis_chains_from_old_files_final_hash() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_file_bytes = 1;
        let chain = AuditChain::open(&cfg).unwrap();
        let last_in_old_file = chain
            .append(EventType::ActionApplied, "m1", "spam", "archive", 0.9, serde_json::json!({}))
            .unwrap();
        // This append triggers rotation: a genesis entry chaining from
        // `last_in_old_file.hash` lands in the new file before it.
        let after_rotation = chain
            .append(EventType::ActionApplied, "m2", "spam", "none", 0.1, serde_json::json!({}))
            .unwrap();

        let new_path = chain.state.lock().unwrap().current_path.clone();
        let contents = std::fs::read_to_string(&new_path).unwrap();
        let rotation_genesis: AuditEntry = serde_json::from_str(contents.lines().next().unwrap()).unwrap();

        assert_eq!(rotation_genesis.event_type, EventType::Genesis);
        assert_eq!(rotation_genesis.prev_hash, last_in_old_file.hash);
        assert_eq!(after_rotation.prev_hash, rotation_genesis.hash);
    }

    #[test]
    fn retention_flags_files_older_than_max_age() {
        let files = vec![
            LogFileSummary { path: PathBuf::from("a.jsonl"), size_bytes: 10, age_secs: 100 },
            LogFileSummary { path: PathBuf::from("b.jsonl"), size_bytes: 10, age_secs: 1 },
        ];
        let candidates = retention_candidates(&files, 50, u64::MAX);
        assert_eq!(candidates, vec![PathBuf::from("a.jsonl")]);
    }

    #[test]
    fn retention_trims_oldest_first_to_hit_size_budget() {
        let files = vec![
            LogFileSummary { path: PathBuf::from("old.jsonl"), size_bytes: 50, age_secs: 100 },
            LogFileSummary { path: PathBuf::from("mid.jsonl"), size_bytes: 50, age_secs: 50 },
            LogFileSummary { path: PathBuf::from("new.jsonl"), size_bytes: 50, age_secs: 1 },
        ];
        let candidates = retention_candidates(&files, u64::MAX, 80);
        assert!(candidates.contains(&PathBuf::from("old.jsonl")));
        assert!(!candidates.contains(&PathBuf::from("new.jsonl")));
    }
}
