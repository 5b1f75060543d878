//! Durable record of deployment outcomes, keyed by `(network, intent key)`.
//!
//! Each network has one JSON document `<dir>/<network>.json`. Writes happen under an exclusive
//! `fs2` lock on `<dir>/<network>.lock` and replace the document atomically (temp file + rename).
//! A deployment in flight additionally holds [`DeploymentLedger::lock_intent`], which excludes
//! other tasks and other processes sharing the directory from the same intent.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use alloy_core::primitives::{Address, B256};
use anyhow::Context;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{
    DeployError, intent::IntentKey, network::check_network_name, verify::VerificationStatus,
};

/// Outcome of a deployment attempt.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Confirmed,
    Failed,
}

/// What the ledger knows about one intent on one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub intent_key: IntentKey,
    pub network: String,
    pub contract_name: String,
    /// Derived contract address. Predicted while pending.
    pub address: Address,
    pub deployer: Address,
    pub nonce: u64,
    pub transaction_hash: Option<B256>,
    pub block_number: Option<u64>,
    pub status: DeploymentStatus,
    /// Number of broadcast attempts made for this intent.
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerificationStatus>,
    /// Unix timestamp of the last write.
    pub updated_at: i64,
}

impl DeploymentRecord {
    pub fn is_confirmed(&self) -> bool {
        self.status == DeploymentStatus::Confirmed
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerDocument {
    records: BTreeMap<IntentKey, DeploymentRecord>,
}

type LockKey = (String, IntentKey);
type IntentLocks = Arc<Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>>;

/// File-backed deployment ledger.
#[derive(Debug)]
pub struct DeploymentLedger {
    dir: PathBuf,
    intent_locks: IntentLocks,
}

/// Exclusive claim on one intent, across tasks and processes. Released on drop.
pub struct IntentGuard {
    file: Option<FileLock>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: IntentLocks,
    key: LockKey,
}

impl Drop for IntentGuard {
    fn drop(&mut self) {
        self.file.take();
        self.guard.take();

        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Only the map still refers to the mutex: nobody holds or waits for it.
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

impl DeploymentLedger {
    /// Open (and create if needed) the ledger directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, DeployError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create ledger directory {}", dir.display()))?;
        tracing::debug!(dir = %dir.display(), "Ledger opened");
        Ok(Self {
            dir,
            intent_locks: Arc::default(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Serialize all work on `(network, key)`.
    ///
    /// Tasks of this process queue on an in-memory mutex, other processes on an exclusive lock of
    /// `<dir>/<network>.<key>.lock`. The executor holds the guard from the ledger lookup until the
    /// outcome is recorded, so two concurrent deploys of the same intent cannot both broadcast.
    pub async fn lock_intent(
        &self,
        network: &str,
        key: &IntentKey,
    ) -> Result<IntentGuard, DeployError> {
        check_network_name(network)?;
        let lock_key = (network.to_string(), key.clone());
        let mutex = {
            let mut locks = self
                .intent_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(lock_key.clone()).or_default().clone()
        };

        let mut guard = IntentGuard {
            file: None,
            guard: Some(mutex.lock_owned().await),
            locks: self.intent_locks.clone(),
            key: lock_key,
        };

        let path = self.dir.join(format!("{network}.{key}.lock"));
        let file = open_lock_file(&path)?;
        let file = if file.try_lock_exclusive().is_ok() {
            file
        } else {
            tracing::info!(network, intent_key = %key, "Intent locked by another process, waiting...");
            tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file))
                .await
                .context("Intent lock task panicked")?
                .with_context(|| format!("Failed to lock {}", path.display()))?
        };
        guard.file = Some(FileLock(file));

        Ok(guard)
    }

    /// Fetch the record of `key` on `network`.
    pub fn get(&self, network: &str, key: &IntentKey) -> Result<Option<DeploymentRecord>, DeployError> {
        let _lock = self.file_lock(network, false)?;
        Ok(self.read_document(network)?.records.remove(key))
    }

    /// All records of `network`, ordered by intent key.
    pub fn list(&self, network: &str) -> Result<Vec<DeploymentRecord>, DeployError> {
        let _lock = self.file_lock(network, false)?;
        Ok(self.read_document(network)?.records.into_values().collect())
    }

    /// Store `record`, unless a confirmed record already exists for its key.
    ///
    /// Writing the identical confirmed record again is a no-op. Anything else over a confirmed
    /// record fails with [`DeployError::LedgerConflict`] and leaves the stored record untouched.
    pub fn put(&self, mut record: DeploymentRecord) -> Result<DeploymentRecord, DeployError> {
        let network = record.network.clone();
        let _lock = self.file_lock(&network, true)?;
        let mut document = self.read_document(&network)?;

        if let Some(existing) = document.records.get(&record.intent_key) {
            if existing.is_confirmed() {
                if record.is_confirmed() && record.address == existing.address {
                    return Ok(existing.clone());
                }
                tracing::error!(
                    network = %network,
                    intent_key = %record.intent_key,
                    existing = %existing.address,
                    attempted = %record.address,
                    "Refusing to overwrite confirmed deployment"
                );
                return Err(DeployError::LedgerConflict {
                    network,
                    intent_key: record.intent_key.to_string(),
                    existing: existing.address,
                    attempted: record.address,
                });
            }
        }

        record.updated_at = chrono::Utc::now().timestamp();
        document
            .records
            .insert(record.intent_key.clone(), record.clone());
        self.write_document(&network, &document)?;

        tracing::debug!(
            network = %network,
            intent_key = %record.intent_key,
            status = %record.status,
            "Ledger record written"
        );
        Ok(record)
    }

    /// Attach the verification outcome to a confirmed record.
    pub fn record_verification(
        &self,
        network: &str,
        key: &IntentKey,
        status: VerificationStatus,
    ) -> Result<DeploymentRecord, DeployError> {
        let _lock = self.file_lock(network, true)?;
        let mut document = self.read_document(network)?;

        let record = document
            .records
            .get_mut(key)
            .filter(|record| record.is_confirmed())
            .ok_or_else(|| DeployError::NotConfirmed {
                intent_key: key.to_string(),
            })?;
        record.verification = Some(status);
        record.updated_at = chrono::Utc::now().timestamp();
        let record = record.clone();

        self.write_document(network, &document)?;
        Ok(record)
    }

    fn document_path(&self, network: &str) -> PathBuf {
        self.dir.join(format!("{network}.json"))
    }

    fn file_lock(&self, network: &str, exclusive: bool) -> Result<FileLock, DeployError> {
        check_network_name(network)?;
        let path = self.dir.join(format!("{network}.lock"));
        let file = open_lock_file(&path)?;

        if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        }
        .with_context(|| format!("Failed to lock {}", path.display()))?;

        Ok(FileLock(file))
    }

    fn read_document(&self, network: &str) -> Result<LedgerDocument, DeployError> {
        let path = self.document_path(network);
        if !path.exists() {
            return Ok(LedgerDocument::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read ledger {}", path.display()))?;
        let document = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse ledger {}", path.display()))?;
        Ok(document)
    }

    fn write_document(&self, network: &str, document: &LedgerDocument) -> Result<(), DeployError> {
        let path = self.document_path(network);
        let tmp = path.with_extension("json.tmp");

        let json =
            serde_json::to_string_pretty(document).context("Failed to serialize ledger")?;
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write ledger {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace ledger {}", path.display()))?;
        Ok(())
    }
}

fn open_lock_file(path: &Path) -> Result<File, DeployError> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .with_context(|| format!("Failed to open ledger lock {}", path.display()))?;
    Ok(file)
}

/// Held file lock, released on drop.
struct FileLock(File);

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.0) {
            tracing::warn!(error = %e, "Failed to release ledger lock");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempdir::TempDir;

    pub(crate) fn record(key: &str, address: Address, status: DeploymentStatus) -> DeploymentRecord {
        DeploymentRecord {
            intent_key: IntentKey::from(key.to_string()),
            network: "opSepolia".to_string(),
            contract_name: "HermesProxyFactory".to_string(),
            address,
            deployer: Address::with_last_byte(0xaa),
            nonce: 0,
            transaction_hash: Some(B256::with_last_byte(1)),
            block_number: (status == DeploymentStatus::Confirmed).then_some(100),
            status,
            attempt: 1,
            failure: None,
            verification: None,
            updated_at: 0,
        }
    }

    #[test]
    fn test_get_missing() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let ledger = DeploymentLedger::open(dir.path()).unwrap();
        let key = IntentKey::from("k".to_string());
        assert!(ledger.get("opSepolia", &key).unwrap().is_none());
        assert!(ledger.list("opSepolia").unwrap().is_empty());
    }

    #[test]
    fn test_pending_to_confirmed() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let ledger = DeploymentLedger::open(dir.path()).unwrap();
        let address = Address::with_last_byte(1);

        ledger
            .put(record("k", address, DeploymentStatus::Pending))
            .unwrap();
        ledger
            .put(record("k", address, DeploymentStatus::Confirmed))
            .unwrap();

        let stored = ledger
            .get("opSepolia", &IntentKey::from("k".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, DeploymentStatus::Confirmed);
        assert_eq!(stored.block_number, Some(100));
        assert!(stored.updated_at > 0);
    }

    #[test]
    fn test_conflict_leaves_confirmed_record_untouched() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let ledger = DeploymentLedger::open(dir.path()).unwrap();
        let original = Address::with_last_byte(1);
        let other = Address::with_last_byte(2);

        ledger
            .put(record("k", original, DeploymentStatus::Confirmed))
            .unwrap();

        let err = ledger
            .put(record("k", other, DeploymentStatus::Confirmed))
            .unwrap_err();
        assert!(matches!(
            err,
            DeployError::LedgerConflict { existing, attempted, .. }
                if existing == original && attempted == other
        ));

        // Confirmed never goes back either.
        let err = ledger
            .put(record("k", original, DeploymentStatus::Pending))
            .unwrap_err();
        assert!(matches!(err, DeployError::LedgerConflict { .. }));

        let stored = ledger
            .get("opSepolia", &IntentKey::from("k".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(stored.address, original);
        assert_eq!(stored.status, DeploymentStatus::Confirmed);
    }

    #[test]
    fn test_same_confirmed_record_is_idempotent() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let ledger = DeploymentLedger::open(dir.path()).unwrap();
        let address = Address::with_last_byte(1);

        let first = ledger
            .put(record("k", address, DeploymentStatus::Confirmed))
            .unwrap();
        let second = ledger
            .put(record("k", address, DeploymentStatus::Confirmed))
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let address = Address::with_last_byte(3);
        {
            let ledger = DeploymentLedger::open(dir.path()).unwrap();
            ledger
                .put(record("k", address, DeploymentStatus::Confirmed))
                .unwrap();
        }

        let reopened = DeploymentLedger::open(dir.path()).unwrap();
        let stored = reopened
            .get("opSepolia", &IntentKey::from("k".to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(stored.address, address);
        assert!(dir.path().join("opSepolia.json").exists());
    }

    #[test]
    fn test_record_verification_requires_confirmed() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let ledger = DeploymentLedger::open(dir.path()).unwrap();
        let key = IntentKey::from("k".to_string());

        ledger
            .put(record("k", Address::with_last_byte(1), DeploymentStatus::Pending))
            .unwrap();
        assert!(matches!(
            ledger.record_verification("opSepolia", &key, VerificationStatus::Verified),
            Err(DeployError::NotConfirmed { .. })
        ));

        ledger
            .put(record("k", Address::with_last_byte(1), DeploymentStatus::Confirmed))
            .unwrap();
        let updated = ledger
            .record_verification("opSepolia", &key, VerificationStatus::AlreadyVerified)
            .unwrap();
        assert_eq!(updated.verification, Some(VerificationStatus::AlreadyVerified));
    }

    #[tokio::test]
    async fn test_intent_lock_serializes_same_key() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let ledger = Arc::new(DeploymentLedger::open(dir.path()).unwrap());
        let key = IntentKey::from("k".to_string());

        let guard = ledger.lock_intent("opSepolia", &key).await.unwrap();

        // Another key is independent.
        let other = IntentKey::from("other".to_string());
        let _other_guard = ledger.lock_intent("opSepolia", &other).await.unwrap();

        let contender = {
            let ledger = ledger.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = ledger.lock_intent("opSepolia", &key).await.unwrap();
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_intent_lock_excludes_other_ledger_on_same_dir() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let first = DeploymentLedger::open(dir.path()).unwrap();
        let second = Arc::new(DeploymentLedger::open(dir.path()).unwrap());
        let key = IntentKey::from("k".to_string());

        let guard = first.lock_intent("opSepolia", &key).await.unwrap();

        let contender = {
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = second.lock_intent("opSepolia", &key).await.unwrap();
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(std::time::Duration::from_secs(5), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_released_intent_locks_are_pruned() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let ledger = DeploymentLedger::open(dir.path()).unwrap();

        for i in 0..10 {
            let key = IntentKey::from(format!("k{i}"));
            let _guard = ledger.lock_intent("opSepolia", &key).await.unwrap();
        }
        assert!(ledger.intent_locks.lock().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_path_like_network() {
        let dir = TempDir::new("quay-ledger").unwrap();
        let ledger = DeploymentLedger::open(dir.path().join("ledger")).unwrap();

        let err = ledger.list("../outside").unwrap_err();
        assert!(matches!(err, DeployError::Config(_)));

        let mut escaping = record("k", Address::with_last_byte(1), DeploymentStatus::Pending);
        escaping.network = "../outside".to_string();
        assert!(ledger.put(escaping).is_err());
        assert!(!dir.path().join("outside.json").exists());
    }
}
