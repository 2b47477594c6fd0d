//! Admission ledger: at most one admission per run identity.
//!
//! Before a run is admitted the scheduler creates
//! `<batch_dir>/claims/<target>_<task>_run<N>.claim` with `create_new`.
//! Creation is atomic, so two schedulers working on the same batch
//! directory can never both admit the same identity. Claims carry a lease;
//! a claim whose lease expired (its holder crashed) may be taken over, one
//! scheduler at a time. File I/O runs on the blocking pool.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::matrix::RunIdentity;
use crate::error::BatchError;

const CLAIMS_DIR: &str = "claims";

/// Extension of the short-lived lock held while a stale claim is replaced.
const TAKEOVER_EXT: &str = "takeover";

/// Added to every lease on top of the run timeout.
pub const DEFAULT_LEASE_GRACE: Duration = Duration::from_secs(60);

/// Contents of a claim file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    #[serde(flatten)]
    pub identity: RunIdentity,
    pub owner: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}

/// Result of trying to admit a run.
#[derive(Debug)]
pub enum Admission {
    /// The run is ours to execute.
    Claimed(AdmissionClaim),
    /// Another live scheduler holds the run.
    HeldElsewhere { owner: String },
}

/// The claims directory of one batch.
#[derive(Debug, Clone)]
pub struct RunLedger {
    claims_dir: PathBuf,
    owner: String,
    grace: Duration,
}

impl RunLedger {
    /// Opens (and creates) the ledger under `batch_dir`.
    pub async fn open(batch_dir: &Path) -> Result<Self, BatchError> {
        let claims_dir = batch_dir.join(CLAIMS_DIR);
        tokio::fs::create_dir_all(&claims_dir).await.map_err(|e| {
            BatchError::Ledger(format!("failed to create {}: {}", claims_dir.display(), e))
        })?;
        Ok(Self {
            claims_dir,
            owner: format!("scheduler-{}", Uuid::new_v4()),
            grace: DEFAULT_LEASE_GRACE,
        })
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn claims_dir(&self) -> &Path {
        &self.claims_dir
    }

    fn claim_path(&self, identity: &RunIdentity) -> PathBuf {
        self.claims_dir.join(format!(
            "{}_run{}.claim",
            identity.task_key().file_stem(),
            identity.run_number
        ))
    }

    /// Tries to claim `identity` for a run that may take up to `run_timeout`.
    pub async fn try_claim(&self, identity: &RunIdentity, run_timeout: Duration) -> Result<Admission, BatchError> {
        let ledger = self.clone();
        let identity = identity.clone();
        tokio::task::spawn_blocking(move || ledger.claim_blocking(&identity, run_timeout)).await?
    }

    fn claim_blocking(&self, identity: &RunIdentity, run_timeout: Duration) -> Result<Admission, BatchError> {
        let path = self.claim_path(identity);

        // One retry after taking over a stale claim.
        for _ in 0..2 {
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    if let Err(e) = self.write_claim(file, &path, identity, run_timeout) {
                        let _ = fs::remove_file(&path);
                        return Err(e);
                    }
                    debug!(run = %identity, owner = %self.owner, "Claimed run");
                    return Ok(Admission::Claimed(AdmissionClaim {
                        path,
                        identity: identity.clone(),
                        released: false,
                    }));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => match self.inspect_existing(&path) {
                    ExistingClaim::Live(owner) => {
                        debug!(run = %identity, holder = %owner, "Run claimed by another scheduler");
                        return Ok(Admission::HeldElsewhere { owner });
                    }
                    ExistingClaim::Missing => {}
                    ExistingClaim::Stale => {
                        if let Some(owner) = self.take_over_stale(&path, identity)? {
                            return Ok(Admission::HeldElsewhere { owner });
                        }
                    }
                },
                Err(e) => {
                    return Err(BatchError::Ledger(format!("failed to create {}: {}", path.display(), e)));
                }
            }
        }

        Ok(Admission::HeldElsewhere {
            owner: "unknown".to_string(),
        })
    }

    fn write_claim(
        &self,
        mut file: fs::File,
        path: &Path,
        identity: &RunIdentity,
        run_timeout: Duration,
    ) -> Result<(), BatchError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(run_timeout + self.grace).unwrap_or_else(|_| chrono::Duration::days(1));
        let record = ClaimRecord {
            identity: identity.clone(),
            owner: self.owner.clone(),
            pid: std::process::id(),
            acquired_at: now,
            lease_expires_at: now + lease,
        };
        let payload =
            serde_json::to_vec(&record).map_err(|e| BatchError::Ledger(format!("failed to encode claim: {}", e)))?;
        file.write_all(&payload)
            .and_then(|_| file.sync_all())
            .map_err(|e| BatchError::Ledger(format!("failed to write {}: {}", path.display(), e)))
    }

    /// Removes a stale claim while holding the identity's takeover lock, so
    /// two schedulers that both saw it expire cannot delete each other's
    /// fresh claim. Returns the holder when the claim turned out to be live.
    fn take_over_stale(&self, path: &Path, identity: &RunIdentity) -> Result<Option<String>, BatchError> {
        let lock_path = path.with_extension(TAKEOVER_EXT);
        let lock = match fs::OpenOptions::new().write(true).create_new(true).open(&lock_path) {
            Ok(lock) => lock,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if file_age(&lock_path) > self.grace {
                    // Left behind by a crash mid-takeover.
                    let _ = fs::remove_file(&lock_path);
                }
                return Ok(Some("unknown".to_string()));
            }
            Err(e) => {
                return Err(BatchError::Ledger(format!("failed to create {}: {}", lock_path.display(), e)));
            }
        };
        drop(lock);

        // Another scheduler may have replaced the claim since we inspected it.
        let outcome = match self.inspect_existing(path) {
            ExistingClaim::Live(owner) => Ok(Some(owner)),
            ExistingClaim::Missing => Ok(None),
            ExistingClaim::Stale => {
                warn!(run = %identity, path = %path.display(), "Reclaiming expired claim");
                match fs::remove_file(path) {
                    Ok(()) => Ok(None),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(BatchError::Ledger(format!(
                        "failed to remove stale claim {}: {}",
                        path.display(),
                        e
                    ))),
                }
            }
        };

        if let Err(e) = fs::remove_file(&lock_path) {
            warn!(path = %lock_path.display(), error = %e, "Failed to remove takeover lock");
        }
        outcome
    }

    fn inspect_existing(&self, path: &Path) -> ExistingClaim {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ExistingClaim::Missing,
            Err(_) => Vec::new(),
        };
        match serde_json::from_slice::<ClaimRecord>(&bytes) {
            Ok(record) if record.is_expired(Utc::now()) => ExistingClaim::Stale,
            Ok(record) => ExistingClaim::Live(record.owner),
            // Unreadable claims are either being written right now or left
            // behind by a crash mid-write; only the latter is old.
            Err(_) => {
                if file_age(path) > self.grace {
                    ExistingClaim::Stale
                } else {
                    ExistingClaim::Live("unknown".to_string())
                }
            }
        }
    }

    /// Removes every claim. Used when a batch is restarted from scratch.
    pub async fn clear(&self) -> Result<usize, BatchError> {
        let mut entries = tokio::fs::read_dir(&self.claims_dir)
            .await
            .map_err(|e| BatchError::Ledger(format!("failed to read {}: {}", self.claims_dir.display(), e)))?;
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_claim = path
                .extension()
                .is_some_and(|e| e == "claim" || e == TAKEOVER_EXT);
            if is_claim && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn file_age(path: &Path) -> Duration {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .unwrap_or_default()
}

enum ExistingClaim {
    Live(String),
    Stale,
    Missing,
}

/// An exclusive claim on one run. Released on drop.
#[derive(Debug)]
pub struct AdmissionClaim {
    path: PathBuf,
    identity: RunIdentity,
    released: bool,
}

impl AdmissionClaim {
    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the claim file without blocking the runtime.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(run = %self.identity, error = %e, "Failed to release claim");
            }
        }
    }

    fn remove(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(run = %self.identity, error = %e, "Failed to release claim");
            }
        }
    }
}

impl Drop for AdmissionClaim {
    fn drop(&mut self) {
        self.remove();
    }
}
