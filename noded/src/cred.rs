//! Credential cache.
//!
//! Verifies launch credentials and remembers, per job, whether the node has
//! seen it, revoked it, or started its epilog. The records survive restarts
//! through the credential state file in the spool directory.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use noded_common::hostlist::{self, HostListError};
use noded_common::{JobId, LaunchCredential, StepId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredError {
    #[error("credential signature is invalid")]
    InvalidSignature,
    #[error("credential expired at {0}")]
    Expired(DateTime<Utc>),
    #[error("malformed host set: {0}")]
    MalformedHostSet(String),
    #[error("credential does not name this host")]
    NotForThisHost,
    #[error("credential does not match the request ({0})")]
    Mismatch(&'static str),
    #[error("credential for job {0} has been revoked")]
    Revoked(JobId),
    #[error("job {0} is already expiring")]
    AlreadyExpiring(JobId),
    #[error("corrupt credential state: {0}")]
    Corrupt(String),
}

impl From<HostListError> for CredError {
    fn from(err: HostListError) -> Self {
        CredError::MalformedHostSet(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredState {
    Active,
    ExpirationStarted,
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub job_id: JobId,
    pub state: CredState,
    pub expiry_time: DateTime<Utc>,
    pub launch_count: u64,
    /// Set once `begin_expiration` has succeeded, whatever the state.
    #[serde(default)]
    pub expiration_begun: bool,
}

/// Fields of a credential that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCredential {
    pub job_id: JobId,
    pub step_id: StepId,
    pub uid: u32,
    pub expires_at: DateTime<Utc>,
}

/// What the caller expects a credential to authorize.
#[derive(Debug, Clone, Copy)]
pub struct Expected<'a> {
    pub job_id: JobId,
    pub step_id: StepId,
    pub uid: u32,
    pub node_name: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    /// No record existed before this insertion.
    pub first_sight: bool,
}

pub struct CredentialCache {
    key: RwLock<Vec<u8>>,
    records: Mutex<HashMap<JobId, CredentialRecord>>,
    state_path: Option<PathBuf>,
    grace: Duration,
}

impl CredentialCache {
    pub fn new(key: impl Into<Vec<u8>>, state_path: Option<PathBuf>, grace: Duration) -> Self {
        Self {
            key: RwLock::new(key.into()),
            records: Mutex::new(HashMap::new()),
            state_path,
            grace,
        }
    }

    /// Build a cache and restore records from the state file. Unreadable
    /// state is logged and treated as empty.
    pub fn restore(key: impl Into<Vec<u8>>, state_path: PathBuf, grace: Duration) -> Self {
        let cache = Self::new(key, Some(state_path.clone()), grace);
        match fs::read(&state_path) {
            Ok(bytes) => match unpack(&bytes) {
                Ok(records) => {
                    debug!(count = records.len(), "restored credential state");
                    let mut guard = cache.lock();
                    for record in records {
                        guard.insert(record.job_id, record);
                    }
                }
                Err(err) => warn!(path = %state_path.display(), %err, "ignoring credential state"),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %state_path.display(), %err, "cannot read credential state"),
        }
        cache
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, CredentialRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap the verification key. Records are kept.
    pub fn rotate_key(&self, key: impl Into<Vec<u8>>) {
        *self.key.write().unwrap_or_else(PoisonError::into_inner) = key.into();
    }

    pub fn verify(
        &self,
        cred: &LaunchCredential,
        expected: Expected<'_>,
    ) -> Result<VerifiedCredential, CredError> {
        {
            let key = self.key.read().unwrap_or_else(PoisonError::into_inner);
            if !cred.signature_matches(&key) {
                return Err(CredError::InvalidSignature);
            }
        }
        if cred.expires_at <= Utc::now() {
            return Err(CredError::Expired(cred.expires_at));
        }
        if !hostlist::contains(&cred.hosts, expected.node_name)? {
            return Err(CredError::NotForThisHost);
        }
        if cred.job_id != expected.job_id {
            return Err(CredError::Mismatch("job id"));
        }
        if cred.step_id != expected.step_id {
            return Err(CredError::Mismatch("step id"));
        }
        if cred.uid != expected.uid {
            return Err(CredError::Mismatch("uid"));
        }
        Ok(VerifiedCredential {
            job_id: cred.job_id,
            step_id: cred.step_id,
            uid: cred.uid,
            expires_at: cred.expires_at,
        })
    }

    /// Record the job as active. Revocation is checked under the same lock so
    /// a revoke racing this launch is never lost.
    pub fn insert_jobid(
        &self,
        job_id: JobId,
        expires_at: DateTime<Utc>,
    ) -> Result<Inserted, CredError> {
        let outcome = {
            let mut records = self.lock();
            match records.get_mut(&job_id) {
                Some(record) if record.state == CredState::Revoked => {
                    return Err(CredError::Revoked(job_id))
                }
                Some(record) if record.state == CredState::ExpirationStarted => {
                    return Err(CredError::AlreadyExpiring(job_id))
                }
                Some(record) => {
                    record.expiry_time = record.expiry_time.max(expires_at);
                    Inserted { first_sight: false }
                }
                None => {
                    records.insert(
                        job_id,
                        CredentialRecord {
                            job_id,
                            state: CredState::Active,
                            expiry_time: expires_at,
                            launch_count: 0,
                            expiration_begun: false,
                        },
                    );
                    Inserted { first_sight: true }
                }
            }
        };
        if outcome.first_sight {
            self.persist();
        }
        Ok(outcome)
    }

    /// Count a launch that made it past the manager's readiness report.
    pub fn mark_seen(&self, job_id: JobId) {
        let counted = match self.lock().get_mut(&job_id) {
            Some(record) => {
                record.launch_count += 1;
                true
            }
            None => false,
        };
        if counted {
            self.persist();
        }
    }

    /// Undo an insertion for a launch that failed before any task ran.
    pub fn rewind(&self, job_id: JobId, was_cached: bool) {
        if was_cached {
            return;
        }
        let removed = {
            let mut records = self.lock();
            match records.get(&job_id) {
                Some(record) if record.state == CredState::Active && record.launch_count == 0 => {
                    records.remove(&job_id).is_some()
                }
                _ => false,
            }
        };
        if removed {
            debug!(job_id, "rewound credential insertion");
            self.persist();
        }
    }

    pub fn is_cached(&self, job_id: JobId) -> bool {
        self.lock().contains_key(&job_id)
    }

    pub fn is_revoked(&self, job_id: JobId) -> bool {
        self.lock()
            .get(&job_id)
            .map(|record| record.state == CredState::Revoked)
            .unwrap_or(false)
    }

    pub fn state_of(&self, job_id: JobId) -> Option<CredState> {
        self.lock().get(&job_id).map(|record| record.state)
    }

    /// Refuse further launches for `job_id`. Idempotent.
    pub fn revoke(&self, job_id: JobId) {
        {
            let now = Utc::now();
            let mut records = self.lock();
            let record = records.entry(job_id).or_insert_with(|| CredentialRecord {
                job_id,
                state: CredState::Revoked,
                expiry_time: now,
                launch_count: 0,
                expiration_begun: false,
            });
            record.state = CredState::Revoked;
            record.expiry_time = now;
        }
        self.persist();
    }

    /// Claim the right to run the job's epilog. Succeeds at most once per
    /// record.
    pub fn begin_expiration(&self, job_id: JobId) -> Result<(), CredError> {
        {
            let mut records = self.lock();
            let record = records.entry(job_id).or_insert_with(|| CredentialRecord {
                job_id,
                state: CredState::Active,
                expiry_time: Utc::now(),
                launch_count: 0,
                expiration_begun: false,
            });
            if record.expiration_begun {
                return Err(CredError::AlreadyExpiring(job_id));
            }
            record.expiration_begun = true;
            if record.state == CredState::Active {
                record.state = CredState::ExpirationStarted;
            }
        }
        self.persist();
        Ok(())
    }

    /// Drop records whose expiry plus the grace period has passed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        let purged = {
            let mut records = self.lock();
            let before = records.len();
            records.retain(|_, record| record.expiry_time + grace > now);
            before - records.len()
        };
        if purged > 0 {
            debug!(purged, "purged expired credential records");
            self.persist();
        }
        purged
    }

    pub fn pack(&self) -> Vec<u8> {
        let mut records: Vec<CredentialRecord> = self.lock().values().cloned().collect();
        records.sort_by_key(|record| record.job_id);
        pack(&records)
    }

    /// Replace every record with the contents of `buf`.
    pub fn unpack(&self, buf: &[u8]) -> Result<(), CredError> {
        let records = unpack(buf)?;
        let mut guard = self.lock();
        guard.clear();
        for record in records {
            guard.insert(record.job_id, record);
        }
        Ok(())
    }

    /// Write the state file. Failures are logged; the in-memory view stays
    /// authoritative.
    pub fn persist(&self) {
        let Some(path) = self.state_path.as_ref() else {
            return;
        };
        if let Err(err) = write_state(path, &self.pack()) {
            warn!(path = %path.display(), %err, "failed to save credential state");
        }
    }
}

pub fn pack(records: &[CredentialRecord]) -> Vec<u8> {
    // Serializing plain records cannot fail.
    serde_json::to_vec(records).unwrap_or_default()
}

pub fn unpack(buf: &[u8]) -> Result<Vec<CredentialRecord>, CredError> {
    serde_json::from_slice(buf).map_err(|err| CredError::Corrupt(err.to_string()))
}

/// `state.new` is written and synced, `state` moves to `state.old`, then
/// `state.new` takes its place.
fn write_state(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let new_path = sibling(path, "new");
    let old_path = sibling(path, "old");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&new_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    match fs::rename(path, &old_path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    fs::rename(&new_path, path)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"cred-key";

    fn cache() -> CredentialCache {
        CredentialCache::new(KEY, None, Duration::from_secs(60))
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::hours(1)
    }

    fn expected(node: &str) -> Expected<'_> {
        Expected {
            job_id: 7,
            step_id: 1,
            uid: 42,
            node_name: node,
        }
    }

    #[test]
    fn verify_accepts_a_valid_credential() {
        let cred = LaunchCredential::issue(7, 1, 42, "n[0-3]", later(), KEY).unwrap();
        let verified = cache().verify(&cred, expected("n2")).unwrap();
        assert_eq!(verified.uid, 42);
    }

    #[test]
    fn verify_reports_each_failure_kind() {
        let cache = cache();
        let cred = LaunchCredential::issue(7, 1, 42, "n0", later(), b"other").unwrap();
        assert_eq!(
            cache.verify(&cred, expected("n0")),
            Err(CredError::InvalidSignature)
        );

        let past = Utc::now() - chrono::Duration::seconds(5);
        let cred = LaunchCredential::issue(7, 1, 42, "n0", past, KEY).unwrap();
        assert!(matches!(
            cache.verify(&cred, expected("n0")),
            Err(CredError::Expired(_))
        ));

        let cred = LaunchCredential::issue(7, 1, 42, "n0", later(), KEY).unwrap();
        assert_eq!(
            cache.verify(&cred, expected("n1")),
            Err(CredError::NotForThisHost)
        );

        let cred = LaunchCredential::issue(7, 1, 42, "n[0-", later(), KEY).unwrap();
        assert!(matches!(
            cache.verify(&cred, expected("n0")),
            Err(CredError::MalformedHostSet(_))
        ));

        let cred = LaunchCredential::issue(7, 1, 43, "n0", later(), KEY).unwrap();
        assert_eq!(
            cache.verify(&cred, expected("n0")),
            Err(CredError::Mismatch("uid"))
        );
    }

    #[test]
    fn rotated_key_applies_to_later_checks() {
        let cache = cache();
        let cred = LaunchCredential::issue(7, 1, 42, "n0", later(), b"next").unwrap();
        assert!(cache.verify(&cred, expected("n0")).is_err());
        cache.rotate_key(b"next".to_vec());
        assert!(cache.verify(&cred, expected("n0")).is_ok());
    }

    #[test]
    fn insert_reports_first_sight_once() {
        let cache = cache();
        assert!(cache.insert_jobid(7, later()).unwrap().first_sight);
        assert!(!cache.insert_jobid(7, later()).unwrap().first_sight);
        assert!(cache.is_cached(7));
    }

    #[test]
    fn revoked_job_refuses_insertion() {
        let cache = cache();
        cache.revoke(7);
        cache.revoke(7);
        assert!(cache.is_revoked(7));
        assert_eq!(cache.insert_jobid(7, later()), Err(CredError::Revoked(7)));
    }

    #[test]
    fn rewind_restores_previous_view() {
        let cache = cache();
        let was_cached = cache.is_cached(9);
        cache.insert_jobid(9, later()).unwrap();
        cache.rewind(9, was_cached);
        assert!(!cache.is_cached(9));

        cache.insert_jobid(9, later()).unwrap();
        cache.mark_seen(9);
        let was_cached = cache.is_cached(9);
        cache.insert_jobid(9, later()).unwrap();
        cache.rewind(9, was_cached);
        assert!(cache.is_cached(9));
    }

    #[derive(Clone, Copy, Debug)]
    enum Op {
        Insert,
        Revoke,
        Expire,
    }

    fn sequences(len: usize) -> Vec<Vec<Op>> {
        if len == 0 {
            return vec![vec![]];
        }
        let mut out = Vec::new();
        for prefix in sequences(len - 1) {
            for op in [Op::Insert, Op::Revoke, Op::Expire] {
                let mut seq = prefix.clone();
                seq.push(op);
                out.push(seq);
            }
        }
        out
    }

    #[test]
    fn begin_expiration_succeeds_at_most_once_for_any_sequence() {
        for len in 1..=6 {
            for seq in sequences(len) {
                let cache = cache();
                let mut granted = 0;
                for op in &seq {
                    match op {
                        Op::Insert => {
                            let _ = cache.insert_jobid(7, later());
                        }
                        Op::Revoke => cache.revoke(7),
                        Op::Expire => {
                            if cache.begin_expiration(7).is_ok() {
                                granted += 1;
                            }
                        }
                    }
                }
                assert!(granted <= 1, "sequence {seq:?} granted {granted} times");
            }
        }
    }

    #[test]
    fn pack_unpack_preserves_every_field() {
        let cache = cache();
        cache.insert_jobid(1, later()).unwrap();
        cache.mark_seen(1);
        cache.mark_seen(1);
        cache.insert_jobid(2, later()).unwrap();
        cache.begin_expiration(2).unwrap();
        cache.revoke(3);

        let packed = cache.pack();
        let restored = CredentialCache::new(KEY, None, Duration::from_secs(60));
        restored.unpack(&packed).unwrap();
        assert_eq!(restored.pack(), packed);

        let records = unpack(&packed).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].launch_count, 2);
        assert_eq!(records[1].state, CredState::ExpirationStarted);
        assert!(records[1].expiration_begun);
        assert_eq!(records[2].state, CredState::Revoked);
    }

    #[test]
    fn purge_respects_grace_period() {
        let cache = CredentialCache::new(KEY, None, Duration::from_secs(60));
        cache.revoke(5);
        assert_eq!(cache.purge_expired(Utc::now()), 0);
        assert_eq!(
            cache.purge_expired(Utc::now() + chrono::Duration::seconds(61)),
            1
        );
        assert!(!cache.is_cached(5));
    }

    #[test]
    fn state_file_uses_rename_rotation_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred_state");
        let cache = CredentialCache::restore(KEY, path.clone(), Duration::from_secs(60));
        cache.revoke(11);
        cache.revoke(12);
        assert!(path.exists());
        assert!(dir.path().join("cred_state.old").exists());
        assert!(!dir.path().join("cred_state.new").exists());

        let reloaded = CredentialCache::restore(KEY, path, Duration::from_secs(60));
        assert!(reloaded.is_revoked(11));
        assert!(reloaded.is_revoked(12));
    }

    #[test]
    fn launch_count_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred_state");
        let cache = CredentialCache::restore(KEY, path.clone(), Duration::from_secs(60));
        cache.insert_jobid(4, later()).unwrap();
        cache.mark_seen(4);
        cache.mark_seen(4);
        cache.mark_seen(5);

        let reloaded = CredentialCache::restore(KEY, path, Duration::from_secs(60));
        let records = unpack(&reloaded.pack()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].launch_count, 2);
        // A seen job is never rewound away.
        reloaded.rewind(4, false);
        assert!(reloaded.is_cached(4));
    }

    #[test]
    fn unreadable_state_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cred_state");
        fs::write(&path, b"not json").unwrap();
        let cache = CredentialCache::restore(KEY, path, Duration::from_secs(60));
        assert!(cache.pack().len() <= 2);
        assert!(!cache.is_cached(1));
    }
}
