use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{ArchiveOutcome, ArchivedJobRecord, JobStore, ScheduledJobEntry};
use crate::job::{JobId, JobKind};

#[derive(Default)]
struct MemoryState {
    active: HashMap<JobId, ScheduledJobEntry>,
    by_key: HashMap<String, JobId>,
    archive: HashMap<JobId, ArchivedJobRecord>,
    last_success: HashMap<String, JobId>,
    paused: bool,
}

/// Job store kept entirely in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn archive_len(&self) -> usize {
        self.state.lock().archive.len()
    }
}

impl fmt::Debug for MemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("MemoryJobStore");
        match self.state.try_lock() {
            Some(state) => {
                debug.field("active", &state.active.len());
                debug.field("archived", &state.archive.len());
            }
            None => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, entry: &ScheduledJobEntry) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.active.contains_key(&entry.id) {
            anyhow::bail!("job {} already stored", entry.id);
        }
        state.by_key.insert(entry.identity_key.clone(), entry.id);
        state.active.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<ScheduledJobEntry>> {
        Ok(self.state.lock().active.get(&id).cloned())
    }

    async fn find_active_by_key(
        &self,
        identity_key: &str,
    ) -> anyhow::Result<Option<ScheduledJobEntry>> {
        let state = self.state.lock();
        Ok(state
            .by_key
            .get(identity_key)
            .and_then(|id| state.active.get(id))
            .cloned())
    }

    async fn update(
        &self,
        entry: &ScheduledJobEntry,
        expected_version: u64,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.active.get_mut(&entry.id) {
            Some(stored) if stored.version == expected_version => {
                *stored = entry.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_claim(
        &self,
        id: JobId,
        worker_id: &str,
        until: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.active.get_mut(&id) {
            Some(stored) if stored.claimed_by.as_deref() == Some(worker_id) => {
                stored.claim_expires_at = Some(until);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: JobId) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.active.remove(&id) {
            Some(entry) => {
                if state.by_key.get(&entry.identity_key) == Some(&id) {
                    state.by_key.remove(&entry.identity_key);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn query_eligible(
        &self,
        now: DateTime<Utc>,
        excluded: &HashSet<JobKind>,
        limit: usize,
    ) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        let state = self.state.lock();
        let mut eligible: Vec<&ScheduledJobEntry> = state
            .active
            .values()
            .filter(|entry| {
                !entry.is_dispatched() && entry.eligible_at <= now && !excluded.contains(&entry.kind)
            })
            .collect();
        eligible.sort_by_key(|entry| (Reverse(entry.priority), entry.submitted_at, entry.id));
        Ok(eligible.into_iter().take(limit).cloned().collect())
    }

    async fn expired_claims(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        let state = self.state.lock();
        Ok(state
            .active
            .values()
            .filter(|entry| {
                entry.is_dispatched() && entry.claim_expires_at.is_some_and(|at| at < now)
            })
            .cloned()
            .collect())
    }

    async fn active_entries(&self) -> anyhow::Result<Vec<ScheduledJobEntry>> {
        Ok(self.state.lock().active.values().cloned().collect())
    }

    async fn archive(
        &self,
        record: &ArchivedJobRecord,
        expected_version: u64,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.active.get(&record.id) {
            Some(stored) if stored.version == expected_version => {}
            _ => return Ok(false),
        }
        state.active.remove(&record.id);
        if state.by_key.get(&record.identity_key) == Some(&record.id) {
            state.by_key.remove(&record.identity_key);
        }
        if record.outcome == ArchiveOutcome::Succeeded {
            state.last_success.insert(record.identity_key.clone(), record.id);
        }
        state.archive.insert(record.id, record.clone());
        Ok(true)
    }

    async fn archived(&self, id: JobId) -> anyhow::Result<Option<ArchivedJobRecord>> {
        Ok(self.state.lock().archive.get(&id).cloned())
    }

    async fn last_success(&self, identity_key: &str) -> anyhow::Result<Option<ArchivedJobRecord>> {
        let state = self.state.lock();
        Ok(state
            .last_success
            .get(identity_key)
            .and_then(|id| state.archive.get(id))
            .cloned())
    }

    async fn failed(&self) -> anyhow::Result<Vec<ArchivedJobRecord>> {
        let state = self.state.lock();
        let mut failed: Vec<ArchivedJobRecord> = state
            .archive
            .values()
            .filter(|record| record.outcome == ArchiveOutcome::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|record| (record.finished_at, record.id));
        Ok(failed)
    }

    async fn clear_failed(&self, id: JobId) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.archive.get(&id) {
            Some(record) if record.outcome == ArchiveOutcome::Failed => {
                state.archive.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_paused(&self) -> anyhow::Result<bool> {
        Ok(self.state.lock().paused)
    }

    async fn set_paused(&self, paused: bool) -> anyhow::Result<()> {
        self.state.lock().paused = paused;
        Ok(())
    }

    async fn prune_archive(&self, before: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let doomed: Vec<JobId> = state
            .archive
            .values()
            .filter(|record| record.outcome != ArchiveOutcome::Failed && record.finished_at < before)
            .map(|record| record.id)
            .collect();
        for id in &doomed {
            if let Some(record) = state.archive.remove(id)
                && state.last_success.get(&record.identity_key) == Some(id)
            {
                state.last_success.remove(&record.identity_key);
            }
        }
        Ok(doomed.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobInput, Priority, Submission};

    fn entry(kind: &str, key: &str, priority: i32, now: DateTime<Utc>) -> ScheduledJobEntry {
        let submission = Submission::new(kind, JobInput::new()).with_priority(Priority::new(priority));
        ScheduledJobEntry::new(key.to_string(), submission, now)
    }

    #[tokio::test]
    async fn eligible_order_is_priority_then_fifo() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let low = entry("t", "t[1]", 1, now);
        let mut high_late = entry("t", "t[2]", 3, now);
        high_late.submitted_at = now + chrono::Duration::seconds(1);
        let high_early = entry("t", "t[3]", 3, now);

        for e in [&low, &high_late, &high_early] {
            store.insert(e).await.unwrap();
        }

        let order: Vec<JobId> = store
            .query_eligible(now + chrono::Duration::seconds(5), &HashSet::new(), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(order, vec![high_early.id, high_late.id, low.id]);
    }

    #[tokio::test]
    async fn eligible_query_skips_excluded_future_and_claimed() {
        let store = MemoryJobStore::new();
        let now = Utc::now();

        let excluded_kind = entry("blocked", "b[]", 0, now);
        let mut future = entry("t", "t[future]", 0, now);
        future.eligible_at = now + chrono::Duration::minutes(5);
        let mut claimed = entry("t", "t[claimed]", 0, now);
        claimed.claimed_by = Some("w1".into());
        let ready = entry("t", "t[ready]", 0, now);

        for e in [&excluded_kind, &future, &claimed, &ready] {
            store.insert(e).await.unwrap();
        }

        let excluded: HashSet<JobKind> = [JobKind::new("blocked")].into_iter().collect();
        let found = store.query_eligible(now, &excluded, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ready.id);
    }

    #[tokio::test]
    async fn update_requires_matching_version() {
        let store = MemoryJobStore::new();
        let mut e = entry("t", "t[1]", 0, Utc::now());
        store.insert(&e).await.unwrap();

        e.version = 1;
        e.claimed_by = Some("w1".into());
        assert!(store.update(&e, 0).await.unwrap());
        assert!(!store.update(&e, 0).await.unwrap());
        assert_eq!(store.get(e.id).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn archive_moves_entry_and_tracks_success() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let e = entry("t", "t[1]", 0, now);
        store.insert(&e).await.unwrap();

        let record = ArchivedJobRecord::from_entry(e.clone(), ArchiveOutcome::Succeeded, None, now);
        assert!(store.archive(&record, 0).await.unwrap());
        assert!(store.get(e.id).await.unwrap().is_none());
        assert!(store.find_active_by_key("t[1]").await.unwrap().is_none());
        assert_eq!(store.last_success("t[1]").await.unwrap().map(|r| r.id), Some(e.id));

        assert_eq!(store.prune_archive(now + chrono::Duration::seconds(1)).await.unwrap(), 1);
        assert!(store.last_success("t[1]").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_records_survive_pruning_until_cleared() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let e = entry("t", "t[1]", 0, now);
        store.insert(&e).await.unwrap();

        let record = ArchivedJobRecord::from_entry(
            e.clone(),
            ArchiveOutcome::Failed,
            Some("boom".into()),
            now,
        );
        assert!(store.archive(&record, 0).await.unwrap());
        assert_eq!(store.prune_archive(now + chrono::Duration::days(30)).await.unwrap(), 0);
        assert_eq!(store.failed().await.unwrap().len(), 1);

        assert!(store.clear_failed(e.id).await.unwrap());
        assert!(store.failed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn extend_claim_checks_owner() {
        let store = MemoryJobStore::new();
        let now = Utc::now();
        let mut e = entry("t", "t[1]", 0, now);
        e.claimed_by = Some("w1".into());
        e.claim_expires_at = Some(now);
        store.insert(&e).await.unwrap();

        let later = now + chrono::Duration::seconds(60);
        assert!(!store.extend_claim(e.id, "w2", later).await.unwrap());
        assert!(store.extend_claim(e.id, "w1", later).await.unwrap());
        assert!(store.expired_claims(now + chrono::Duration::seconds(30)).await.unwrap().is_empty());
        assert_eq!(store.expired_claims(later + chrono::Duration::seconds(1)).await.unwrap().len(), 1);
    }
}
