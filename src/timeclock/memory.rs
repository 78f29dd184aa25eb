use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::repo::{TimeclockRepo, Transition};
use super::repo_types::{AuditRecord, JobSite, JobSiteFilter, TimeEntry, TimeEntryFilter};
use super::stats::{self, StatsWindow, TimeclockStats};
use crate::error::{AppError, AppResult, Conflict};

#[derive(Default)]
struct Inner {
    sites: HashMap<Uuid, JobSite>,
    entries: HashMap<Uuid, TimeEntry>,
    audit: Vec<AuditRecord>,
}

/// Process-local store. All checks and writes happen under one lock, which
/// gives the same uniqueness guarantees as the Postgres indexes.
#[derive(Default)]
pub struct MemoryTimeclockRepo {
    inner: Mutex<Inner>,
}

impl MemoryTimeclockRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

fn page<T>(items: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

impl Inner {
    fn check_entry_uniqueness(&self, entry: &TimeEntry) -> AppResult<()> {
        if entry.clock_out_time.is_none() {
            if let Some(active) = self
                .entries
                .values()
                .find(|e| e.user_id == entry.user_id && e.clock_out_time.is_none() && e.id != entry.id)
            {
                return Err(Conflict::AlreadyClockedIn {
                    active_time_entry_id: Some(active.id),
                }
                .into());
            }
        }
        if let Some(sup) = entry.supersedes_id {
            if self
                .entries
                .values()
                .any(|e| e.supersedes_id == Some(sup) && e.id != entry.id)
            {
                return Err(Conflict::AlreadyCorrected.into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TimeclockRepo for MemoryTimeclockRepo {
    async fn insert_job_site(&self, site: &JobSite) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.sites.values().any(|s| s.qr_token == site.qr_token) {
            return Err(Conflict::QrTokenTaken.into());
        }
        inner.sites.insert(site.id, site.clone());
        Ok(())
    }

    async fn update_job_site(&self, site: &JobSite) -> AppResult<JobSite> {
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner.sites.get_mut(&site.id) else {
            return Err(AppError::not_found(format!("job site {} not found", site.id)));
        };
        *stored = JobSite {
            qr_token: std::mem::take(&mut stored.qr_token),
            is_active: stored.is_active,
            created_by: stored.created_by,
            created_at: stored.created_at,
            ..site.clone()
        };
        Ok(stored.clone())
    }

    async fn set_job_site_active(&self, id: Uuid, active: bool, at: OffsetDateTime) -> AppResult<JobSite> {
        let mut inner = self.inner.lock().await;
        let Some(stored) = inner.sites.get_mut(&id) else {
            return Err(AppError::not_found(format!("job site {id} not found")));
        };
        stored.is_active = active;
        stored.updated_at = at;
        Ok(stored.clone())
    }

    async fn find_job_site(&self, id: Uuid) -> AppResult<Option<JobSite>> {
        Ok(self.inner.lock().await.sites.get(&id).cloned())
    }

    async fn find_job_site_by_qr(&self, token: &str) -> AppResult<Option<JobSite>> {
        let inner = self.inner.lock().await;
        Ok(inner.sites.values().find(|s| s.qr_token == token).cloned())
    }

    async fn list_job_sites(&self, f: &JobSiteFilter) -> AppResult<Vec<JobSite>> {
        let inner = self.inner.lock().await;
        let mut sites: Vec<JobSite> = inner
            .sites
            .values()
            .filter(|s| !f.active_only || s.is_active)
            .cloned()
            .collect();
        sites.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(page(sites, f.limit, f.offset))
    }

    async fn insert_entry(&self, entry: &TimeEntry, audit: &AuditRecord) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.check_entry_uniqueness(entry)?;
        inner.entries.insert(entry.id, entry.clone());
        inner.audit.push(audit.clone());
        Ok(())
    }

    async fn find_entry(&self, id: Uuid) -> AppResult<Option<TimeEntry>> {
        Ok(self.inner.lock().await.entries.get(&id).cloned())
    }

    async fn find_active_entry(&self, user_id: Uuid) -> AppResult<Option<TimeEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .entries
            .values()
            .find(|e| e.user_id == user_id && e.clock_out_time.is_none())
            .cloned())
    }

    async fn transition_entry(&self, id: Uuid, apply: &Transition<'_>) -> AppResult<TimeEntry> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .entries
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("time entry {id} not found")))?;
        let (next, audit) = apply(&current)?;
        inner.check_entry_uniqueness(&next)?;
        inner.entries.insert(id, next.clone());
        inner.audit.push(audit);
        Ok(next)
    }

    async fn list_entries(&self, f: &TimeEntryFilter) -> AppResult<Vec<TimeEntry>> {
        let inner = self.inner.lock().await;
        let mut entries: Vec<TimeEntry> =
            inner.entries.values().filter(|e| f.matches(e)).cloned().collect();
        entries.sort_by(|a, b| b.clock_in_time.cmp(&a.clock_in_time));
        Ok(page(entries, f.limit, f.offset))
    }

    async fn list_audit(&self, time_entry_id: Uuid) -> AppResult<Vec<AuditRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .audit
            .iter()
            .filter(|a| a.time_entry_id == time_entry_id)
            .cloned()
            .collect())
    }

    async fn stats(&self, window: &StatsWindow) -> AppResult<TimeclockStats> {
        let inner = self.inner.lock().await;
        Ok(stats::aggregate(inner.entries.values(), inner.sites.values(), window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeclock::repo_types::AuditAction;
    use crate::timeclock::state_machine::clock_in;
    use time::macros::datetime;

    fn audit_for(entry: &TimeEntry) -> AuditRecord {
        AuditRecord::new(AuditAction::ClockIn, None, entry, entry.user_id, entry.created_at).unwrap()
    }

    #[tokio::test]
    async fn second_active_entry_for_user_conflicts() {
        let repo = MemoryTimeclockRepo::new();
        let user = Uuid::new_v4();
        let t0 = datetime!(2025-03-03 07:00 UTC);

        let first = clock_in(user, Uuid::new_v4(), None, None, t0);
        repo.insert_entry(&first, &audit_for(&first)).await.unwrap();

        let second = clock_in(user, Uuid::new_v4(), None, None, t0);
        let err = repo.insert_entry(&second, &audit_for(&second)).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Conflict(Conflict::AlreadyClockedIn { active_time_entry_id: Some(id) }) if id == first.id
        ));
        assert_eq!(repo.list_audit(second.id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn failed_transition_writes_nothing() {
        let repo = MemoryTimeclockRepo::new();
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let entry = clock_in(Uuid::new_v4(), Uuid::new_v4(), None, None, t0);
        repo.insert_entry(&entry, &audit_for(&entry)).await.unwrap();

        let refuse: &Transition<'_> = &|_| Err(AppError::validation("nope"));
        assert!(repo.transition_entry(entry.id, refuse).await.is_err());
        assert_eq!(repo.find_entry(entry.id).await.unwrap(), Some(entry.clone()));
        assert_eq!(repo.list_audit(entry.id).await.unwrap().len(), 1);
    }

    fn site(name: &str) -> JobSite {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        JobSite {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            address: None,
            latitude: None,
            longitude: None,
            radius_meters: 100,
            qr_token: crate::timeclock::qr::generate_token(),
            is_active: true,
            created_by: Uuid::new_v4(),
            created_at: t0,
            updated_at: t0,
        }
    }

    #[tokio::test]
    async fn stale_rename_keeps_deactivation_and_token() {
        let repo = MemoryTimeclockRepo::new();
        let original = site("Depot");
        repo.insert_job_site(&original).await.unwrap();

        let mut stale = repo.find_job_site(original.id).await.unwrap().unwrap();
        let off = repo
            .set_job_site_active(original.id, false, datetime!(2025-03-03 08:00 UTC))
            .await
            .unwrap();
        assert!(!off.is_active);

        stale.name = "Depot North".into();
        stale.qr_token = "site_other".into();
        let stored = repo.update_job_site(&stale).await.unwrap();
        assert_eq!(stored.name, "Depot North");
        assert!(!stored.is_active);
        assert_eq!(stored.qr_token, original.qr_token);
        assert_eq!(repo.find_job_site(original.id).await.unwrap(), Some(stored));
    }

    #[tokio::test]
    async fn entries_list_newest_first_with_paging() {
        let repo = MemoryTimeclockRepo::new();
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let mut ids = Vec::new();
        for h in 0..3 {
            let e = clock_in(Uuid::new_v4(), Uuid::new_v4(), None, None, t0 + time::Duration::hours(h));
            repo.insert_entry(&e, &audit_for(&e)).await.unwrap();
            ids.push(e.id);
        }
        let filter = TimeEntryFilter { limit: 2, offset: 0, ..Default::default() };
        let got: Vec<Uuid> = repo.list_entries(&filter).await.unwrap().iter().map(|e| e.id).collect();
        assert_eq!(got, vec![ids[2], ids[1]]);

        let filter = TimeEntryFilter { limit: 2, offset: 2, ..Default::default() };
        let got = repo.list_entries(&filter).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, ids[0]);
    }
}
