use async_trait::async_trait;
use sqlx::{postgres::PgArguments, query::Query, PgConnection, PgPool, Postgres};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::repo_types::{AuditRecord, JobSite, JobSiteFilter, TimeEntry, TimeEntryFilter};
use super::stats::{StatsWindow, TimeclockStats};
use crate::error::{AppError, AppResult, Conflict};

/// Read-modify-write step run while the entry is locked. Returns the next
/// version of the entry and the audit row describing the change.
pub type Transition<'a> = dyn Fn(&TimeEntry) -> AppResult<(TimeEntry, AuditRecord)> + Send + Sync + 'a;

/// Storage for job sites, time entries and their audit trail.
///
/// Implementations must enforce the "one entry without clock-out per user"
/// rule at write time (`insert_entry` fails with
/// `Conflict::AlreadyClockedIn`), never by trusting an earlier read.
#[async_trait]
pub trait TimeclockRepo: Send + Sync {
    async fn insert_job_site(&self, site: &JobSite) -> AppResult<()>;
    /// Writes the editable profile columns only. Activation and the QR token
    /// are left as stored; returns the stored row.
    async fn update_job_site(&self, site: &JobSite) -> AppResult<JobSite>;
    async fn set_job_site_active(&self, id: Uuid, active: bool, at: OffsetDateTime) -> AppResult<JobSite>;
    async fn find_job_site(&self, id: Uuid) -> AppResult<Option<JobSite>>;
    async fn find_job_site_by_qr(&self, token: &str) -> AppResult<Option<JobSite>>;
    async fn list_job_sites(&self, filter: &JobSiteFilter) -> AppResult<Vec<JobSite>>;

    async fn insert_entry(&self, entry: &TimeEntry, audit: &AuditRecord) -> AppResult<()>;
    async fn find_entry(&self, id: Uuid) -> AppResult<Option<TimeEntry>>;
    async fn find_active_entry(&self, user_id: Uuid) -> AppResult<Option<TimeEntry>>;
    /// Applies `apply` to the current entry atomically. If `apply` fails,
    /// nothing is written.
    async fn transition_entry(&self, id: Uuid, apply: &Transition<'_>) -> AppResult<TimeEntry>;
    async fn list_entries(&self, filter: &TimeEntryFilter) -> AppResult<Vec<TimeEntry>>;
    async fn list_audit(&self, time_entry_id: Uuid) -> AppResult<Vec<AuditRecord>>;

    async fn stats(&self, window: &StatsWindow) -> AppResult<TimeclockStats>;
}

const SITE_COLUMNS: &str = "id, name, description, address, latitude, longitude, radius_meters, \
     qr_token, is_active, created_by, created_at, updated_at";

const ENTRY_COLUMNS: &str = "id, user_id, job_site_id, clock_in_time, clock_out_time, \
     break_start_time, break_end_time, break_seconds, total_hours, break_hours, notes, \
     clock_in_lat, clock_in_lng, clock_out_lat, clock_out_lng, is_approved, approved_by, \
     approved_at, rejected_by, rejected_at, rejection_reason, supersedes_id, created_at, updated_at";

const AUDIT_COLUMNS: &str =
    "id, time_entry_id, action, old_values, new_values, context, performed_by, ip_address, created_at";

/// Translates unique violations on our named indexes into typed conflicts.
fn map_write_error(e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some("23505") {
            match db.constraint() {
                Some("uq_time_entries_active_user") => {
                    return Conflict::AlreadyClockedIn { active_time_entry_id: None }.into()
                }
                Some("uq_time_entries_supersedes") => return Conflict::AlreadyCorrected.into(),
                Some("uq_job_sites_qr_token") => return Conflict::QrTokenTaken.into(),
                _ => {}
            }
        }
    }
    AppError::Database(e)
}

#[derive(Clone)]
pub struct PgTimeclockRepo {
    db: PgPool,
}

impl PgTimeclockRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn bind_entry<'q>(
    q: Query<'q, Postgres, PgArguments>,
    e: &'q TimeEntry,
) -> Query<'q, Postgres, PgArguments> {
    q.bind(e.id)
        .bind(e.user_id)
        .bind(e.job_site_id)
        .bind(e.clock_in_time)
        .bind(e.clock_out_time)
        .bind(e.break_start_time)
        .bind(e.break_end_time)
        .bind(e.break_seconds)
        .bind(e.total_hours)
        .bind(e.break_hours)
        .bind(e.notes.as_deref())
        .bind(e.clock_in_lat)
        .bind(e.clock_in_lng)
        .bind(e.clock_out_lat)
        .bind(e.clock_out_lng)
        .bind(e.is_approved)
        .bind(e.approved_by)
        .bind(e.approved_at)
        .bind(e.rejected_by)
        .bind(e.rejected_at)
        .bind(e.rejection_reason.as_deref())
        .bind(e.supersedes_id)
        .bind(e.created_at)
        .bind(e.updated_at)
}

async fn insert_audit(conn: &mut PgConnection, a: &AuditRecord) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO time_entry_audit
            (id, time_entry_id, action, old_values, new_values, context, performed_by, ip_address, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(a.id)
    .bind(a.time_entry_id)
    .bind(&a.action)
    .bind(&a.old_values)
    .bind(&a.new_values)
    .bind(&a.context)
    .bind(a.performed_by)
    .bind(a.ip_address.as_deref())
    .bind(a.created_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl TimeclockRepo for PgTimeclockRepo {
    async fn insert_job_site(&self, s: &JobSite) -> AppResult<()> {
        sqlx::query(&format!(
            "INSERT INTO job_sites ({SITE_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(s.id)
        .bind(&s.name)
        .bind(s.description.as_deref())
        .bind(s.address.as_deref())
        .bind(s.latitude)
        .bind(s.longitude)
        .bind(s.radius_meters)
        .bind(&s.qr_token)
        .bind(s.is_active)
        .bind(s.created_by)
        .bind(s.created_at)
        .bind(s.updated_at)
        .execute(&self.db)
        .await
        .map_err(map_write_error)?;
        Ok(())
    }

    async fn update_job_site(&self, s: &JobSite) -> AppResult<JobSite> {
        let site = sqlx::query_as::<_, JobSite>(&format!(
            "UPDATE job_sites \
                SET name = $2, description = $3, address = $4, latitude = $5, \
                    longitude = $6, radius_meters = $7, updated_at = $8 \
              WHERE id = $1 \
             RETURNING {SITE_COLUMNS}"
        ))
        .bind(s.id)
        .bind(&s.name)
        .bind(s.description.as_deref())
        .bind(s.address.as_deref())
        .bind(s.latitude)
        .bind(s.longitude)
        .bind(s.radius_meters)
        .bind(s.updated_at)
        .fetch_optional(&self.db)
        .await?;
        site.ok_or_else(|| AppError::not_found(format!("job site {} not found", s.id)))
    }

    async fn set_job_site_active(&self, id: Uuid, active: bool, at: OffsetDateTime) -> AppResult<JobSite> {
        let site = sqlx::query_as::<_, JobSite>(&format!(
            "UPDATE job_sites SET is_active = $2, updated_at = $3 WHERE id = $1 RETURNING {SITE_COLUMNS}"
        ))
        .bind(id)
        .bind(active)
        .bind(at)
        .fetch_optional(&self.db)
        .await?;
        site.ok_or_else(|| AppError::not_found(format!("job site {id} not found")))
    }

    async fn find_job_site(&self, id: Uuid) -> AppResult<Option<JobSite>> {
        let site = sqlx::query_as::<_, JobSite>(&format!(
            "SELECT {SITE_COLUMNS} FROM job_sites WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(site)
    }

    async fn find_job_site_by_qr(&self, token: &str) -> AppResult<Option<JobSite>> {
        let site = sqlx::query_as::<_, JobSite>(&format!(
            "SELECT {SITE_COLUMNS} FROM job_sites WHERE qr_token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(site)
    }

    async fn list_job_sites(&self, f: &JobSiteFilter) -> AppResult<Vec<JobSite>> {
        let rows = sqlx::query_as::<_, JobSite>(&format!(
            "SELECT {SITE_COLUMNS} FROM job_sites \
             WHERE ($1 = FALSE OR is_active) \
             ORDER BY name ASC, created_at ASC \
             LIMIT $2 OFFSET $3"
        ))
        .bind(f.active_only)
        .bind(f.limit)
        .bind(f.offset)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn insert_entry(&self, entry: &TimeEntry, audit: &AuditRecord) -> AppResult<()> {
        let mut tx = self.db.begin().await?;
        let sql = format!(
            "INSERT INTO time_entries ({ENTRY_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
              $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)"
        );
        bind_entry(sqlx::query(&sql), entry)
            .execute(&mut *tx)
            .await
            .map_err(map_write_error)?;
        insert_audit(&mut tx, audit).await?;
        tx.commit().await?;
        debug!(time_entry_id = %entry.id, user_id = %entry.user_id, "time entry inserted");
        Ok(())
    }

    async fn find_entry(&self, id: Uuid) -> AppResult<Option<TimeEntry>> {
        let entry = sqlx::query_as::<_, TimeEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(entry)
    }

    async fn find_active_entry(&self, user_id: Uuid) -> AppResult<Option<TimeEntry>> {
        let entry = sqlx::query_as::<_, TimeEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_entries \
             WHERE user_id = $1 AND clock_out_time IS NULL"
        ))
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(entry)
    }

    async fn transition_entry(&self, id: Uuid, apply: &Transition<'_>) -> AppResult<TimeEntry> {
        let mut tx = self.db.begin().await?;

        let current = sqlx::query_as::<_, TimeEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_entries WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::not_found(format!("time entry {id} not found")))?;

        // Dropping `tx` on a failed guard rolls back and releases the lock.
        let (next, audit) = apply(&current)?;

        let sql = format!(
            "UPDATE time_entries SET ({ENTRY_COLUMNS}) = \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, \
              $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24) \
             WHERE id = $25"
        );
        bind_entry(sqlx::query(&sql), &next)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_write_error)?;
        insert_audit(&mut tx, &audit).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn list_entries(&self, f: &TimeEntryFilter) -> AppResult<Vec<TimeEntry>> {
        let rows = sqlx::query_as::<_, TimeEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM time_entries \
             WHERE ($1::uuid IS NULL OR user_id = $1) \
               AND ($2::uuid IS NULL OR job_site_id = $2) \
               AND ($3::timestamptz IS NULL OR clock_in_time >= $3) \
               AND ($4::timestamptz IS NULL OR clock_in_time <= $4) \
             ORDER BY clock_in_time DESC \
             LIMIT $5 OFFSET $6"
        ))
        .bind(f.user_id)
        .bind(f.job_site_id)
        .bind(f.from)
        .bind(f.to)
        .bind(f.limit)
        .bind(f.offset)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn list_audit(&self, time_entry_id: Uuid) -> AppResult<Vec<AuditRecord>> {
        let rows = sqlx::query_as::<_, AuditRecord>(&format!(
            "SELECT {AUDIT_COLUMNS} FROM time_entry_audit \
             WHERE time_entry_id = $1 ORDER BY created_at ASC"
        ))
        .bind(time_entry_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn stats(&self, w: &StatsWindow) -> AppResult<TimeclockStats> {
        let stats = sqlx::query_as::<_, TimeclockStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM time_entries WHERE clock_out_time IS NULL)
                    AS employees_clocked_in,
                (SELECT COUNT(*) FROM job_sites WHERE is_active)
                    AS active_job_sites,
                (SELECT COALESCE(SUM(total_hours), 0) FROM time_entries
                  WHERE total_hours IS NOT NULL AND rejected_at IS NULL
                    AND clock_in_time >= $1 AND clock_in_time < $2)
                    AS hours_today,
                (SELECT COALESCE(SUM(total_hours), 0) FROM time_entries
                  WHERE total_hours IS NOT NULL AND rejected_at IS NULL
                    AND clock_in_time >= $3 AND clock_in_time < $4)
                    AS hours_this_week,
                (SELECT COUNT(*) FROM time_entries
                  WHERE clock_out_time IS NOT NULL AND NOT is_approved AND rejected_at IS NULL)
                    AS pending_approvals
            "#,
        )
        .bind(w.day_start)
        .bind(w.day_end)
        .bind(w.week_start)
        .bind(w.week_end)
        .fetch_one(&self.db)
        .await?;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    use sqlx::error::{DatabaseError, ErrorKind};
    use time::macros::datetime;

    use super::*;
    use crate::timeclock::qr;
    use crate::timeclock::repo_types::AuditAction;
    use crate::timeclock::state_machine::clock_in;

    #[derive(Debug)]
    struct UniqueViolation {
        constraint: &'static str,
    }

    impl fmt::Display for UniqueViolation {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "duplicate key value violates unique constraint \"{}\"", self.constraint)
        }
    }

    impl StdError for UniqueViolation {}

    impl DatabaseError for UniqueViolation {
        fn message(&self) -> &str {
            "duplicate key value"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            Some(Cow::Borrowed("23505"))
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }

        fn constraint(&self) -> Option<&str> {
            Some(self.constraint)
        }
    }

    fn unique_violation(constraint: &'static str) -> sqlx::Error {
        sqlx::Error::Database(Box::new(UniqueViolation { constraint }))
    }

    #[test]
    fn unique_violations_map_to_conflicts_by_index_name() {
        let cases = [
            (
                "uq_time_entries_active_user",
                Some(Conflict::AlreadyClockedIn { active_time_entry_id: None }),
            ),
            ("uq_time_entries_supersedes", Some(Conflict::AlreadyCorrected)),
            ("uq_job_sites_qr_token", Some(Conflict::QrTokenTaken)),
            ("job_sites_pkey", None),
        ];
        for (constraint, expected) in cases {
            match (map_write_error(unique_violation(constraint)), expected) {
                (AppError::Conflict(got), Some(want)) => assert_eq!(got, want, "{constraint}"),
                (AppError::Database(_), None) => {}
                (got, want) => panic!("{constraint}: got {got:?}, want {want:?}"),
            }
        }
    }

    #[test]
    fn non_unique_errors_stay_database_errors() {
        assert!(matches!(map_write_error(sqlx::Error::RowNotFound), AppError::Database(_)));
    }

    fn site_at(at: OffsetDateTime) -> JobSite {
        JobSite {
            id: Uuid::new_v4(),
            name: "Depot".into(),
            description: None,
            address: None,
            latitude: None,
            longitude: None,
            radius_meters: 100,
            qr_token: qr::generate_token(),
            is_active: true,
            created_by: Uuid::new_v4(),
            created_at: at,
            updated_at: at,
        }
    }

    #[sqlx::test]
    #[ignore = "needs DATABASE_URL pointing at a scratch Postgres"]
    async fn postgres_enforces_active_entry_index_and_counts_stats(pool: PgPool) {
        let repo = PgTimeclockRepo::new(pool);
        let t0 = datetime!(2025-03-06 07:00 UTC);
        let site = site_at(t0);
        repo.insert_job_site(&site).await.unwrap();

        let user = Uuid::new_v4();
        let first = clock_in(user, site.id, None, None, t0);
        let audit = AuditRecord::new(AuditAction::ClockIn, None, &first, user, t0).unwrap();
        repo.insert_entry(&first, &audit).await.unwrap();

        let second = clock_in(user, site.id, None, None, t0);
        let audit = AuditRecord::new(AuditAction::ClockIn, None, &second, user, t0).unwrap();
        assert!(matches!(
            repo.insert_entry(&second, &audit).await,
            Err(AppError::Conflict(Conflict::AlreadyClockedIn { .. }))
        ));

        let off = repo.set_job_site_active(site.id, false, t0).await.unwrap();
        assert!(!off.is_active);
        let renamed = repo
            .update_job_site(&JobSite { name: "Depot North".into(), ..site.clone() })
            .await
            .unwrap();
        assert!(!renamed.is_active);
        assert_eq!(renamed.qr_token, site.qr_token);

        let stats = repo.stats(&StatsWindow::containing(t0)).await.unwrap();
        assert_eq!(stats.employees_clocked_in, 1);
        assert_eq!(stats.active_job_sites, 0);
        assert_eq!(stats.pending_approvals, 0);
    }
}
