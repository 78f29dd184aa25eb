//! Dashboard aggregates. Read-only.

use serde::Serialize;
use sqlx::FromRow;
use time::{Duration, OffsetDateTime, Time, UtcOffset};

use super::repo_types::{JobSite, TimeEntry};
use super::state_machine::EntryState;

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct TimeclockStats {
    pub employees_clocked_in: i64,
    pub active_job_sites: i64,
    pub hours_today: f64,
    pub hours_this_week: f64,
    pub pending_approvals: i64,
}

/// Half-open UTC ranges for "today" and "this week" (Monday start).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsWindow {
    pub day_start: OffsetDateTime,
    pub day_end: OffsetDateTime,
    pub week_start: OffsetDateTime,
    pub week_end: OffsetDateTime,
}

impl StatsWindow {
    pub fn containing(now: OffsetDateTime) -> Self {
        let day_start = now.to_offset(UtcOffset::UTC).replace_time(Time::MIDNIGHT);
        let since_monday = i64::from(day_start.weekday().number_days_from_monday());
        let week_start = day_start - Duration::days(since_monday);
        Self {
            day_start,
            day_end: day_start + Duration::days(1),
            week_start,
            week_end: week_start + Duration::weeks(1),
        }
    }
}

fn counts_toward_hours(e: &TimeEntry) -> bool {
    e.total_hours.is_some() && e.rejected_at.is_none()
}

/// Same numbers the Postgres store computes in SQL, over in-memory records.
pub fn aggregate<'a>(
    entries: impl IntoIterator<Item = &'a TimeEntry>,
    sites: impl IntoIterator<Item = &'a JobSite>,
    window: &StatsWindow,
) -> TimeclockStats {
    let mut stats = TimeclockStats {
        employees_clocked_in: 0,
        active_job_sites: sites.into_iter().filter(|s| s.is_active).count() as i64,
        hours_today: 0.0,
        hours_this_week: 0.0,
        pending_approvals: 0,
    };

    for e in entries {
        let state = e.state();
        if state.is_active() {
            stats.employees_clocked_in += 1;
        } else if state == EntryState::PendingApproval {
            stats.pending_approvals += 1;
        }
        if !counts_toward_hours(e) {
            continue;
        }
        let hours = e.total_hours.unwrap_or_default();
        if e.clock_in_time >= window.day_start && e.clock_in_time < window.day_end {
            stats.hours_today += hours;
        }
        if e.clock_in_time >= window.week_start && e.clock_in_time < window.week_end {
            stats.hours_this_week += hours;
        }
    }
    stats
}
