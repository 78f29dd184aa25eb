//! Lifecycle of a single time entry.
//!
//! ```text
//! clocked_in ⇄ on_break
//!     │
//!     └─ clock_out ─> clocked_out_pending_approval ─┬─> approved
//!                                                    └─> rejected ──(correction)──> new entry
//! ```
//!
//! Every transition is a pure function from the current record to the next
//! one. A failed guard returns the reason and leaves the input untouched;
//! persisting the result atomically is the store's job.

use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::geofence::Coordinate;
use super::repo_types::TimeEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    ClockedIn,
    OnBreak,
    #[serde(rename = "clocked_out_pending_approval")]
    PendingApproval,
    Approved,
    Rejected,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::ClockedIn => "clocked_in",
            EntryState::OnBreak => "on_break",
            EntryState::PendingApproval => "clocked_out_pending_approval",
            EntryState::Approved => "approved",
            EntryState::Rejected => "rejected",
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, EntryState::ClockedIn | EntryState::OnBreak)
    }
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The guard that refused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("a break is already in progress")]
    BreakAlreadyOpen,
    #[error("no break is in progress")]
    NoOpenBreak,
    #[error("end your break before clocking out")]
    OnBreak,
    #[error("time entry is already clocked out ({state})")]
    EntryClosed { state: EntryState },
    #[error("only entries awaiting approval can be reviewed (entry is {state})")]
    NotPendingApproval { state: EntryState },
    #[error("only rejected entries can be corrected (entry is {state})")]
    NotRejected { state: EntryState },
    #[error("transition time precedes the entry's last recorded event")]
    ClockSkew,
    #[error("invalid time window: {0}")]
    InvalidWindow(&'static str),
}

impl TransitionError {
    pub fn reason(&self) -> &'static str {
        match self {
            TransitionError::BreakAlreadyOpen => "break_already_open",
            TransitionError::NoOpenBreak => "no_open_break",
            TransitionError::OnBreak => "on_break",
            TransitionError::EntryClosed { .. } => "entry_closed",
            TransitionError::NotPendingApproval { .. } => "not_pending_approval",
            TransitionError::NotRejected { .. } => "not_rejected",
            TransitionError::ClockSkew => "clock_skew",
            TransitionError::InvalidWindow(_) => "invalid_window",
        }
    }

    pub fn state(&self) -> Option<EntryState> {
        match *self {
            TransitionError::BreakAlreadyOpen => Some(EntryState::OnBreak),
            TransitionError::NoOpenBreak => Some(EntryState::ClockedIn),
            TransitionError::OnBreak => Some(EntryState::OnBreak),
            TransitionError::EntryClosed { state }
            | TransitionError::NotPendingApproval { state }
            | TransitionError::NotRejected { state } => Some(state),
            TransitionError::ClockSkew | TransitionError::InvalidWindow(_) => None,
        }
    }
}

pub(crate) fn seconds_to_hours(seconds: i64) -> f64 {
    seconds as f64 / 3600.0
}

fn append_note(existing: Option<String>, extra: Option<String>) -> Option<String> {
    match (existing, extra.filter(|s| !s.trim().is_empty())) {
        (Some(a), Some(b)) => Some(format!("{a}\n{b}")),
        (a, b) => a.or(b),
    }
}

/// Creates the active entry for a successful clock-in.
pub fn clock_in(
    user_id: Uuid,
    job_site_id: Uuid,
    location: Option<Coordinate>,
    notes: Option<String>,
    now: OffsetDateTime,
) -> TimeEntry {
    TimeEntry {
        id: Uuid::new_v4(),
        user_id,
        job_site_id,
        clock_in_time: now,
        clock_out_time: None,
        break_start_time: None,
        break_end_time: None,
        break_seconds: 0,
        total_hours: None,
        break_hours: None,
        notes: append_note(None, notes),
        clock_in_lat: location.map(|c| c.latitude),
        clock_in_lng: location.map(|c| c.longitude),
        clock_out_lat: None,
        clock_out_lng: None,
        is_approved: false,
        approved_by: None,
        approved_at: None,
        rejected_by: None,
        rejected_at: None,
        rejection_reason: None,
        supersedes_id: None,
        created_at: now,
        updated_at: now,
    }
}

/// Input for a supervisor-made replacement of a rejected entry.
#[derive(Debug, Clone)]
pub struct CorrectionInput {
    pub clock_in_time: OffsetDateTime,
    pub clock_out_time: OffsetDateTime,
    pub break_start_time: Option<OffsetDateTime>,
    pub break_end_time: Option<OffsetDateTime>,
    pub notes: Option<String>,
}

impl TimeEntry {
    pub fn state(&self) -> EntryState {
        if self.clock_out_time.is_none() {
            if self.break_open() {
                EntryState::OnBreak
            } else {
                EntryState::ClockedIn
            }
        } else if self.is_approved {
            EntryState::Approved
        } else if self.rejected_at.is_some() {
            EntryState::Rejected
        } else {
            EntryState::PendingApproval
        }
    }

    pub fn break_open(&self) -> bool {
        self.break_start_time.is_some() && self.break_end_time.is_none()
    }

    fn last_event(&self) -> OffsetDateTime {
        [self.break_start_time, self.break_end_time]
            .into_iter()
            .flatten()
            .fold(self.clock_in_time, OffsetDateTime::max)
    }

    fn ensure_not_before_last_event(&self, now: OffsetDateTime) -> Result<(), TransitionError> {
        if now < self.last_event() {
            return Err(TransitionError::ClockSkew);
        }
        Ok(())
    }

    pub fn start_break(&self, now: OffsetDateTime) -> Result<TimeEntry, TransitionError> {
        match self.state() {
            EntryState::ClockedIn => {}
            EntryState::OnBreak => return Err(TransitionError::BreakAlreadyOpen),
            state => return Err(TransitionError::EntryClosed { state }),
        }
        self.ensure_not_before_last_event(now)?;

        let mut next = self.clone();
        next.break_start_time = Some(now);
        next.break_end_time = None;
        next.updated_at = now;
        Ok(next)
    }

    pub fn end_break(&self, now: OffsetDateTime) -> Result<TimeEntry, TransitionError> {
        match self.state() {
            EntryState::OnBreak => {}
            EntryState::ClockedIn => return Err(TransitionError::NoOpenBreak),
            state => return Err(TransitionError::EntryClosed { state }),
        }
        self.ensure_not_before_last_event(now)?;
        let Some(started) = self.break_start_time else {
            return Err(TransitionError::NoOpenBreak);
        };

        let mut next = self.clone();
        next.break_end_time = Some(now);
        next.break_seconds += (now - started).whole_seconds();
        next.break_hours = Some(seconds_to_hours(next.break_seconds));
        next.updated_at = now;
        Ok(next)
    }

    pub fn clock_out(
        &self,
        now: OffsetDateTime,
        location: Option<Coordinate>,
        notes: Option<String>,
    ) -> Result<TimeEntry, TransitionError> {
        match self.state() {
            EntryState::ClockedIn => {}
            EntryState::OnBreak => return Err(TransitionError::OnBreak),
            state => return Err(TransitionError::EntryClosed { state }),
        }
        self.ensure_not_before_last_event(now)?;

        let worked = (now - self.clock_in_time).whole_seconds() - self.break_seconds;
        let mut next = self.clone();
        next.clock_out_time = Some(now);
        next.total_hours = Some(seconds_to_hours(worked));
        next.break_hours = Some(seconds_to_hours(self.break_seconds));
        next.clock_out_lat = location.map(|c| c.latitude);
        next.clock_out_lng = location.map(|c| c.longitude);
        next.notes = append_note(next.notes.take(), notes);
        next.updated_at = now;
        Ok(next)
    }

    fn ensure_pending(&self) -> Result<(), TransitionError> {
        match self.state() {
            EntryState::PendingApproval => Ok(()),
            state => Err(TransitionError::NotPendingApproval { state }),
        }
    }

    pub fn approve(&self, approver: Uuid, now: OffsetDateTime) -> Result<TimeEntry, TransitionError> {
        self.ensure_pending()?;
        let mut next = self.clone();
        next.is_approved = true;
        next.approved_by = Some(approver);
        next.approved_at = Some(now);
        next.updated_at = now;
        Ok(next)
    }

    pub fn reject(
        &self,
        approver: Uuid,
        reason: String,
        now: OffsetDateTime,
    ) -> Result<TimeEntry, TransitionError> {
        self.ensure_pending()?;
        let mut next = self.clone();
        next.rejected_by = Some(approver);
        next.rejected_at = Some(now);
        next.rejection_reason = Some(reason);
        next.updated_at = now;
        Ok(next)
    }

    /// Builds a new closed entry that supersedes this rejected one. The
    /// rejected record itself is not modified.
    pub fn correction(
        &self,
        input: CorrectionInput,
        now: OffsetDateTime,
    ) -> Result<TimeEntry, TransitionError> {
        match self.state() {
            EntryState::Rejected => {}
            state => return Err(TransitionError::NotRejected { state }),
        }

        let CorrectionInput {
            clock_in_time,
            clock_out_time,
            break_start_time,
            break_end_time,
            notes,
        } = input;

        if clock_out_time < clock_in_time {
            return Err(TransitionError::InvalidWindow(
                "clock_out_time must not precede clock_in_time",
            ));
        }
        if clock_out_time > now {
            return Err(TransitionError::InvalidWindow("corrected times cannot be in the future"));
        }
        let break_seconds = match (break_start_time, break_end_time) {
            (None, None) => 0,
            (Some(start), Some(end)) => {
                if !(clock_in_time <= start && start < end && end <= clock_out_time) {
                    return Err(TransitionError::InvalidWindow(
                        "break must start after clock-in, end after it starts and before clock-out",
                    ));
                }
                (end - start).whole_seconds()
            }
            _ => {
                return Err(TransitionError::InvalidWindow(
                    "break start and end must be supplied together",
                ))
            }
        };

        let worked = (clock_out_time - clock_in_time).whole_seconds() - break_seconds;
        let mut next = clock_in(self.user_id, self.job_site_id, None, notes, now);
        next.clock_in_time = clock_in_time;
        next.clock_out_time = Some(clock_out_time);
        next.break_start_time = break_start_time;
        next.break_end_time = break_end_time;
        next.break_seconds = break_seconds;
        next.total_hours = Some(seconds_to_hours(worked));
        next.break_hours = Some(seconds_to_hours(break_seconds));
        next.supersedes_id = Some(self.id);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use time::Duration;

    fn fresh() -> TimeEntry {
        clock_in(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            Some("arrived".into()),
            datetime!(2025-03-03 07:00 UTC),
        )
    }

    #[test]
    fn new_entry_is_clocked_in() {
        let e = fresh();
        assert_eq!(e.state(), EntryState::ClockedIn);
        assert!(e.clock_out_time.is_none());
        assert!(e.total_hours.is_none());
    }

    #[test]
    fn full_shift_with_two_breaks_nets_out_break_time() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let e = fresh()
            .start_break(t0 + Duration::hours(2))
            .unwrap()
            .end_break(t0 + Duration::hours(2) + Duration::minutes(15))
            .unwrap()
            .start_break(t0 + Duration::hours(5))
            .unwrap()
            .end_break(t0 + Duration::hours(5) + Duration::minutes(30))
            .unwrap()
            .clock_out(t0 + Duration::hours(9), None, Some("done".into()))
            .unwrap();

        assert_eq!(e.state(), EntryState::PendingApproval);
        assert_eq!(e.break_seconds, 45 * 60);
        assert_eq!(e.break_hours, Some(0.75));
        assert_eq!(e.total_hours, Some(8.25));

        let gross = (e.clock_out_time.unwrap() - e.clock_in_time).whole_seconds() as f64 / 3600.0;
        assert!((e.total_hours.unwrap() - (gross - e.break_hours.unwrap())).abs() < 1e-9);

        let (bs, be) = (e.break_start_time.unwrap(), e.break_end_time.unwrap());
        assert!(bs < be && be <= e.clock_out_time.unwrap());
        assert_eq!(e.notes.as_deref(), Some("arrived\ndone"));
    }

    #[test]
    fn clock_out_while_on_break_is_refused() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let on_break = fresh().start_break(t0 + Duration::hours(1)).unwrap();
        let err = on_break.clock_out(t0 + Duration::hours(2), None, None).unwrap_err();
        assert_eq!(err, TransitionError::OnBreak);
        assert_eq!(on_break.state(), EntryState::OnBreak);
        assert!(on_break.clock_out_time.is_none());
    }

    #[test]
    fn break_guards() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let e = fresh();
        assert_eq!(e.end_break(t0).unwrap_err(), TransitionError::NoOpenBreak);

        let on_break = e.start_break(t0 + Duration::minutes(5)).unwrap();
        assert_eq!(
            on_break.start_break(t0 + Duration::minutes(6)).unwrap_err(),
            TransitionError::BreakAlreadyOpen
        );

        let closed = e.clock_out(t0 + Duration::hours(1), None, None).unwrap();
        assert!(matches!(
            closed.start_break(t0 + Duration::hours(2)),
            Err(TransitionError::EntryClosed { state: EntryState::PendingApproval })
        ));
        assert!(matches!(
            closed.clock_out(t0 + Duration::hours(2), None, None),
            Err(TransitionError::EntryClosed { .. })
        ));
    }

    #[test]
    fn transitions_before_last_event_are_refused() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let e = fresh().start_break(t0 + Duration::hours(1)).unwrap();
        assert_eq!(
            e.end_break(t0 + Duration::minutes(30)).unwrap_err(),
            TransitionError::ClockSkew
        );
        assert_eq!(
            fresh().clock_out(t0 - Duration::minutes(1), None, None).unwrap_err(),
            TransitionError::ClockSkew
        );
    }

    #[test]
    fn clock_out_records_location() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let at = Coordinate { latitude: 45.1, longitude: 9.2 };
        let e = fresh().clock_out(t0 + Duration::hours(1), Some(at), None).unwrap();
        assert_eq!(e.clock_out_lat, Some(45.1));
        assert_eq!(e.clock_out_lng, Some(9.2));
        assert_eq!(e.break_hours, Some(0.0));
        assert_eq!(e.total_hours, Some(1.0));
    }

    #[test]
    fn approval_only_from_pending() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let supervisor = Uuid::new_v4();
        let active = fresh();
        assert_eq!(
            active.approve(supervisor, t0).unwrap_err(),
            TransitionError::NotPendingApproval { state: EntryState::ClockedIn }
        );

        let closed = active.clock_out(t0 + Duration::hours(8), None, None).unwrap();
        let approved = closed.approve(supervisor, t0 + Duration::hours(9)).unwrap();
        assert_eq!(approved.state(), EntryState::Approved);
        assert_eq!(approved.approved_by, Some(supervisor));
        assert_eq!(approved.approved_at, Some(t0 + Duration::hours(9)));

        assert!(matches!(
            approved.reject(supervisor, "late".into(), t0 + Duration::hours(10)),
            Err(TransitionError::NotPendingApproval { state: EntryState::Approved })
        ));
    }

    #[test]
    fn rejection_keeps_clock_data() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let closed = fresh().clock_out(t0 + Duration::hours(8), None, None).unwrap();
        let rejected = closed
            .reject(Uuid::new_v4(), "wrong site".into(), t0 + Duration::hours(9))
            .unwrap();
        assert_eq!(rejected.state(), EntryState::Rejected);
        assert!(!rejected.is_approved);
        assert_eq!(rejected.clock_out_time, closed.clock_out_time);
        assert_eq!(rejected.total_hours, closed.total_hours);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("wrong site"));
    }

    #[test]
    fn correction_supersedes_rejected_entry() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let rejected = fresh()
            .clock_out(t0 + Duration::hours(12), None, None)
            .unwrap()
            .reject(Uuid::new_v4(), "forgot to clock out".into(), t0 + Duration::hours(13))
            .unwrap();

        let corrected = rejected
            .correction(
                CorrectionInput {
                    clock_in_time: t0,
                    clock_out_time: t0 + Duration::hours(8),
                    break_start_time: Some(t0 + Duration::hours(4)),
                    break_end_time: Some(t0 + Duration::hours(4) + Duration::minutes(30)),
                    notes: Some("corrected by supervisor".into()),
                },
                t0 + Duration::hours(14),
            )
            .unwrap();

        assert_ne!(corrected.id, rejected.id);
        assert_eq!(corrected.supersedes_id, Some(rejected.id));
        assert_eq!(corrected.user_id, rejected.user_id);
        assert_eq!(corrected.state(), EntryState::PendingApproval);
        assert_eq!(corrected.total_hours, Some(7.5));
        assert_eq!(corrected.break_hours, Some(0.5));
    }

    #[test]
    fn correction_validates_window_and_state() {
        let t0 = datetime!(2025-03-03 07:00 UTC);
        let pending = fresh().clock_out(t0 + Duration::hours(8), None, None).unwrap();
        let input = CorrectionInput {
            clock_in_time: t0,
            clock_out_time: t0 + Duration::hours(8),
            break_start_time: None,
            break_end_time: None,
            notes: None,
        };
        assert!(matches!(
            pending.correction(input.clone(), t0 + Duration::hours(9)),
            Err(TransitionError::NotRejected { .. })
        ));

        let rejected = pending.reject(Uuid::new_v4(), "no".into(), t0 + Duration::hours(9)).unwrap();
        let backwards = CorrectionInput {
            clock_out_time: t0 - Duration::hours(1),
            ..input.clone()
        };
        assert!(matches!(
            rejected.correction(backwards, t0 + Duration::hours(10)),
            Err(TransitionError::InvalidWindow(_))
        ));

        let break_outside = CorrectionInput {
            break_start_time: Some(t0 + Duration::hours(7)),
            break_end_time: Some(t0 + Duration::hours(9)),
            ..input.clone()
        };
        assert!(matches!(
            rejected.correction(break_outside, t0 + Duration::hours(10)),
            Err(TransitionError::InvalidWindow(_))
        ));

        let half_break = CorrectionInput {
            break_start_time: Some(t0 + Duration::hours(1)),
            ..input
        };
        assert!(matches!(
            rejected.correction(half_break, t0 + Duration::hours(10)),
            Err(TransitionError::InvalidWindow(_))
        ));
    }

    #[test]
    fn state_serializes_in_snake_case() {
        assert_eq!(
            serde_json::to_value(EntryState::PendingApproval).unwrap(),
            "clocked_out_pending_approval"
        );
        assert_eq!(serde_json::to_value(EntryState::OnBreak).unwrap(), "on_break");
    }
}
