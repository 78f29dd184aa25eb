use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::geofence::GeofenceVerdict;
use super::qr::{ScanDecision, ScanOutcome};
use super::repo_types::{JobSite, TimeEntry};
use super::state_machine::EntryState;
use crate::auth::AuthUser;

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct CreateJobSiteRequest {
    pub name: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_meters: Option<i32>,
}

/// Partial update. Absent fields are left unchanged; `clear_location`
/// removes the geofence.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateJobSiteRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_meters: Option<i32>,
    #[serde(default)]
    pub clear_location: bool,
}

#[derive(Debug, Deserialize)]
pub struct JobSiteListQuery {
    #[serde(default)]
    pub active_only: bool,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

/// Job site without its QR token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSiteSummary {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_meters: i32,
    pub is_active: bool,
}

impl From<&JobSite> for JobSiteSummary {
    fn from(site: &JobSite) -> Self {
        Self {
            id: site.id,
            name: site.name.clone(),
            description: site.description.clone(),
            address: site.address.clone(),
            latitude: site.latitude,
            longitude: site.longitude,
            radius_meters: site.radius_meters,
            is_active: site.is_active,
        }
    }
}

/// Site managers get the full record; everyone else gets the summary.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum JobSiteView {
    Full(JobSite),
    Summary(JobSiteSummary),
}

impl JobSiteView {
    pub fn for_user(site: JobSite, user: &AuthUser) -> Self {
        if user.role.can_manage_sites() {
            Self::Full(site)
        } else {
            Self::Summary(JobSiteSummary::from(&site))
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Full(site) => site.id,
            Self::Summary(site) => site.id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct QrCodeResponse {
    pub job_site_id: Uuid,
    pub job_site_name: String,
    pub qr_token: String,
    pub svg: String,
}

#[derive(Debug, Deserialize)]
pub struct ScanRequest {
    pub qr_token: String,
}

#[derive(Debug, Serialize)]
pub struct ScanResponse {
    pub job_site: JobSite,
    pub can_clock_in: bool,
    pub can_clock_out: bool,
    pub message: String,
    #[serde(flatten)]
    pub outcome: ScanOutcome,
}

impl From<ScanDecision> for ScanResponse {
    fn from(d: ScanDecision) -> Self {
        Self {
            can_clock_in: d.can_clock_in(),
            can_clock_out: d.can_clock_out(),
            message: d.message(),
            outcome: d.outcome,
            job_site: d.job_site,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ClockInRequest {
    pub qr_token: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClockOutRequest {
    pub time_entry_id: Uuid,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub notes: Option<String>,
}

/// Entry as returned to clients, with its derived state. Listings also
/// embed the job site.
#[derive(Debug, Serialize)]
pub struct TimeEntryView {
    #[serde(flatten)]
    pub entry: TimeEntry,
    pub state: EntryState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_site: Option<JobSiteSummary>,
}

impl TimeEntryView {
    pub fn with_job_site(mut self, site: Option<JobSiteSummary>) -> Self {
        self.job_site = site;
        self
    }
}

impl From<TimeEntry> for TimeEntryView {
    fn from(entry: TimeEntry) -> Self {
        let state = entry.state();
        Self { entry, state, job_site: None }
    }
}

#[derive(Debug, Serialize)]
pub struct ClockActionResponse {
    pub time_entry: TimeEntryView,
    pub geofence: GeofenceVerdict,
    pub warning: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approved: bool,
    pub comments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CorrectionRequest {
    #[serde(with = "time::serde::rfc3339")]
    pub clock_in_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub clock_out_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub break_start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub break_end_time: Option<OffsetDateTime>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TimeEntryListQuery {
    pub user_id: Option<Uuid>,
    pub job_site_id: Option<Uuid>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: i64,
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}
