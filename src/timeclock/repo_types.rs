use std::net::IpAddr;

use anyhow::Context;
use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use super::geofence::{Coordinate, Geofence};
use crate::error::AppResult;

/// Job site record. Never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct JobSite {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub address: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub radius_meters: i32,
    pub qr_token: String,                // opaque, unique, never reissued
    pub is_active: bool,
    pub created_by: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl JobSite {
    /// The registered fence, if the site has coordinates.
    pub fn geofence(&self) -> Option<Geofence> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Geofence {
                center: Coordinate { latitude, longitude },
                radius_meters: self.radius_meters,
            }),
            _ => None,
        }
    }
}

/// One shift record. Its lifecycle state is derived from the timestamps,
/// see `state_machine`.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct TimeEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub job_site_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub clock_in_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub clock_out_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub break_start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub break_end_time: Option<OffsetDateTime>,
    #[serde(skip)]
    pub break_seconds: i64,              // accumulated over all closed breaks
    pub total_hours: Option<f64>,
    pub break_hours: Option<f64>,
    pub notes: Option<String>,
    pub clock_in_lat: Option<f64>,
    pub clock_in_lng: Option<f64>,
    pub clock_out_lat: Option<f64>,
    pub clock_out_lng: Option<f64>,
    pub is_approved: bool,
    pub approved_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub approved_at: Option<OffsetDateTime>,
    pub rejected_by: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub rejected_at: Option<OffsetDateTime>,
    pub rejection_reason: Option<String>,
    pub supersedes_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ClockIn,
    ClockOut,
    BreakStart,
    BreakEnd,
    Approve,
    Reject,
    Correction,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ClockIn => "clock_in",
            AuditAction::ClockOut => "clock_out",
            AuditAction::BreakStart => "break_start",
            AuditAction::BreakEnd => "break_end",
            AuditAction::Approve => "approve",
            AuditAction::Reject => "reject",
            AuditAction::Correction => "correction",
        }
    }
}

/// Append-only audit row written in the same transaction as the change.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub time_entry_id: Uuid,
    pub action: String,
    pub old_values: Option<serde_json::Value>,
    pub new_values: serde_json::Value,
    pub context: Option<serde_json::Value>,
    pub performed_by: Uuid,
    pub ip_address: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl AuditRecord {
    pub fn new(
        action: AuditAction,
        before: Option<&TimeEntry>,
        after: &TimeEntry,
        performed_by: Uuid,
        at: OffsetDateTime,
    ) -> AppResult<Self> {
        let old_values = before
            .map(serde_json::to_value)
            .transpose()
            .context("serialize audit snapshot")?;
        let new_values = serde_json::to_value(after).context("serialize audit snapshot")?;
        Ok(Self {
            id: Uuid::new_v4(),
            time_entry_id: after.id,
            action: action.as_str().to_string(),
            old_values,
            new_values,
            context: None,
            performed_by,
            ip_address: None,
            created_at: at,
        })
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.ip_address = ip.map(|ip| ip.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobSiteFilter {
    pub active_only: bool,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TimeEntryFilter {
    pub user_id: Option<Uuid>,
    pub job_site_id: Option<Uuid>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
    pub limit: i64,
    pub offset: i64,
}

impl TimeEntryFilter {
    pub fn matches(&self, e: &TimeEntry) -> bool {
        self.user_id.map_or(true, |u| e.user_id == u)
            && self.job_site_id.map_or(true, |s| e.job_site_id == s)
            && self.from.map_or(true, |f| e.clock_in_time >= f)
            && self.to.map_or(true, |t| e.clock_in_time <= t)
    }
}
