//! QR tokens and scan resolution.

use base64ct::{Base64UrlUnpadded, Encoding};
use lazy_static::lazy_static;
use qrcode::{render::svg, QrCode};
use rand::{rngs::OsRng, RngCore};
use regex::Regex;
use serde::Serialize;
use uuid::Uuid;

use super::repo_types::{JobSite, TimeEntry};
use super::state_machine::EntryState;
use crate::error::{AppError, AppResult};

pub const TOKEN_PREFIX: &str = "site_";
const TOKEN_BYTES: usize = 24;

/// A fresh, non-guessable token: prefix plus 192 random bits, URL-safe.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    format!("{TOKEN_PREFIX}{}", Base64UrlUnpadded::encode_string(&bytes))
}

/// Cheap shape check so arbitrary scanned strings never reach the store.
pub fn is_well_formed(token: &str) -> bool {
    lazy_static! {
        static ref TOKEN_RE: Regex = Regex::new(r"^site_[A-Za-z0-9_-]{32}$").unwrap();
    }
    TOKEN_RE.is_match(token)
}

/// SVG rendering of the token for printing at the site.
pub fn render_svg(token: &str) -> AppResult<String> {
    let code = QrCode::new(token.as_bytes())
        .map_err(|e| AppError::Internal(anyhow::anyhow!("qr encode failed: {e}")))?;
    Ok(code
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .dark_color(svg::Color("#000000"))
        .light_color(svg::Color("#ffffff"))
        .build())
}

/// What the scanning user may do at this site.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// No active entry anywhere.
    ReadyToClockIn,
    /// Active entry belongs to the scanned site.
    ClockedInHere { active_time_entry_id: Uuid, on_break: bool },
    /// Active entry belongs to another site; informational only.
    ActiveElsewhere { active_time_entry_id: Uuid, active_job_site_id: Uuid },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanDecision {
    pub job_site: JobSite,
    pub outcome: ScanOutcome,
}

impl ScanDecision {
    /// Pure: derives the decision from the resolved site and the caller's
    /// active entry.
    pub fn resolve(job_site: JobSite, active: Option<&TimeEntry>) -> Self {
        let outcome = match active {
            None => ScanOutcome::ReadyToClockIn,
            Some(entry) if entry.job_site_id == job_site.id => ScanOutcome::ClockedInHere {
                active_time_entry_id: entry.id,
                on_break: entry.state() == EntryState::OnBreak,
            },
            Some(entry) => ScanOutcome::ActiveElsewhere {
                active_time_entry_id: entry.id,
                active_job_site_id: entry.job_site_id,
            },
        };
        Self { job_site, outcome }
    }

    pub fn can_clock_in(&self) -> bool {
        matches!(self.outcome, ScanOutcome::ReadyToClockIn)
    }

    pub fn can_clock_out(&self) -> bool {
        matches!(self.outcome, ScanOutcome::ClockedInHere { .. })
    }

    pub fn active_time_entry_id(&self) -> Option<Uuid> {
        match self.outcome {
            ScanOutcome::ReadyToClockIn => None,
            ScanOutcome::ClockedInHere { active_time_entry_id, .. }
            | ScanOutcome::ActiveElsewhere { active_time_entry_id, .. } => Some(active_time_entry_id),
        }
    }

    pub fn message(&self) -> String {
        let site = &self.job_site.name;
        match self.outcome {
            ScanOutcome::ReadyToClockIn => format!("Ready to clock in at {site}."),
            ScanOutcome::ClockedInHere { on_break: true, .. } => {
                format!("You are on a break at {site}. End the break before clocking out.")
            }
            ScanOutcome::ClockedInHere { on_break: false, .. } => {
                format!("You are clocked in at {site}. You can clock out or take a break.")
            }
            ScanOutcome::ActiveElsewhere { .. } => {
                "You are already clocked in at another job site. Clock out there first.".to_string()
            }
        }
    }
}
