use std::collections::HashMap;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::dto::{
    clamp_limit, ApproveRequest, ClockActionResponse, ClockInRequest, ClockOutRequest,
    CorrectionRequest, CreateJobSiteRequest, JobSiteListQuery, JobSiteSummary, JobSiteView,
    QrCodeResponse, TimeEntryListQuery, TimeEntryView, UpdateJobSiteRequest,
};
use super::geofence::{
    Coordinate, GeofenceVerdict, DEFAULT_RADIUS_METERS, MAX_RADIUS_METERS, MIN_RADIUS_METERS,
};
use super::qr::{self, ScanDecision};
use super::repo_types::{AuditAction, AuditRecord, JobSite, JobSiteFilter, TimeEntry, TimeEntryFilter};
use super::state_machine::{self, CorrectionInput};
use super::stats::{StatsWindow, TimeclockStats};
use crate::auth::AuthUser;
use crate::error::{AppError, AppResult, Conflict};
use crate::state::AppState;

const QR_TOKEN_ATTEMPTS: usize = 3;

fn validate_radius(radius: i32) -> AppResult<i32> {
    if !(MIN_RADIUS_METERS..=MAX_RADIUS_METERS).contains(&radius) {
        return Err(AppError::validation(format!(
            "radius_meters must be within [{MIN_RADIUS_METERS}, {MAX_RADIUS_METERS}], got {radius}"
        )));
    }
    Ok(radius)
}

fn validate_name(name: &str) -> AppResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::validation("name must not be empty"));
    }
    Ok(name.to_string())
}

fn non_blank(s: Option<String>) -> Option<String> {
    s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Logs a refused transition before handing the error back.
fn log_refusal(op: &'static str, user_id: Uuid, entry_id: Uuid) -> impl FnOnce(AppError) -> AppError {
    move |e| {
        match &e {
            AppError::InvalidState(guard) => {
                warn!(%user_id, time_entry_id = %entry_id, reason = guard.reason(), op, "transition refused")
            }
            AppError::Conflict(_) | AppError::Geofence(_) => {
                warn!(%user_id, time_entry_id = %entry_id, error = %e, op, "transition refused")
            }
            _ => {}
        }
        e
    }
}

// ---- job sites ----

pub async fn create_job_site(
    state: &AppState,
    user: &AuthUser,
    req: CreateJobSiteRequest,
) -> AppResult<JobSite> {
    user.require_site_admin()?;
    let name = validate_name(&req.name)?;
    let radius_meters = validate_radius(req.radius_meters.unwrap_or(DEFAULT_RADIUS_METERS))?;
    let location = Coordinate::from_pair(req.latitude, req.longitude)?;
    let now = state.clock.now();

    let mut site = JobSite {
        id: Uuid::new_v4(),
        name,
        description: non_blank(req.description),
        address: non_blank(req.address),
        latitude: location.map(|c| c.latitude),
        longitude: location.map(|c| c.longitude),
        radius_meters,
        qr_token: qr::generate_token(),
        is_active: true,
        created_by: user.id,
        created_at: now,
        updated_at: now,
    };

    // Redraw on the (rare) unique-index collision.
    let mut attempt = 1;
    loop {
        match state.repo.insert_job_site(&site).await {
            Ok(()) => break,
            Err(AppError::Conflict(Conflict::QrTokenTaken)) if attempt < QR_TOKEN_ATTEMPTS => {
                warn!(job_site_id = %site.id, attempt, "qr token collision, regenerating");
                site.qr_token = qr::generate_token();
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!(job_site_id = %site.id, user_id = %user.id, name = %site.name, "job site created");
    Ok(site)
}

pub async fn get_job_site(state: &AppState, id: Uuid) -> AppResult<JobSite> {
    state
        .repo
        .find_job_site(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("job site {id} not found")))
}

/// Job site as the caller may see it. Only site managers get the QR token.
pub async fn view_job_site(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<JobSiteView> {
    let site = get_job_site(state, id).await?;
    Ok(JobSiteView::for_user(site, user))
}

pub async fn list_job_sites(
    state: &AppState,
    user: &AuthUser,
    query: JobSiteListQuery,
) -> AppResult<Vec<JobSiteView>> {
    let filter = JobSiteFilter {
        active_only: query.active_only,
        limit: clamp_limit(query.limit),
        offset: query.offset.max(0),
    };
    let sites = state.repo.list_job_sites(&filter).await?;
    Ok(sites.into_iter().map(|site| JobSiteView::for_user(site, user)).collect())
}

pub async fn update_job_site(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    req: UpdateJobSiteRequest,
) -> AppResult<JobSite> {
    user.require_site_admin()?;
    let mut site = get_job_site(state, id).await?;

    if let Some(name) = req.name {
        site.name = validate_name(&name)?;
    }
    if req.description.is_some() {
        site.description = non_blank(req.description);
    }
    if req.address.is_some() {
        site.address = non_blank(req.address);
    }
    if let Some(radius) = req.radius_meters {
        site.radius_meters = validate_radius(radius)?;
    }
    if req.clear_location {
        if req.latitude.is_some() || req.longitude.is_some() {
            return Err(AppError::validation(
                "clear_location cannot be combined with new coordinates",
            ));
        }
        site.latitude = None;
        site.longitude = None;
    } else if let Some(c) = Coordinate::from_pair(req.latitude, req.longitude)? {
        site.latitude = Some(c.latitude);
        site.longitude = Some(c.longitude);
    }
    site.updated_at = state.clock.now();

    let site = state.repo.update_job_site(&site).await?;
    info!(job_site_id = %site.id, user_id = %user.id, "job site updated");
    Ok(site)
}

/// Deactivates or reactivates a site. The QR token is never touched.
pub async fn set_job_site_active(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    active: bool,
) -> AppResult<JobSite> {
    user.require_site_admin()?;
    let site = get_job_site(state, id).await?;
    if site.is_active == active {
        return Ok(site);
    }
    let site = state.repo.set_job_site_active(id, active, state.clock.now()).await?;
    info!(job_site_id = %site.id, user_id = %user.id, active, "job site activation changed");
    Ok(site)
}

pub async fn job_site_qr(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<QrCodeResponse> {
    user.require_site_admin()?;
    let site = get_job_site(state, id).await?;
    let svg = qr::render_svg(&site.qr_token)?;
    Ok(QrCodeResponse {
        job_site_id: site.id,
        job_site_name: site.name,
        qr_token: site.qr_token,
        svg,
    })
}

// ---- scanning ----

/// Looks up an active site by scanned token. Malformed tokens never reach
/// the store.
async fn resolve_active_site(state: &AppState, token: &str) -> AppResult<JobSite> {
    let token = token.trim();
    if !qr::is_well_formed(token) {
        return Err(AppError::not_found("unknown QR code"));
    }
    match state.repo.find_job_site_by_qr(token).await? {
        Some(site) if site.is_active => Ok(site),
        Some(site) => {
            warn!(job_site_id = %site.id, "scan of inactive job site");
            Err(AppError::not_found("job site is not active"))
        }
        None => Err(AppError::not_found("unknown QR code")),
    }
}

/// Read-only: never mutates anything, so re-scanning is always safe.
pub async fn scan(state: &AppState, user: &AuthUser, token: &str) -> AppResult<ScanDecision> {
    let site = resolve_active_site(state, token).await?;
    let active = state.repo.find_active_entry(user.id).await?;
    Ok(ScanDecision::resolve(site, active.as_ref()))
}

// ---- clock actions ----

fn enforce_geofence(state: &AppState, verdict: &GeofenceVerdict) -> AppResult<Option<String>> {
    Ok(state.config.geofence_policy.enforce(verdict)?)
}

pub async fn clock_in(
    state: &AppState,
    user: &AuthUser,
    req: ClockInRequest,
) -> AppResult<ClockActionResponse> {
    let location = Coordinate::from_pair(req.latitude, req.longitude)?;
    let site = resolve_active_site(state, &req.qr_token).await?;

    // The one-active-entry rule outranks the geofence; the insert below still
    // settles races.
    if let Some(active) = state.repo.find_active_entry(user.id).await? {
        warn!(user_id = %user.id, job_site_id = %site.id, "clock-in refused: already clocked in");
        return Err(Conflict::AlreadyClockedIn { active_time_entry_id: Some(active.id) }.into());
    }

    let verdict = GeofenceVerdict::evaluate(site.geofence(), location);
    let warning = enforce_geofence(state, &verdict).map_err(|e| {
        warn!(user_id = %user.id, job_site_id = %site.id, verdict = verdict.as_str(), "clock-in blocked by geofence");
        e
    })?;

    let now = state.clock.now();
    let entry = state_machine::clock_in(user.id, site.id, location, non_blank(req.notes), now);
    let audit = AuditRecord::new(AuditAction::ClockIn, None, &entry, user.id, now)?
        .with_context(json!({ "geofence": verdict }))
        .with_ip(user.ip_address);

    match state.repo.insert_entry(&entry, &audit).await {
        Ok(()) => {}
        Err(AppError::Conflict(Conflict::AlreadyClockedIn { active_time_entry_id: None })) => {
            let active = state.repo.find_active_entry(user.id).await?.map(|e| e.id);
            warn!(user_id = %user.id, job_site_id = %site.id, "clock-in refused: already clocked in");
            return Err(Conflict::AlreadyClockedIn { active_time_entry_id: active }.into());
        }
        Err(e @ AppError::Conflict(_)) => {
            warn!(user_id = %user.id, job_site_id = %site.id, error = %e, "clock-in refused");
            return Err(e);
        }
        Err(e) => return Err(e),
    }

    info!(
        user_id = %user.id,
        job_site_id = %site.id,
        time_entry_id = %entry.id,
        geofence = verdict.as_str(),
        "clocked in"
    );
    Ok(ClockActionResponse {
        time_entry: entry.into(),
        geofence: verdict,
        warning,
    })
}

/// Loads an entry the caller may act on as its owner.
async fn owned_entry(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<TimeEntry> {
    let entry = state
        .repo
        .find_entry(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("time entry {id} not found")))?;
    if entry.user_id != user.id {
        warn!(user_id = %user.id, time_entry_id = %id, "clock action on another user's entry");
        return Err(AppError::unauthorized("time entry belongs to another user"));
    }
    Ok(entry)
}

pub async fn clock_out(
    state: &AppState,
    user: &AuthUser,
    req: ClockOutRequest,
) -> AppResult<ClockActionResponse> {
    let location = Coordinate::from_pair(req.latitude, req.longitude)?;
    let entry = owned_entry(state, user, req.time_entry_id).await?;

    // Inactive sites still accept clock-outs for entries already in progress.
    let site = get_job_site(state, entry.job_site_id).await?;
    let verdict = GeofenceVerdict::evaluate(site.geofence(), location);
    let enforced = state.config.geofence_policy.enforce(&verdict);

    let now = state.clock.now();
    let notes = non_blank(req.notes);
    let context = json!({ "geofence": verdict });
    let user_id = user.id;
    let updated = state
        .repo
        .transition_entry(entry.id, &|current: &TimeEntry| -> AppResult<(TimeEntry, AuditRecord)> {
            // State guards run before the geofence policy.
            let next = current.clock_out(now, location, notes.clone())?;
            if let Err(rejection) = &enforced {
                return Err((*rejection).into());
            }
            let audit = AuditRecord::new(AuditAction::ClockOut, Some(current), &next, user_id, now)?
                .with_context(context.clone())
                .with_ip(user.ip_address);
            Ok((next, audit))
        })
        .await
        .map_err(log_refusal("clock_out", user.id, entry.id))?;
    let warning = enforced.ok().flatten();

    info!(
        user_id = %user.id,
        time_entry_id = %updated.id,
        total_hours = updated.total_hours.unwrap_or_default(),
        geofence = verdict.as_str(),
        "clocked out"
    );
    Ok(ClockActionResponse {
        time_entry: updated.into(),
        geofence: verdict,
        warning,
    })
}

pub async fn start_break(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<TimeEntry> {
    owned_entry(state, user, id).await?;
    let now = state.clock.now();
    let user_id = user.id;
    let updated = state
        .repo
        .transition_entry(id, &|current: &TimeEntry| -> AppResult<(TimeEntry, AuditRecord)> {
            let next = current.start_break(now)?;
            let audit = AuditRecord::new(AuditAction::BreakStart, Some(current), &next, user_id, now)?
                .with_ip(user.ip_address);
            Ok((next, audit))
        })
        .await
        .map_err(log_refusal("break_start", user.id, id))?;
    info!(user_id = %user.id, time_entry_id = %id, "break started");
    Ok(updated)
}

pub async fn end_break(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<TimeEntry> {
    owned_entry(state, user, id).await?;
    let now = state.clock.now();
    let user_id = user.id;
    let updated = state
        .repo
        .transition_entry(id, &|current: &TimeEntry| -> AppResult<(TimeEntry, AuditRecord)> {
            let next = current.end_break(now)?;
            let audit = AuditRecord::new(AuditAction::BreakEnd, Some(current), &next, user_id, now)?
                .with_ip(user.ip_address);
            Ok((next, audit))
        })
        .await
        .map_err(log_refusal("break_end", user.id, id))?;
    info!(
        user_id = %user.id,
        time_entry_id = %id,
        break_hours = updated.break_hours.unwrap_or_default(),
        "break ended"
    );
    Ok(updated)
}

// ---- approval ----

/// Approves, or rejects with `comments` as the reason.
pub async fn review_entry(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    req: ApproveRequest,
) -> AppResult<TimeEntry> {
    user.require_reviewer()?;
    let comments = non_blank(req.comments);
    if !req.approved && comments.is_none() {
        return Err(AppError::validation("comments are required when rejecting an entry"));
    }

    let now = state.clock.now();
    let reviewer = user.id;
    let approved = req.approved;
    let context = json!({ "comments": comments });
    let updated = state
        .repo
        .transition_entry(id, &|current: &TimeEntry| -> AppResult<(TimeEntry, AuditRecord)> {
            let (action, next) = if approved {
                (AuditAction::Approve, current.approve(reviewer, now)?)
            } else {
                let reason = comments.clone().unwrap_or_default();
                (AuditAction::Reject, current.reject(reviewer, reason, now)?)
            };
            let audit = AuditRecord::new(action, Some(current), &next, reviewer, now)?
                .with_context(context.clone())
                .with_ip(user.ip_address);
            Ok((next, audit))
        })
        .await
        .map_err(log_refusal("review", user.id, id))?;

    info!(
        user_id = %user.id,
        time_entry_id = %id,
        owner_id = %updated.user_id,
        state = %updated.state(),
        "time entry reviewed"
    );
    Ok(updated)
}

/// Creates a new pending entry replacing a rejected one.
pub async fn correct_entry(
    state: &AppState,
    user: &AuthUser,
    id: Uuid,
    req: CorrectionRequest,
) -> AppResult<TimeEntry> {
    user.require_reviewer()?;
    let rejected = state
        .repo
        .find_entry(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("time entry {id} not found")))?;

    let now = state.clock.now();
    let input = CorrectionInput {
        clock_in_time: req.clock_in_time,
        clock_out_time: req.clock_out_time,
        break_start_time: req.break_start_time,
        break_end_time: req.break_end_time,
        notes: non_blank(req.notes),
    };
    let corrected = rejected
        .correction(input, now)
        .map_err(AppError::from)
        .map_err(log_refusal("correction", user.id, id))?;

    let audit = AuditRecord::new(AuditAction::Correction, Some(&rejected), &corrected, user.id, now)?
        .with_context(json!({ "supersedes_id": rejected.id }))
        .with_ip(user.ip_address);
    state
        .repo
        .insert_entry(&corrected, &audit)
        .await
        .map_err(log_refusal("correction", user.id, id))?;

    info!(
        user_id = %user.id,
        time_entry_id = %corrected.id,
        supersedes_id = %rejected.id,
        "correction created"
    );
    Ok(corrected)
}

// ---- reads ----

pub async fn list_entries(
    state: &AppState,
    user: &AuthUser,
    query: TimeEntryListQuery,
) -> AppResult<Vec<TimeEntryView>> {
    if let (Some(from), Some(to)) = (query.from, query.to) {
        if from > to {
            return Err(AppError::validation("`from` must not be after `to`"));
        }
    }
    let user_id = if user.role.can_review() {
        query.user_id
    } else {
        Some(user.id)
    };
    let filter = TimeEntryFilter {
        user_id,
        job_site_id: query.job_site_id,
        from: query.from,
        to: query.to,
        limit: clamp_limit(query.limit),
        offset: query.offset.max(0),
    };
    let entries = state.repo.list_entries(&filter).await?;

    let mut sites: HashMap<Uuid, Option<JobSiteSummary>> = HashMap::new();
    let mut views = Vec::with_capacity(entries.len());
    for entry in entries {
        let site = match sites.get(&entry.job_site_id) {
            Some(site) => site.clone(),
            None => {
                let site = state
                    .repo
                    .find_job_site(entry.job_site_id)
                    .await?
                    .as_ref()
                    .map(JobSiteSummary::from);
                sites.insert(entry.job_site_id, site.clone());
                site
            }
        };
        views.push(TimeEntryView::from(entry).with_job_site(site));
    }
    Ok(views)
}

pub async fn active_entry(state: &AppState, user: &AuthUser) -> AppResult<Option<TimeEntry>> {
    state.repo.find_active_entry(user.id).await
}

pub async fn get_entry(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<TimeEntry> {
    let entry = state
        .repo
        .find_entry(id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("time entry {id} not found")))?;
    user.require_owner_or_reviewer(entry.user_id)?;
    Ok(entry)
}

pub async fn entry_audit(state: &AppState, user: &AuthUser, id: Uuid) -> AppResult<Vec<AuditRecord>> {
    user.require_reviewer()?;
    if state.repo.find_entry(id).await?.is_none() {
        return Err(AppError::not_found(format!("time entry {id} not found")));
    }
    state.repo.list_audit(id).await
}

pub async fn stats(state: &AppState, user: &AuthUser) -> AppResult<TimeclockStats> {
    user.require_reviewer()?;
    let window = StatsWindow::containing(state.clock.now());
    state.repo.stats(&window).await
}
