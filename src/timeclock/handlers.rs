use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::instrument;
use uuid::Uuid;

use super::dto::{
    ApproveRequest, ClockActionResponse, ClockInRequest, ClockOutRequest, CorrectionRequest,
    CreateJobSiteRequest, JobSiteListQuery, JobSiteView, QrCodeResponse, ScanRequest, ScanResponse,
    TimeEntryListQuery, TimeEntryView, UpdateJobSiteRequest,
};
use super::repo_types::{AuditRecord, JobSite};
use super::services;
use super::stats::TimeclockStats;
use crate::{auth::AuthUser, error::AppResult, state::AppState};

pub fn job_site_routes() -> Router<AppState> {
    Router::new()
        .route("/job-sites", get(list_job_sites).post(create_job_site))
        .route("/job-sites/:id", get(get_job_site).put(update_job_site))
        .route("/job-sites/:id/deactivate", post(deactivate_job_site))
        .route("/job-sites/:id/reactivate", post(reactivate_job_site))
        .route("/job-sites/:id/qr", get(job_site_qr))
}

pub fn clock_routes() -> Router<AppState> {
    Router::new()
        .route("/scan", post(scan))
        .route("/clock-in", post(clock_in))
        .route("/clock-out", post(clock_out))
        .route("/time-entries", get(list_time_entries))
        .route("/time-entries/active", get(active_time_entry))
        .route("/time-entries/:id", get(get_time_entry))
        .route("/time-entries/:id/break/start", post(start_break))
        .route("/time-entries/:id/break/end", post(end_break))
        .route("/time-entries/:id/audit", get(time_entry_audit))
        .route("/time-entries/:id/approve", post(approve_time_entry))
        .route("/time-entries/:id/corrections", post(correct_time_entry))
        .route("/stats", get(stats))
}

// --- job sites ---

#[instrument(skip(state, payload), fields(user_id = %user.id))]
pub async fn create_job_site(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<CreateJobSiteRequest>,
) -> AppResult<(StatusCode, Json<JobSite>)> {
    let site = services::create_job_site(&state, &user, payload).await?;
    Ok((StatusCode::CREATED, Json(site)))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn list_job_sites(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<JobSiteListQuery>,
) -> AppResult<Json<Vec<JobSiteView>>> {
    Ok(Json(services::list_job_sites(&state, &user, query).await?))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn get_job_site(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobSiteView>> {
    Ok(Json(services::view_job_site(&state, &user, id).await?))
}

#[instrument(skip(state, payload), fields(user_id = %user.id))]
pub async fn update_job_site(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateJobSiteRequest>,
) -> AppResult<Json<JobSite>> {
    Ok(Json(services::update_job_site(&state, &user, id, payload).await?))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn deactivate_job_site(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobSite>> {
    Ok(Json(services::set_job_site_active(&state, &user, id, false).await?))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn reactivate_job_site(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<JobSite>> {
    Ok(Json(services::set_job_site_active(&state, &user, id, true).await?))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn job_site_qr(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<QrCodeResponse>> {
    Ok(Json(services::job_site_qr(&state, &user, id).await?))
}

// --- clock actions ---

#[instrument(skip(state, payload), fields(user_id = %user.id))]
pub async fn scan(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ScanRequest>,
) -> AppResult<Json<ScanResponse>> {
    let decision = services::scan(&state, &user, &payload.qr_token).await?;
    Ok(Json(decision.into()))
}

#[instrument(skip(state, payload), fields(user_id = %user.id))]
pub async fn clock_in(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ClockInRequest>,
) -> AppResult<(StatusCode, Json<ClockActionResponse>)> {
    let res = services::clock_in(&state, &user, payload).await?;
    Ok((StatusCode::CREATED, Json(res)))
}

#[instrument(skip(state, payload), fields(user_id = %user.id))]
pub async fn clock_out(
    State(state): State<AppState>,
    user: AuthUser,
    Json(payload): Json<ClockOutRequest>,
) -> AppResult<Json<ClockActionResponse>> {
    Ok(Json(services::clock_out(&state, &user, payload).await?))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn start_break(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TimeEntryView>> {
    Ok(Json(services::start_break(&state, &user, id).await?.into()))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn end_break(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TimeEntryView>> {
    Ok(Json(services::end_break(&state, &user, id).await?.into()))
}

// --- reads & review ---

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn list_time_entries(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<TimeEntryListQuery>,
) -> AppResult<Json<Vec<TimeEntryView>>> {
    Ok(Json(services::list_entries(&state, &user, query).await?))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn active_time_entry(
    State(state): State<AppState>,
    user: AuthUser,
) -> AppResult<Json<Option<TimeEntryView>>> {
    let entry = services::active_entry(&state, &user).await?;
    Ok(Json(entry.map(TimeEntryView::from)))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn get_time_entry(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TimeEntryView>> {
    Ok(Json(services::get_entry(&state, &user, id).await?.into()))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn time_entry_audit(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<AuditRecord>>> {
    Ok(Json(services::entry_audit(&state, &user, id).await?))
}

#[instrument(skip(state, payload), fields(user_id = %user.id))]
pub async fn approve_time_entry(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ApproveRequest>,
) -> AppResult<Json<TimeEntryView>> {
    Ok(Json(services::review_entry(&state, &user, id, payload).await?.into()))
}

#[instrument(skip(state, payload), fields(user_id = %user.id))]
pub async fn correct_time_entry(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<CorrectionRequest>,
) -> AppResult<(StatusCode, Json<TimeEntryView>)> {
    let corrected = services::correct_entry(&state, &user, id, payload).await?;
    Ok((StatusCode::CREATED, Json(corrected.into())))
}

#[instrument(skip(state), fields(user_id = %user.id))]
pub async fn stats(State(state): State<AppState>, user: AuthUser) -> AppResult<Json<TimeclockStats>> {
    Ok(Json(services::stats(&state, &user).await?))
}
