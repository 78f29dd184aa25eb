use std::net::SocketAddr;
use axum::{Router, routing::get};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use crate::state::AppState;
use crate::timeclock;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1",
              Router::new()
                  .merge(timeclock::router())
                  .route("/health", get(|| async { "ok" }))
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    let method = req.method().clone();
                    let uri = req.uri().clone();
                    tracing::info_span!("http_request", %method, uri = %uri, status = tracing::field::Empty)
                })
                .on_response(
                    |res: &axum::http::Response<_>,
                     latency: std::time::Duration,
                     span: &tracing::Span| {
                        let status = res.status();
                        span.record("status", tracing::field::display(status));
                        let latency_ms = latency.as_millis() as u64;
                        if status.is_server_error() {
                            tracing::error!(%status, latency_ms, "response");
                        } else {
                            tracing::info!(%status, latency_ms, "response");
                        }
                    },
                ),
        )
}

pub async fn serve(app: Router) -> anyhow::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
        std::env::var("APP_PORT").unwrap_or_else(|_| "8080".into())
    )
        .parse()?;

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{JwtKeys, Role};
    use axum::{
        body::Body,
        extract::FromRef,
        http::{header, Method, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    struct Client {
        app: Router,
        keys: JwtKeys,
    }

    impl Client {
        fn new() -> Self {
            let state = AppState::fake();
            let keys = JwtKeys::from_ref(&state);
            Self { app: build_app(state), keys }
        }

        fn token(&self, role: Role) -> (Uuid, String) {
            let id = Uuid::new_v4();
            (id, self.keys.sign(id, role).unwrap())
        }

        async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
            let mut req = Request::builder().method(method).uri(uri);
            if let Some(t) = token {
                req = req.header(header::AUTHORIZATION, format!("Bearer {t}"));
            }
            let req = match body {
                Some(b) => req
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(b.to_string()))
                    .unwrap(),
                None => req.body(Body::empty()).unwrap(),
            };
            let res = self.app.clone().oneshot(req).await.unwrap();
            let status = res.status();
            let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into()))
            };
            (status, value)
        }
    }

    #[tokio::test]
    async fn health_is_public() {
        let c = Client::new();
        let (status, body) = c.call(Method::GET, "/api/v1/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("ok".into()));
    }

    #[tokio::test]
    async fn timeclock_requires_a_token() {
        let c = Client::new();
        let (status, body) = c.call(Method::GET, "/api/v1/timeclock/time-entries", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthenticated");

        let (status, _) = c
            .call(Method::GET, "/api/v1/timeclock/time-entries", Some("garbage"), None)
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn shift_over_http() {
        let c = Client::new();
        let (_, admin) = c.token(Role::Admin);
        let (_, supervisor) = c.token(Role::Supervisor);
        let (worker_id, worker) = c.token(Role::Worker);

        let (status, site) = c
            .call(
                Method::POST,
                "/api/v1/timeclock/job-sites",
                Some(admin.as_str()),
                Some(json!({ "name": "North Tower" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let token = site["qr_token"].as_str().unwrap().to_string();
        let site_id = site["id"].as_str().unwrap().to_string();

        let (status, _) = c
            .call(Method::POST, "/api/v1/timeclock/job-sites", Some(worker.as_str()), Some(json!({ "name": "X" })))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, qr) = c
            .call(Method::GET, &format!("/api/v1/timeclock/job-sites/{site_id}/qr"), Some(admin.as_str()), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(qr["svg"].as_str().unwrap().contains("<svg"));

        let (status, scan) = c
            .call(Method::POST, "/api/v1/timeclock/scan", Some(worker.as_str()), Some(json!({ "qr_token": token })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(scan["outcome"], "ready_to_clock_in");
        assert_eq!(scan["can_clock_in"], true);
        assert_eq!(scan["can_clock_out"], false);

        let (status, res) = c
            .call(Method::POST, "/api/v1/timeclock/clock-in", Some(worker.as_str()), Some(json!({ "qr_token": token, "notes": "on site" })))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(res["time_entry"]["state"], "clocked_in");
        assert_eq!(res["time_entry"]["user_id"], worker_id.to_string());
        assert_eq!(res["geofence"]["verdict"], "unenforced");
        let entry_id = res["time_entry"]["id"].as_str().unwrap().to_string();

        let (status, err) = c
            .call(Method::POST, "/api/v1/timeclock/clock-in", Some(worker.as_str()), Some(json!({ "qr_token": token })))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["reason"], "already_clocked_in");
        assert_eq!(err["active_time_entry_id"], entry_id.as_str());

        let (status, active) = c
            .call(Method::GET, "/api/v1/timeclock/time-entries/active", Some(worker.as_str()), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active["id"], entry_id.as_str());

        let (status, entry) = c
            .call(Method::POST, &format!("/api/v1/timeclock/time-entries/{entry_id}/break/start"), Some(worker.as_str()), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(entry["state"], "on_break");

        let (status, err) = c
            .call(Method::POST, "/api/v1/timeclock/clock-out", Some(worker.as_str()), Some(json!({ "time_entry_id": entry_id })))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(err["error"], "invalid_state");
        assert_eq!(err["reason"], "on_break");

        let (status, _) = c
            .call(Method::POST, &format!("/api/v1/timeclock/time-entries/{entry_id}/break/end"), Some(worker.as_str()), None)
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, res) = c
            .call(Method::POST, "/api/v1/timeclock/clock-out", Some(worker.as_str()), Some(json!({ "time_entry_id": entry_id })))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(res["time_entry"]["state"], "clocked_out_pending_approval");

        let (status, _) = c
            .call(
                Method::POST,
                &format!("/api/v1/timeclock/time-entries/{entry_id}/approve"),
                Some(worker.as_str()),
                Some(json!({ "approved": true })),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, approved) = c
            .call(
                Method::POST,
                &format!("/api/v1/timeclock/time-entries/{entry_id}/approve"),
                Some(supervisor.as_str()),
                Some(json!({ "approved": true })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(approved["state"], "approved");
        assert_eq!(approved["is_approved"], true);

        let (status, stats) = c.call(Method::GET, "/api/v1/timeclock/stats", Some(supervisor.as_str()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["employees_clocked_in"], 0);
        assert_eq!(stats["active_job_sites"], 1);
        assert_eq!(stats["pending_approvals"], 0);

        let (status, audit) = c
            .call(Method::GET, &format!("/api/v1/timeclock/time-entries/{entry_id}/audit"), Some(supervisor.as_str()), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(audit.as_array().unwrap().len(), 5);

        let (status, list) = c
            .call(Method::GET, "/api/v1/timeclock/time-entries?limit=10", Some(worker.as_str()), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list.as_array().unwrap().len(), 1);
        assert_eq!(list[0]["job_site"]["name"], "North Tower");
    }

    #[tokio::test]
    async fn workers_cannot_read_qr_tokens() {
        let c = Client::new();
        let (_, admin) = c.token(Role::Admin);
        let (_, worker) = c.token(Role::Worker);
        let (_, site) = c
            .call(Method::POST, "/api/v1/timeclock/job-sites", Some(admin.as_str()), Some(json!({ "name": "Silo" })))
            .await;
        let site_id = site["id"].as_str().unwrap().to_string();

        let (status, list) = c.call(Method::GET, "/api/v1/timeclock/job-sites", Some(worker.as_str()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list[0]["id"], site_id.as_str());
        assert!(list[0].get("qr_token").is_none());

        let (status, one) = c
            .call(Method::GET, &format!("/api/v1/timeclock/job-sites/{site_id}"), Some(worker.as_str()), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert!(one.get("qr_token").is_none());

        let (_, one) = c
            .call(Method::GET, &format!("/api/v1/timeclock/job-sites/{site_id}"), Some(admin.as_str()), None)
            .await;
        assert_eq!(one["qr_token"], site["qr_token"]);
    }

    #[tokio::test]
    async fn unknown_qr_is_not_found() {
        let c = Client::new();
        let (_, worker) = c.token(Role::Worker);
        let (status, body) = c
            .call(Method::POST, "/api/v1/timeclock/scan", Some(worker.as_str()), Some(json!({ "qr_token": "nope" })))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }
}
