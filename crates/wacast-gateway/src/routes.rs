//! API route handlers for the gateway.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{Value, json};
use wacast_core::error::WacastError;
use wacast_core::jid::normalize_number;
use wacast_core::time::{build_delivery_window, format_local, now_ms};
use wacast_core::types::{
    Audience, Block, FlowProgress, Job, JobPayload, JobStatus, LogEntry, MediaInfo,
    MessageFlow, ReplyMode, SmallDuration,
};

use super::server::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn api_error(e: WacastError) -> (StatusCode, Json<Value>) {
    let status = match &e {
        WacastError::StoreBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
        WacastError::InvalidJob(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "ok": false, "error": e.to_string() })))
}

fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "ok": false, "error": format!("{what} not found") })),
    )
}

fn job_view(job: &Job) -> Value {
    let mut view = serde_json::to_value(job).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut view {
        map.insert("target_label".into(), json!(format_local(job.target_ms)));
    }
    view
}

/// Health check endpoint.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "wacast-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
pub struct UserQuery {
    pub user: String,
}

#[derive(Debug, Deserialize)]
pub struct UserBody {
    pub user_id: String,
}

/// List one user's jobs, newest first.
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> ApiResult {
    let doc = state.store.read().await.map_err(api_error)?;
    let mut jobs: Vec<&Job> = doc.jobs.iter().filter(|j| j.user_id == query.user).collect();
    jobs.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
    Ok(Json(json!({
        "ok": true,
        "jobs": jobs.iter().map(|j| job_view(j)).collect::<Vec<_>>(),
    })))
}

/// Job creation request. The two kinds share scheduling fields but
/// nothing else, mirroring the stored payload split.
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CreateJobRequest {
    StatusBroadcast {
        user_id: String,
        delay: SmallDuration,
        media: MediaInfo,
        #[serde(default)]
        caption: Option<String>,
        audience: Audience,
    },
    MessageFlow {
        user_id: String,
        delay: SmallDuration,
        destination: String,
        initial_text: String,
        #[serde(default)]
        media: Option<MediaInfo>,
        #[serde(default)]
        blocks: Vec<Block>,
    },
}

fn validate_blocks(blocks: &[Block]) -> Result<(), WacastError> {
    for block in blocks {
        match block {
            Block::Send { text, .. } if text.trim().is_empty() => {
                return Err(WacastError::InvalidJob("send block needs text".into()));
            }
            Block::WaitReply { mode: ReplyMode::Exact, expected_text, .. }
                if expected_text.as_deref().map(str::trim).unwrap_or("").is_empty() =>
            {
                return Err(WacastError::InvalidJob(
                    "exact wait block needs an expected text".into(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Create a job. Status broadcasts get their delivery windows computed
/// here, once, from `now + delay`.
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult {
    let now = now_ms();

    let (user_id, target_ms, payload) = match request {
        CreateJobRequest::StatusBroadcast { user_id, delay, media, caption, audience } => {
            if media.relative_path.trim().is_empty() {
                return Err(api_error(WacastError::InvalidJob("media path is empty".into())));
            }
            if !state.store.resolve_relative(&media.relative_path).exists() {
                return Err(api_error(WacastError::InvalidJob("media file not found".into())));
            }
            let target_ms = now + delay.to_ms();
            let window = build_delivery_window(target_ms);
            (
                user_id,
                target_ms,
                JobPayload::StatusBroadcast { window, media, caption, audience },
            )
        }
        CreateJobRequest::MessageFlow {
            user_id,
            delay,
            destination,
            initial_text,
            media,
            blocks,
        } => {
            let Some(number) = normalize_number(&destination) else {
                return Err(api_error(WacastError::InvalidJob(
                    "invalid destination number".into(),
                )));
            };
            if initial_text.trim().is_empty() {
                return Err(api_error(WacastError::InvalidJob(
                    "initial message text is empty".into(),
                )));
            }
            validate_blocks(&blocks).map_err(api_error)?;
            (
                user_id,
                now + delay.to_ms(),
                JobPayload::MessageFlow {
                    flow: MessageFlow {
                        destination: number,
                        initial_text,
                        media,
                        blocks,
                        progress: FlowProgress::default(),
                    },
                },
            )
        }
    };

    let job = Job {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        created_at_ms: now,
        target_ms,
        status: JobStatus::Queued,
        attempt_count: 0,
        last_attempt_at_ms: None,
        next_retry_at_ms: None,
        last_error: None,
        finished_at_ms: None,
        payload,
    };
    let created = job.clone();

    state
        .store
        .update(move |doc| {
            if !doc.users.iter().any(|u| u.id == user_id) {
                return Err(WacastError::InvalidJob("unknown user".into()));
            }
            doc.push_log(LogEntry {
                id: uuid::Uuid::new_v4().to_string(),
                at_ms: now,
                user_id: Some(user_id.clone()),
                kind: "job_created".into(),
                detail: json!({ "job_id": job.id }),
            });
            doc.jobs.push(job);
            Ok(())
        })
        .await
        .map_err(api_error)?;

    tracing::info!(job = %created.id, "job created");
    Ok(Json(json!({ "ok": true, "job": job_view(&created) })))
}

/// Cancel a job. Terminal jobs are left untouched (a no-op, not an
/// error), so the worker and the user cannot fight over the outcome.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UserBody>,
) -> ApiResult {
    let mut found = false;
    let mut cancelled = false;
    let mut final_status = None;

    let job_id = id.clone();
    let user_id = body.user_id.clone();
    state
        .store
        .update(|doc| {
            let Some(job) = doc.find_job_mut(&job_id, &user_id) else {
                return Ok(());
            };
            found = true;
            if job.is_active() {
                job.status = JobStatus::Cancel;
                job.finished_at_ms = Some(now_ms());
                job.next_retry_at_ms = None;
                cancelled = true;
                state.store.gc_job_media(doc, &job_id);
                doc.push_log(LogEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    at_ms: now_ms(),
                    user_id: Some(user_id.clone()),
                    kind: "job_cancelled".into(),
                    detail: json!({ "job_id": job_id, "reason": "user_request" }),
                });
            }
            final_status = doc.find_job(&job_id, &user_id).map(|j| j.status);
            Ok(())
        })
        .await
        .map_err(api_error)?;

    if !found {
        return Err(not_found("job"));
    }
    Ok(Json(json!({ "ok": true, "cancelled": cancelled, "status": final_status })))
}

/// Remove all finished jobs (success, cancel, failed) for one user and
/// collect their media.
pub async fn clear_completed(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UserBody>,
) -> ApiResult {
    let mut removed = 0usize;
    let user_id = body.user_id.clone();

    state
        .store
        .update(|doc| {
            let finished: Vec<String> = doc
                .jobs
                .iter()
                .filter(|j| {
                    j.user_id == user_id
                        && matches!(
                            j.status,
                            JobStatus::Success | JobStatus::Cancel | JobStatus::Failed
                        )
                })
                .map(|j| j.id.clone())
                .collect();
            for job_id in &finished {
                state.store.gc_job_media(doc, job_id);
            }
            removed = finished.len();
            doc.jobs.retain(|j| !finished.contains(&j.id));
            if removed > 0 {
                doc.push_log(LogEntry {
                    id: uuid::Uuid::new_v4().to_string(),
                    at_ms: now_ms(),
                    user_id: Some(user_id.clone()),
                    kind: "completed_jobs_cleared".into(),
                    detail: json!({ "count": removed }),
                });
            }
            Ok(())
        })
        .await
        .map_err(api_error)?;

    Ok(Json(json!({ "ok": true, "removed": removed })))
}

/// One user's WhatsApp connection record.
pub async fn wa_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UserQuery>,
) -> ApiResult {
    let doc = state.store.read().await.map_err(api_error)?;
    let Some(wa) = doc.wa_by_user.get(&query.user) else {
        return Err(not_found("user"));
    };
    Ok(Json(json!({ "ok": true, "wa": wa })))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

/// Recent activity log, most recent first.
pub async fn recent_log(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LogQuery>,
) -> ApiResult {
    let doc = state.store.read().await.map_err(api_error)?;
    let entries: Vec<&LogEntry> = doc
        .log
        .iter()
        .filter(|e| match &query.user {
            Some(user) => e.user_id.as_deref() == Some(user.as_str()),
            None => true,
        })
        .take(query.limit)
        .collect();
    Ok(Json(json!({ "ok": true, "log": entries })))
}
