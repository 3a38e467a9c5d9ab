use axum::{
    Json, Router,
    extract::{Query, State},
    routing::get,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::api::{
    RELAY_MAX, RELAY_MIN, TaskAction, TaskCreateRequest, TaskListResponse, TaskResponse,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::{
    app_state::AppState,
    error::{ApiResult, AppError},
    persistence::tasks::{self as task_store, NewTask, TaskAction as StoredAction, TaskRecord},
    scheduler,
};

pub fn router() -> Router<AppState> {
    Router::new().route(
        "/api/scheduler/tasks",
        get(list_tasks).post(create_task).delete(delete_task),
    )
}

async fn list_tasks(State(state): State<AppState>) -> ApiResult<Json<TaskListResponse>> {
    let records = task_store::list_tasks(&state.db).await?;

    let mut tasks = Vec::with_capacity(records.len());
    for record in records {
        let next_run = state.scheduler.next_run(&record).await;
        tasks.push(to_response(record, next_run));
    }

    Ok(Json(TaskListResponse { tasks }))
}

async fn create_task(
    State(state): State<AppState>,
    Json(body): Json<TaskCreateRequest>,
) -> ApiResult<Json<TaskResponse>> {
    let new_task = validate_create(&body)?;
    let record = task_store::create_task(&state.db, new_task).await?;
    info!(task_id = record.id, title = %record.title, "scheduled task created");

    state.scheduler.refresh().await?;

    let next_run = state.scheduler.next_run(&record).await;
    Ok(Json(to_response(record, next_run)))
}

#[derive(Debug, Deserialize)]
struct DeleteParams {
    id: i64,
}

async fn delete_task(
    State(state): State<AppState>,
    Query(params): Query<DeleteParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let deleted = task_store::delete_task(&state.db, params.id).await?;
    if deleted == 0 {
        return Err(AppError::not_found("task not found"));
    }
    info!(task_id = params.id, "scheduled task deleted");

    state.scheduler.refresh().await?;

    Ok(Json(serde_json::json!({ "success": true })))
}

fn validate_create(body: &TaskCreateRequest) -> ApiResult<NewTask> {
    let title = body.title.trim();
    if title.is_empty() {
        return Err(AppError::bad_request("title cannot be empty"));
    }

    match (&body.cron_expression, body.execute_at) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(AppError::bad_request(
                "exactly one of cron_expression and execute_at must be set",
            ));
        }
        (Some(expr), None) => {
            if !scheduler::validate_cron(expr) {
                return Err(AppError::bad_request(format!(
                    "invalid cron expression: {expr}"
                )));
            }
        }
        (None, Some(execute_at)) => {
            if execute_at < Utc::now() - ChronoDuration::seconds(60) {
                return Err(AppError::bad_request("execute_at is in the past"));
            }
        }
    }

    let (action_type, device_id) = match body.action_type {
        TaskAction::Relay => {
            let device_id = body
                .device_id
                .ok_or_else(|| AppError::bad_request("relay tasks require device_id"))?;
            if !(RELAY_MIN..=RELAY_MAX).contains(&device_id) {
                return Err(AppError::bad_request(format!(
                    "device_id must be between {RELAY_MIN} and {RELAY_MAX}"
                )));
            }
            let value = body
                .params
                .get("value")
                .and_then(Value::as_i64)
                .ok_or_else(|| AppError::bad_request("relay tasks require params.value"))?;
            if !(0..=1).contains(&value) {
                return Err(AppError::bad_request("params.value must be 0 or 1"));
            }
            (StoredAction::Relay, Some(i64::from(device_id)))
        }
        TaskAction::Light => {
            for key in ["r", "g", "b", "w"] {
                match body.params.get(key) {
                    None | Some(Value::Null) => {}
                    Some(value) => {
                        let ok = value.as_u64().map(|v| v <= 255).unwrap_or(false);
                        if !ok {
                            return Err(AppError::bad_request(format!(
                                "params.{key} must be between 0 and 255"
                            )));
                        }
                    }
                }
            }
            (StoredAction::Light, None)
        }
    };

    Ok(NewTask {
        title: title.to_string(),
        cron_expression: body.cron_expression.clone(),
        execute_at: body.execute_at,
        action_type,
        device_id,
        params: body.params.clone(),
    })
}

fn to_response(record: TaskRecord, next_run: Option<DateTime<Utc>>) -> TaskResponse {
    TaskResponse {
        id: record.id,
        title: record.title,
        cron_expression: record.cron_expression,
        execute_at: record.execute_at,
        action_type: match record.action_type {
            StoredAction::Relay => TaskAction::Relay,
            StoredAction::Light => TaskAction::Light,
        },
        device_id: record.device_id.and_then(|id| u8::try_from(id).ok()),
        params: record.params.0,
        is_active: record.is_active,
        next_run,
        created_at: record.created_at,
    }
}
