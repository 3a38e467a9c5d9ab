use chrono::{DateTime, Utc};
use sqlx::FromRow;
use sqlx::types::Json;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum TaskAction {
    Relay,
    Light,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Relay => "relay",
            TaskAction::Light => "light",
        }
    }
}

/// The trigger kind a stored task resolves to. A record with both or neither
/// trigger column set resolves to `None` and is skipped by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskTrigger {
    Cron(String),
    At(DateTime<Utc>),
}

#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    pub id: i64,
    pub title: String,
    pub cron_expression: Option<String>,
    pub execute_at: Option<DateTime<Utc>>,
    pub action_type: TaskAction,
    pub device_id: Option<i64>,
    #[sqlx(rename = "params_json")]
    pub params: Json<serde_json::Value>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn trigger(&self) -> Option<TaskTrigger> {
        match (&self.cron_expression, self.execute_at) {
            (Some(expr), None) => Some(TaskTrigger::Cron(expr.clone())),
            (None, Some(at)) => Some(TaskTrigger::At(at)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub cron_expression: Option<String>,
    pub execute_at: Option<DateTime<Utc>>,
    pub action_type: TaskAction,
    pub device_id: Option<i64>,
    pub params: serde_json::Value,
}

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        title,
        cron_expression,
        execute_at,
        action_type,
        device_id,
        params_json,
        is_active,
        created_at,
        updated_at
    FROM scheduled_tasks
"#;

pub async fn create_task(pool: &Db, new_task: NewTask) -> Result<TaskRecord> {
    let now = Utc::now();
    let result = sqlx::query(
        r#"
        INSERT INTO scheduled_tasks (
            title,
            cron_expression,
            execute_at,
            action_type,
            device_id,
            params_json,
            is_active,
            created_at,
            updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)
        "#,
    )
    .bind(&new_task.title)
    .bind(&new_task.cron_expression)
    .bind(new_task.execute_at)
    .bind(new_task.action_type)
    .bind(new_task.device_id)
    .bind(Json(new_task.params))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_task(pool, result.last_insert_rowid())
        .await?
        .ok_or_else(|| anyhow::anyhow!("task insert did not return row"))
}

pub async fn get_task(pool: &Db, id: i64) -> Result<Option<TaskRecord>> {
    let record = sqlx::query_as::<_, TaskRecord>(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

pub async fn list_tasks(pool: &Db) -> Result<Vec<TaskRecord>> {
    let records =
        sqlx::query_as::<_, TaskRecord>(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC"))
            .fetch_all(pool)
            .await?;

    Ok(records)
}

pub async fn list_active_tasks(pool: &Db) -> Result<Vec<TaskRecord>> {
    let records =
        sqlx::query_as::<_, TaskRecord>(&format!("{SELECT_COLUMNS} WHERE is_active = 1"))
            .fetch_all(pool)
            .await?;

    Ok(records)
}

pub async fn delete_task(pool: &Db, id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

pub async fn set_task_active(pool: &Db, id: i64, is_active: bool) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE scheduled_tasks
        SET is_active = ?2, updated_at = ?3
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .bind(is_active)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;
    use serde_json::json;

    async fn setup_db() -> Db {
        let pool = migrations::init_pool("sqlite::memory:").await.unwrap();
        migrations::run_migrations(&pool).await.unwrap();
        pool
    }

    fn relay_task(title: &str) -> NewTask {
        NewTask {
            title: title.into(),
            cron_expression: Some("0 0 6 * * *".into()),
            execute_at: None,
            action_type: TaskAction::Relay,
            device_id: Some(5),
            params: json!({"value": 1}),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_round_trip() {
        let db = setup_db().await;
        let created = create_task(&db, relay_task("morning pump")).await.unwrap();

        assert_eq!(created.title, "morning pump");
        assert_eq!(created.action_type, TaskAction::Relay);
        assert_eq!(created.device_id, Some(5));
        assert!(created.is_active);
        assert_eq!(created.params.0["value"], 1);
        assert_eq!(
            created.trigger(),
            Some(TaskTrigger::Cron("0 0 6 * * *".into()))
        );

        let fetched = get_task(&db, created.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
    }

    #[tokio::test]
    async fn inactive_tasks_are_excluded_from_active_list() {
        let db = setup_db().await;
        let a = create_task(&db, relay_task("a")).await.unwrap();
        let b = create_task(&db, relay_task("b")).await.unwrap();

        set_task_active(&db, b.id, false).await.unwrap();

        let active = list_active_tasks(&db).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        let all = list_tasks(&db).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn delete_reports_affected_rows() {
        let db = setup_db().await;
        let task = create_task(&db, relay_task("gone")).await.unwrap();

        assert_eq!(delete_task(&db, task.id).await.unwrap(), 1);
        assert_eq!(delete_task(&db, task.id).await.unwrap(), 0);
        assert!(get_task(&db, task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflicting_triggers_resolve_to_none() {
        let db = setup_db().await;
        let mut task = relay_task("both");
        task.execute_at = Some(Utc::now());
        let created = create_task(&db, task).await.unwrap();
        assert_eq!(created.trigger(), None);

        let mut neither = relay_task("neither");
        neither.cron_expression = None;
        let created = create_task(&db, neither).await.unwrap();
        assert_eq!(created.trigger(), None);
    }
}
