use chrono::Utc;
use common::api::RateLimitSettings;
use tracing::warn;

use super::Db;
use crate::Result;

const RATE_LIMIT_KEY: &str = "rate_limit_config";

/// Reads the durable rate-limit settings row. A missing or unparseable row
/// falls back to the hardcoded defaults rather than failing the caller.
pub async fn get_rate_limit_settings(pool: &Db) -> Result<RateLimitSettings> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM system_settings WHERE key = ?1")
            .bind(RATE_LIMIT_KEY)
            .fetch_optional(pool)
            .await?;

    let Some((value,)) = row else {
        return Ok(RateLimitSettings::default());
    };

    match serde_json::from_str(&value) {
        Ok(settings) => Ok(settings),
        Err(err) => {
            warn!(?err, "rate limit settings row is unparseable, using defaults");
            Ok(RateLimitSettings::default())
        }
    }
}

pub async fn update_rate_limit_settings(pool: &Db, settings: &RateLimitSettings) -> Result<()> {
    let value = serde_json::to_string(settings)?;
    sqlx::query(
        r#"
        INSERT INTO system_settings (key, value, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(RATE_LIMIT_KEY)
    .bind(value)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::migrations;

    async fn setup_db() -> Db {
        let pool = migrations::init_pool("sqlite::memory:").await.unwrap();
        migrations::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn missing_row_yields_defaults() {
        let db = setup_db().await;
        let settings = get_rate_limit_settings(&db).await.unwrap();
        assert_eq!(settings, RateLimitSettings::default());
    }

    #[tokio::test]
    async fn update_then_read_round_trips() {
        let db = setup_db().await;
        let custom = RateLimitSettings {
            limit: 10,
            window_secs: 30,
            violation_limit: 2,
            ban_duration_secs: 600,
        };
        update_rate_limit_settings(&db, &custom).await.unwrap();
        assert_eq!(get_rate_limit_settings(&db).await.unwrap(), custom);

        let changed = RateLimitSettings { limit: 20, ..custom };
        update_rate_limit_settings(&db, &changed).await.unwrap();
        assert_eq!(get_rate_limit_settings(&db).await.unwrap(), changed);
    }

    #[tokio::test]
    async fn garbage_row_falls_back_to_defaults() {
        let db = setup_db().await;
        sqlx::query("INSERT INTO system_settings (key, value, updated_at) VALUES (?1, ?2, ?3)")
            .bind("rate_limit_config")
            .bind("{not json")
            .bind(Utc::now())
            .execute(&db)
            .await
            .unwrap();

        let settings = get_rate_limit_settings(&db).await.unwrap();
        assert_eq!(settings, RateLimitSettings::default());
    }
}
