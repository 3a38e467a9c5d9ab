use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Db;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
pub enum BanOrigin {
    Auto,
    Manual,
}

#[derive(Debug, Clone, FromRow)]
pub struct BannedClientRecord {
    pub id: i64,
    pub ip: String,
    pub reason: Option<String>,
    pub source: BanOrigin,
    pub banned_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBan {
    pub ip: String,
    pub reason: Option<String>,
    pub source: BanOrigin,
    pub banned_by: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        ip,
        reason,
        source,
        banned_by,
        expires_at,
        created_at
    FROM banned_clients
"#;

/// Inserts a ban; a duplicate ip surfaces as a unique violation.
pub async fn insert_ban(pool: &Db, ban: NewBan) -> Result<BannedClientRecord> {
    sqlx::query(
        r#"
        INSERT INTO banned_clients (ip, reason, source, banned_by, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&ban.ip)
    .bind(&ban.reason)
    .bind(ban.source)
    .bind(&ban.banned_by)
    .bind(ban.expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    get_ban(pool, &ban.ip)
        .await?
        .ok_or_else(|| anyhow::anyhow!("ban insert did not return row"))
}

/// Inserts or refreshes a ban for the given ip. Used by the auto-ban path so
/// a repeat offender extends an existing entry instead of erroring.
pub async fn upsert_ban(pool: &Db, ban: NewBan) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO banned_clients (ip, reason, source, banned_by, expires_at, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(ip) DO UPDATE SET
            reason = excluded.reason,
            source = excluded.source,
            banned_by = excluded.banned_by,
            expires_at = excluded.expires_at
        "#,
    )
    .bind(&ban.ip)
    .bind(&ban.reason)
    .bind(ban.source)
    .bind(&ban.banned_by)
    .bind(ban.expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_ban(pool: &Db, ip: &str) -> Result<Option<BannedClientRecord>> {
    let record = sqlx::query_as::<_, BannedClientRecord>(&format!("{SELECT_COLUMNS} WHERE ip = ?1"))
        .bind(ip)
        .fetch_optional(pool)
        .await?;

    Ok(record)
}

pub async fn list_bans(pool: &Db) -> Result<Vec<BannedClientRecord>> {
    let records =
        sqlx::query_as::<_, BannedClientRecord>(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC"))
            .fetch_all(pool)
            .await?;

    Ok(records)
}

pub async fn delete_ban(pool: &Db, ip: &str) -> Result<u64> {
    let result = sqlx::query("DELETE FROM banned_clients WHERE ip = ?1")
        .bind(ip)
        .execute(pool)
        .await?;

    Ok(result.rows_affected())
}

/// Authoritative ban check. Expired entries are removed lazily on the way in
/// so a timed-out ban never reports as active.
pub async fn is_banned(pool: &Db, ip: &str) -> Result<bool> {
    let now = Utc::now();
    sqlx::query("DELETE FROM banned_clients WHERE expires_at IS NOT NULL AND expires_at < ?1")
        .bind(now)
        .execute(pool)
        .await?;

    let row = sqlx::query("SELECT 1 FROM banned_clients WHERE ip = ?1")
        .bind(ip)
        .fetch_optional(pool)
        .await?;

    Ok(row.is_some())
}
