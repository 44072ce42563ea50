use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the turn-log schema. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // One row per finished turn
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS turn_log (
            id TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            query TEXT NOT NULL,
            answer TEXT NOT NULL,
            sources_json TEXT NOT NULL DEFAULT '[]',
            context TEXT NOT NULL,
            status TEXT NOT NULL,
            history_trimmed INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_turn_log_session ON turn_log(session_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_turn_log_created_at ON turn_log(created_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
