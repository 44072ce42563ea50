//! Turn logger implementations.
//!
//! - [`SqliteTurnLogger`] appends one row per turn to the `turn_log` table
//!   created by `rags init`. The schema is also applied when the logger is
//!   built, so `ask` and `serve` work on a fresh database.
//! - [`TracingTurnLogger`] emits one `info` event per turn.
//! - [`NoopTurnLogger`] discards everything.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::{db, migrate};
use crate::traits::{TurnLogger, TurnRecord};

/// Build the logger selected by `[turn_log].backend`.
pub async fn create_turn_logger(config: &Config) -> Result<Arc<dyn TurnLogger>> {
    match config.turn_log.backend.as_str() {
        "sqlite" => {
            let pool = db::connect(config).await?;
            migrate::apply_schema(&pool).await?;
            Ok(Arc::new(SqliteTurnLogger::new(pool)))
        }
        "tracing" => Ok(Arc::new(TracingTurnLogger)),
        "none" => Ok(Arc::new(NoopTurnLogger)),
        other => anyhow::bail!("Unknown turn_log backend: {}", other),
    }
}

pub struct SqliteTurnLogger {
    pool: SqlitePool,
}

impl SqliteTurnLogger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TurnLogger for SqliteTurnLogger {
    async fn log(&self, record: &TurnRecord) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let sources_json = serde_json::to_string(&record.sources)?;

        sqlx::query(
            r#"
            INSERT INTO turn_log
                (id, session_id, query, answer, sources_json, context, status, history_trimmed, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&record.session_id)
        .bind(&record.query)
        .bind(&record.answer)
        .bind(&sources_json)
        .bind(&record.context)
        .bind(record.status.as_str())
        .bind(record.history_trimmed)
        .bind(record.created_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

pub struct TracingTurnLogger;

#[async_trait]
impl TurnLogger for TracingTurnLogger {
    async fn log(&self, record: &TurnRecord) -> Result<()> {
        tracing::info!(
            session = %record.session_id,
            status = record.status.as_str(),
            sources = record.sources.len(),
            history_trimmed = record.history_trimmed,
            query = %record.query,
            "turn"
        );
        Ok(())
    }
}

pub struct NoopTurnLogger;

#[async_trait]
impl TurnLogger for NoopTurnLogger {
    async fn log(&self, _record: &TurnRecord) -> Result<()> {
        Ok(())
    }
}
