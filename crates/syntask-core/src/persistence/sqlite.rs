// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed run store.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::OrchestrationError;
use crate::migrations;
use crate::states::{State, StateDetails, StateType};

use super::{LateRunCandidate, LateRunQuery, NewRun, RunRecord, RunStore};

const SELECT_RUN: &str = r#"
    SELECT id, kind, flow_id, name, state_id, state_type, state_name, state_timestamp,
           state_message, state_details, next_scheduled_start_time, created_at, updated_at
    FROM runs
    WHERE id = ?
"#;

/// SQLite-backed run store.
#[derive(Clone)]
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteRunStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRunStore")
            .field("connections", &self.pool.size())
            .finish()
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    kind: String,
    flow_id: Uuid,
    name: String,
    state_id: Uuid,
    state_type: String,
    state_name: String,
    state_timestamp: DateTime<Utc>,
    state_message: Option<String>,
    state_details: String,
    next_scheduled_start_time: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = OrchestrationError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let state = decode_state(
            row.state_id,
            &row.state_type,
            row.state_name,
            row.state_timestamp,
            row.state_message,
            &row.state_details,
        )?;

        Ok(RunRecord {
            id: row.id,
            kind: row
                .kind
                .parse()
                .map_err(|e| OrchestrationError::database("decode", e))?,
            flow_id: row.flow_id,
            name: row.name,
            state,
            next_scheduled_start_time: row.next_scheduled_start_time,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StateRow {
    id: Uuid,
    state_type: String,
    name: String,
    timestamp: DateTime<Utc>,
    message: Option<String>,
    details: String,
}

fn decode_state(
    id: Uuid,
    state_type: &str,
    name: String,
    timestamp: DateTime<Utc>,
    message: Option<String>,
    details: &str,
) -> Result<State, OrchestrationError> {
    let state_type: StateType = state_type
        .parse()
        .map_err(|e| OrchestrationError::database("decode", e))?;
    let details: StateDetails = serde_json::from_str(details)?;

    Ok(State {
        id,
        state_type,
        name,
        timestamp,
        message,
        details,
    })
}

/// Scheduled start time tracked on the run row for a state.
fn next_scheduled_start_time(state: &State) -> Option<DateTime<Utc>> {
    match state.state_type {
        StateType::Scheduled => state.details.scheduled_time,
        _ => None,
    }
}

impl SqliteRunStore {
    /// Create a store from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to `url` and run the embedded migrations.
    pub async fn from_url(url: &str) -> Result<Self, OrchestrationError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| {
                OrchestrationError::database("connect", format!("{url}: {e}"))
            })?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// Open (creating if needed) a database file and run the embedded migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, OrchestrationError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                OrchestrationError::database(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        Self::from_url(&format!("sqlite:{}?mode=rwc", path.to_string_lossy())).await
    }

    /// A private in-memory database.
    ///
    /// Uses a single connection, since every SQLite `:memory:` connection is its
    /// own database.
    pub async fn in_memory() -> Result<Self, OrchestrationError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_run(
        tx: &mut Transaction<'_, Sqlite>,
        run_id: Uuid,
    ) -> Result<Option<RunRecord>, OrchestrationError> {
        let row = sqlx::query_as::<_, RunRow>(SELECT_RUN)
            .bind(run_id)
            .fetch_optional(&mut **tx)
            .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn insert_history(
        tx: &mut Transaction<'_, Sqlite>,
        run_id: Uuid,
        state: &State,
    ) -> Result<(), OrchestrationError> {
        sqlx::query(
            r#"
            INSERT INTO run_states (id, run_id, state_type, name, timestamp, message, details)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(state.id)
        .bind(run_id)
        .bind(state.state_type.as_str())
        .bind(&state.name)
        .bind(state.timestamp)
        .bind(&state.message)
        .bind(serde_json::to_string(&state.details)?)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self, run: NewRun) -> Result<RunRecord, OrchestrationError> {
        let run_id = run.id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        let state = &run.state;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO runs (id, kind, flow_id, name, state_id, state_type, state_name,
                              state_timestamp, state_message, state_details,
                              next_scheduled_start_time, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run_id)
        .bind(run.kind.as_str())
        .bind(run.flow_id)
        .bind(&run.name)
        .bind(state.id)
        .bind(state.state_type.as_str())
        .bind(&state.name)
        .bind(state.timestamp)
        .bind(&state.message)
        .bind(serde_json::to_string(&state.details)?)
        .bind(next_scheduled_start_time(state))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        Self::insert_history(&mut tx, run_id, state).await?;

        let record = Self::fetch_run(&mut tx, run_id)
            .await?
            .ok_or(OrchestrationError::RunNotFound { run_id })?;

        tx.commit().await?;
        Ok(record)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<RunRecord>, OrchestrationError> {
        let row = sqlx::query_as::<_, RunRow>(SELECT_RUN)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn write_state(
        &self,
        run_id: Uuid,
        state: &State,
        expected_state_id: Uuid,
    ) -> Result<RunRecord, OrchestrationError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET state_id = ?, state_type = ?, state_name = ?, state_timestamp = ?,
                state_message = ?, state_details = ?, next_scheduled_start_time = ?,
                updated_at = ?
            WHERE id = ? AND state_id = ?
            "#,
        )
        .bind(state.id)
        .bind(state.state_type.as_str())
        .bind(&state.name)
        .bind(state.timestamp)
        .bind(&state.message)
        .bind(serde_json::to_string(&state.details)?)
        .bind(next_scheduled_start_time(state))
        .bind(Utc::now())
        .bind(run_id)
        .bind(expected_state_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;

            return Err(match exists {
                Some(_) => OrchestrationError::ConcurrencyConflict { run_id },
                None => OrchestrationError::RunNotFound { run_id },
            });
        }

        Self::insert_history(&mut tx, run_id, state).await?;

        let record = Self::fetch_run(&mut tx, run_id)
            .await?
            .ok_or(OrchestrationError::RunNotFound { run_id })?;

        tx.commit().await?;
        Ok(record)
    }

    async fn query_late_runs(
        &self,
        query: &LateRunQuery,
    ) -> Result<Vec<LateRunCandidate>, OrchestrationError> {
        let rows: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, next_scheduled_start_time
            FROM runs
            WHERE kind = ?
              AND state_type = ?
              AND state_name = ?
              AND next_scheduled_start_time IS NOT NULL
              AND next_scheduled_start_time <= ?
            ORDER BY next_scheduled_start_time ASC
            LIMIT ?
            "#,
        )
        .bind(query.kind.as_str())
        .bind(StateType::Scheduled.as_str())
        .bind(crate::states::SCHEDULED_STATE_NAME)
        .bind(query.scheduled_before)
        .bind(query.limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(run_id, next_scheduled_start_time)| LateRunCandidate {
                run_id,
                next_scheduled_start_time,
            })
            .collect())
    }

    async fn state_history(&self, run_id: Uuid) -> Result<Vec<State>, OrchestrationError> {
        let rows = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT id, state_type, name, timestamp, message, details
            FROM run_states
            WHERE run_id = ?
            ORDER BY timestamp ASC, rowid ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                decode_state(
                    row.id,
                    &row.state_type,
                    row.name,
                    row.timestamp,
                    row.message,
                    &row.details,
                )
            })
            .collect()
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<bool, OrchestrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM run_states WHERE run_id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM runs WHERE id = ?")
            .bind(run_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn health_check(&self) -> Result<bool, OrchestrationError> {
        let row: (i64,) = sqlx::query_as("SELECT 1").fetch_one(&self.pool).await?;
        Ok(row.0 == 1)
    }
}
