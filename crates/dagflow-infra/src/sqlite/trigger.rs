//! SQLite `TriggerRepository`.

use chrono::{DateTime, Utc};
use dagflow_core::repository::trigger::TriggerRepository;
use dagflow_types::error::RepositoryError;
use dagflow_types::trigger::{NewTrigger, Trigger, TriggerKind, TriggerScope, TriggerStatus};

use super::SqliteWorkflowStore;
use super::rows::{TRIGGER_COLUMNS, TriggerRow, decode_triggers, format_datetime, query_err, to_json};

/// Scope filter: `None` instance or ref name matches anything.
const SCOPE_FILTER: &str = "level = ?1 AND def_id = ?2 AND def_version = ?3 \
     AND (?4 IS NULL OR inst_id = ?4) AND (?5 IS NULL OR ref_name = ?5)";

impl TriggerRepository for SqliteWorkflowStore {
    async fn upsert_trigger(&self, new: &NewTrigger) -> Result<Trigger, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let scope = &new.scope;
        let payload = to_json(&new.payload)?;
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        // `IS` compares NULLs as equal, so the lookup is exact on scope.
        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT trigger_id FROM triggers
             WHERE level = ? AND def_id = ? AND def_version = ? AND inst_id IS ?
               AND ref_name IS ? AND kind = ? AND target = ?",
        )
        .bind(scope.level.as_str())
        .bind(scope.def_id)
        .bind(scope.def_version)
        .bind(scope.inst_id)
        .bind(&scope.ref_name)
        .bind(new.kind.as_str())
        .bind(&new.target)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_err)?;

        let row = match existing {
            Some(trigger_id) => sqlx::query(&format!(
                "UPDATE triggers SET when_expr = ?, payload = ?, status = ?, updated_at = ?
                 WHERE trigger_id = ? RETURNING {TRIGGER_COLUMNS}"
            ))
            .bind(&new.when)
            .bind(&payload)
            .bind(TriggerStatus::Active.as_str())
            .bind(&now)
            .bind(trigger_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_err)?,
            None => sqlx::query(&format!(
                r#"INSERT INTO triggers
                   (level, kind, target, when_expr, payload, status, def_id, def_version,
                    inst_id, ref_name, created_at, updated_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                   RETURNING {TRIGGER_COLUMNS}"#
            ))
            .bind(scope.level.as_str())
            .bind(new.kind.as_str())
            .bind(&new.target)
            .bind(&new.when)
            .bind(&payload)
            .bind(TriggerStatus::Active.as_str())
            .bind(scope.def_id)
            .bind(scope.def_version)
            .bind(scope.inst_id)
            .bind(&scope.ref_name)
            .bind(&now)
            .bind(&now)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_err)?,
        };

        let trigger = TriggerRow::from_row(&row)?.into_trigger()?;
        tx.commit().await.map_err(query_err)?;
        Ok(trigger)
    }

    async fn deactivate_triggers(&self, scope: &TriggerScope) -> Result<u64, RepositoryError> {
        let result = sqlx::query(&format!(
            "UPDATE triggers SET status = ?6, updated_at = ?7
             WHERE {SCOPE_FILTER} AND status = ?8"
        ))
        .bind(scope.level.as_str())
        .bind(scope.def_id)
        .bind(scope.def_version)
        .bind(scope.inst_id)
        .bind(&scope.ref_name)
        .bind(TriggerStatus::Inactive.as_str())
        .bind(format_datetime(&Utc::now()))
        .bind(TriggerStatus::Active.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected())
    }

    async fn get_trigger(&self, trigger_id: i64) -> Result<Option<Trigger>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE trigger_id = ?"
        ))
        .bind(trigger_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        row.map(|r| TriggerRow::from_row(&r)?.into_trigger()).transpose()
    }

    async fn list_active_triggers(
        &self,
        kind: Option<TriggerKind>,
        target: Option<&str>,
    ) -> Result<Vec<Trigger>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers
             WHERE status = ?1 AND (?2 IS NULL OR kind = ?2) AND (?3 IS NULL OR target = ?3)
             ORDER BY trigger_id ASC"
        ))
        .bind(TriggerStatus::Active.as_str())
        .bind(kind.map(|k| k.as_str()))
        .bind(target)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_triggers(&rows)
    }

    async fn list_triggers(&self, scope: &TriggerScope) -> Result<Vec<Trigger>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE {SCOPE_FILTER} ORDER BY trigger_id ASC"
        ))
        .bind(scope.level.as_str())
        .bind(scope.def_id)
        .bind(scope.def_version)
        .bind(scope.inst_id)
        .bind(&scope.ref_name)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_triggers(&rows)
    }

    async fn record_trigger_fire(
        &self,
        trigger_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE triggers SET last_fired_at = ? WHERE trigger_id = ?")
            .bind(format_datetime(&at))
            .bind(trigger_id)
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}
