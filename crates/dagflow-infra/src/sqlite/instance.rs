//! SQLite `InstanceRepository`.

use chrono::{DateTime, Utc};
use dagflow_core::repository::instance::InstanceRepository;
use dagflow_types::command::{InstQuery, Page, PageRequest};
use dagflow_types::error::RepositoryError;
use dagflow_types::instance::{InstStatus, InstTransition, NewWorkflowInst, WorkflowInst};

use super::SqliteWorkflowStore;
use super::rows::{
    INST_COLUMNS, InstRow, decode_insts, format_datetime, placeholders, query_err, to_json,
};

impl InstanceRepository for SqliteWorkflowStore {
    async fn create_instance(&self, new: &NewWorkflowInst) -> Result<WorkflowInst, RepositoryError> {
        let now = format_datetime(&Utc::now());
        let context = if new.context.is_null() {
            serde_json::json!({})
        } else {
            new.context.clone()
        };

        let row = sqlx::query(&format!(
            r#"INSERT INTO workflow_insts
               (def_id, version, status, context, parent_inst_id, parent_node_inst_id,
                operator, timeout_at, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING {INST_COLUMNS}"#
        ))
        .bind(new.def_id)
        .bind(new.version)
        .bind(InstStatus::Running.as_str())
        .bind(to_json(&context)?)
        .bind(new.parent_inst_id)
        .bind(new.parent_node_inst_id)
        .bind(&new.operator)
        .bind(new.timeout_at.as_ref().map(format_datetime))
        .bind(&now)
        .bind(&now)
        .fetch_one(&self.pool.writer)
        .await
        .map_err(query_err)?;

        InstRow::from_row(&row)?.into_inst()
    }

    async fn get_instance(&self, inst_id: i64) -> Result<Option<WorkflowInst>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INST_COLUMNS} FROM workflow_insts WHERE inst_id = ?"
        ))
        .bind(inst_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        row.map(|r| InstRow::from_row(&r)?.into_inst()).transpose()
    }

    async fn save_instance(&self, inst: &WorkflowInst) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_insts SET
                 context = ?, execute_path = ?, sched_node_insts = ?, cur_node_inst = ?,
                 operator = ?, reason = ?, last_restart_node = ?, last_restart_at = ?,
                 before_last_restart_max_node_inst_id = ?, timeout_at = ?, updated_at = ?
               WHERE inst_id = ? AND def_id = ?"#,
        )
        .bind(to_json(&inst.context)?)
        .bind(to_json(&inst.execute_path)?)
        .bind(to_json(&inst.sched_node_insts)?)
        .bind(inst.cur_node_inst)
        .bind(&inst.operator)
        .bind(&inst.reason)
        .bind(&inst.last_restart_node)
        .bind(inst.last_restart_at.as_ref().map(format_datetime))
        .bind(inst.before_last_restart_max_node_inst_id)
        .bind(inst.timeout_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .bind(inst.inst_id)
        .bind(inst.def_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_instance(
        &self,
        inst_id: i64,
        def_id: i64,
        from: &[InstStatus],
        to: InstStatus,
        change: &InstTransition,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            r#"UPDATE workflow_insts SET
                 status = ?, operator = COALESCE(?, operator), reason = COALESCE(?, reason),
                 ended_at = ?, updated_at = ?
               WHERE inst_id = ? AND def_id = ? AND status IN ({})"#,
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(&change.operator)
            .bind(&change.reason)
            .bind(change.ended_at.as_ref().map(format_datetime))
            .bind(format_datetime(&Utc::now()))
            .bind(inst_id)
            .bind(def_id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_instances(
        &self,
        query: &InstQuery,
        page: PageRequest,
    ) -> Result<Page<WorkflowInst>, RepositoryError> {
        let filter = "WHERE (?1 IS NULL OR def_id = ?1) AND (?2 IS NULL OR status = ?2)";
        let status = query.status.map(|s| s.as_str());

        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM workflow_insts {filter}"))
                .bind(query.def_id)
                .bind(status)
                .fetch_one(&self.pool.reader)
                .await
                .map_err(query_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {INST_COLUMNS} FROM workflow_insts {filter} ORDER BY inst_id DESC LIMIT ?3 OFFSET ?4"
        ))
        .bind(query.def_id)
        .bind(status)
        .bind(i64::from(page.limit()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        Ok(Page {
            items: decode_insts(&rows)?,
            total: total as u64,
            page: page.page,
            page_size: page.limit(),
        })
    }

    async fn list_archivable_instances(
        &self,
        before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInst>, RepositoryError> {
        let terminal: Vec<&str> = InstStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.as_str())
            .collect();
        let sql = format!(
            "SELECT {INST_COLUMNS} FROM workflow_insts
             WHERE ended_at IS NOT NULL AND ended_at < ? AND status IN ({})
             ORDER BY ended_at ASC, inst_id ASC LIMIT ?",
            placeholders(terminal.len())
        );
        let mut query = sqlx::query(&sql).bind(format_datetime(&before));
        for status in terminal {
            query = query.bind(status);
        }
        let rows = query
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        decode_insts(&rows)
    }

    async fn list_expired_instances(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WorkflowInst>, RepositoryError> {
        let sql = format!(
            "SELECT {INST_COLUMNS} FROM workflow_insts
             WHERE timeout_at IS NOT NULL AND timeout_at <= ? AND status IN (?, ?)
             ORDER BY inst_id ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(format_datetime(&now))
            .bind(InstStatus::Running.as_str())
            .bind(InstStatus::Paused.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        decode_insts(&rows)
    }

    async fn delete_instances(&self, inst_ids: &[i64]) -> Result<u64, RepositoryError> {
        if inst_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM workflow_insts WHERE inst_id IN ({})",
            placeholders(inst_ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in inst_ids {
            query = query.bind(*id);
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected())
    }
}
