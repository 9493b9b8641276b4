//! SQLite `DefinitionRepository`.

use chrono::Utc;
use dagflow_core::repository::definition::DefinitionRepository;
use dagflow_types::command::{DefQuery, Page, PageRequest};
use dagflow_types::definition::{DefStatus, NewWorkflowDef, WorkflowDef};
use dagflow_types::error::RepositoryError;

use super::SqliteWorkflowStore;
use super::rows::{DEF_COLUMNS, DefRow, format_datetime, query_err, to_json};

impl DefinitionRepository for SqliteWorkflowStore {
    async fn create_definition(&self, new: &NewWorkflowDef) -> Result<WorkflowDef, RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;

        let (def_id, version) = match new.def_id {
            Some(def_id) => {
                let max: Option<i32> =
                    sqlx::query_scalar("SELECT MAX(version) FROM workflow_defs WHERE def_id = ?")
                        .bind(def_id)
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(query_err)?;
                let max = max.ok_or(RepositoryError::NotFound)?;
                (def_id, max + 1)
            }
            None => {
                let next: i64 =
                    sqlx::query_scalar("SELECT COALESCE(MAX(def_id), 0) + 1 FROM workflow_defs")
                        .fetch_one(&mut *tx)
                        .await
                        .map_err(query_err)?;
                (next, 1)
            }
        };

        let now = format_datetime(&Utc::now());
        sqlx::query(
            r#"INSERT INTO workflow_defs
               (def_id, version, name, creator, description, nodes, status, parent_def_id,
                ref_name, timeout_secs, triggers, inst_triggers, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def_id)
        .bind(version)
        .bind(&new.name)
        .bind(&new.creator)
        .bind(&new.description)
        .bind(to_json(&new.nodes)?)
        .bind(new.status.as_str())
        .bind(new.parent_def_id)
        .bind(&new.ref_name)
        .bind(new.timeout_secs.map(|s| s as i64))
        .bind(to_json(&new.triggers)?)
        .bind(to_json(&new.inst_triggers)?)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(query_err)?;

        let row = sqlx::query(&format!(
            "SELECT {DEF_COLUMNS} FROM workflow_defs WHERE def_id = ? AND version = ?"
        ))
        .bind(def_id)
        .bind(version)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_err)?;
        let def = DefRow::from_row(&row)?.into_def()?;

        tx.commit().await.map_err(query_err)?;
        Ok(def)
    }

    async fn get_definition(
        &self,
        def_id: i64,
        version: Option<i32>,
    ) -> Result<Option<WorkflowDef>, RepositoryError> {
        let row = match version {
            Some(v) => {
                sqlx::query(&format!(
                    "SELECT {DEF_COLUMNS} FROM workflow_defs WHERE def_id = ? AND version = ?"
                ))
                .bind(def_id)
                .bind(v)
                .fetch_optional(&self.pool.reader)
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {DEF_COLUMNS} FROM workflow_defs WHERE def_id = ? ORDER BY version DESC LIMIT 1"
                ))
                .bind(def_id)
                .fetch_optional(&self.pool.reader)
                .await
            }
        }
        .map_err(query_err)?;

        row.map(|r| DefRow::from_row(&r)?.into_def()).transpose()
    }

    async fn update_definition_meta(
        &self,
        def_id: i64,
        version: i32,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_defs SET
                 name = COALESCE(?, name),
                 description = COALESCE(?, description),
                 updated_at = ?
               WHERE def_id = ? AND version = ?"#,
        )
        .bind(name)
        .bind(description)
        .bind(format_datetime(&Utc::now()))
        .bind(def_id)
        .bind(version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_definition_status(
        &self,
        def_id: i64,
        version: i32,
        status: DefStatus,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_defs SET status = ?, updated_at = ? WHERE def_id = ? AND version = ?",
        )
        .bind(status.as_str())
        .bind(format_datetime(&Utc::now()))
        .bind(def_id)
        .bind(version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_definitions(
        &self,
        query: &DefQuery,
        page: PageRequest,
    ) -> Result<Page<WorkflowDef>, RepositoryError> {
        // instr() keeps the name match case-sensitive, unlike LIKE.
        let filter = "WHERE (?1 IS NULL OR instr(name, ?1) > 0) AND (?2 IS NULL OR status = ?2)";
        let status = query.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM workflow_defs {filter}"))
            .bind(&query.name)
            .bind(status)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {DEF_COLUMNS} FROM workflow_defs {filter} ORDER BY def_id DESC, version DESC LIMIT ?3 OFFSET ?4"
        ))
        .bind(&query.name)
        .bind(status)
        .bind(i64::from(page.limit()))
        .bind(page.offset() as i64)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;

        let items = rows
            .iter()
            .map(|r| DefRow::from_row(r)?.into_def())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            total: total as u64,
            page: page.page,
            page_size: page.limit(),
        })
    }
}
