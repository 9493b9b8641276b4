//! SQLite `NodeRepository`.

use chrono::{DateTime, Utc};
use dagflow_core::repository::node::NodeRepository;
use dagflow_types::error::RepositoryError;
use dagflow_types::node::{NewNodeInst, NodeInst, NodeStatus, NodeUpdate};

use super::SqliteWorkflowStore;
use super::rows::{
    NODE_COLUMNS, NodeRow, decode_nodes, format_datetime, opt_json, placeholders, query_err,
    to_json,
};

/// `status IN (...)` over the live node states.
fn live_clause() -> String {
    format!("status IN ({})", placeholders(NodeStatus::LIVE.len()))
}

impl NodeRepository for SqliteWorkflowStore {
    async fn create_node_inst(&self, new: &NewNodeInst) -> Result<NodeInst, RepositoryError> {
        let scheduled_at = format_datetime(&new.scheduled_at);
        let completed_at = new.status.is_terminal().then(|| scheduled_at.clone());

        let row = sqlx::query(&format!(
            r#"INSERT INTO node_insts
               (def_id, inst_id, ref_name, node_type, status, error, nexts, parents,
                scheduled_at, completed_at, timeout_at, near_timeout_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               RETURNING {NODE_COLUMNS}"#
        ))
        .bind(new.def_id)
        .bind(new.inst_id)
        .bind(&new.ref_name)
        .bind(new.node_type.as_str())
        .bind(new.status.as_str())
        .bind(&new.error)
        .bind(to_json(&new.nexts)?)
        .bind(to_json(&new.parents)?)
        .bind(&scheduled_at)
        .bind(completed_at)
        .bind(new.timeout_at.as_ref().map(format_datetime))
        .bind(new.near_timeout_at.as_ref().map(format_datetime))
        .bind(format_datetime(&Utc::now()))
        .fetch_one(&self.pool.writer)
        .await
        .map_err(query_err)?;

        NodeRow::from_row(&row)?.into_node()
    }

    async fn get_node_inst(&self, node_inst_id: i64) -> Result<Option<NodeInst>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_insts WHERE node_inst_id = ?"
        ))
        .bind(node_inst_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        row.map(|r| NodeRow::from_row(&r)?.into_node()).transpose()
    }

    async fn list_node_insts(&self, inst_id: i64) -> Result<Vec<NodeInst>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_insts WHERE inst_id = ? ORDER BY node_inst_id ASC"
        ))
        .bind(inst_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_nodes(&rows)
    }

    async fn max_node_inst_id(&self, inst_id: i64) -> Result<i64, RepositoryError> {
        sqlx::query_scalar("SELECT COALESCE(MAX(node_inst_id), 0) FROM node_insts WHERE inst_id = ?")
            .bind(inst_id)
            .fetch_one(&self.pool.reader)
            .await
            .map_err(query_err)
    }

    async fn transition_node(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        from: &[NodeStatus],
        to: NodeStatus,
        update: &NodeUpdate,
    ) -> Result<bool, RepositoryError> {
        if from.is_empty() {
            return Ok(false);
        }
        let sql = format!(
            r#"UPDATE node_insts SET
                 status = ?,
                 input = COALESCE(?, input),
                 output = COALESCE(?, output),
                 poll_input = COALESCE(?, poll_input),
                 poll_output = COALESCE(?, poll_output),
                 error = COALESCE(?, error),
                 completed_at = COALESCE(?, completed_at),
                 next_poll_at = COALESCE(?, next_poll_at),
                 updated_at = ?
               WHERE node_inst_id = ? AND inst_id = ? AND status IN ({})"#,
            placeholders(from.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(opt_json(update.input.as_ref())?)
            .bind(opt_json(update.output.as_ref())?)
            .bind(opt_json(update.poll_input.as_ref())?)
            .bind(opt_json(update.poll_output.as_ref())?)
            .bind(&update.error)
            .bind(update.completed_at.as_ref().map(format_datetime))
            .bind(update.next_poll_at.as_ref().map(format_datetime))
            .bind(format_datetime(&Utc::now()))
            .bind(node_inst_id)
            .bind(inst_id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_node_timeout(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let sql = format!(
            "UPDATE node_insts SET timeout_at = ?, updated_at = ?
             WHERE node_inst_id = ? AND inst_id = ? AND {}",
            live_clause()
        );
        let mut query = sqlx::query(&sql)
            .bind(format_datetime(&at))
            .bind(format_datetime(&Utc::now()))
            .bind(node_inst_id)
            .bind(inst_id);
        for status in NodeStatus::LIVE {
            query = query.bind(status.as_str());
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_node_near_timeout(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let sql = format!(
            "UPDATE node_insts SET near_timeout_at = ?, near_timeout_alerted = 0, updated_at = ?
             WHERE node_inst_id = ? AND inst_id = ? AND {}",
            live_clause()
        );
        let mut query = sqlx::query(&sql)
            .bind(format_datetime(&at))
            .bind(format_datetime(&Utc::now()))
            .bind(node_inst_id)
            .bind(inst_id);
        for status in NodeStatus::LIVE {
            query = query.bind(status.as_str());
        }
        let result = query
            .execute(&self.pool.writer)
            .await
            .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn mark_near_timeout_alerted(
        &self,
        node_inst_id: i64,
        inst_id: i64,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE node_insts SET near_timeout_alerted = 1
             WHERE node_inst_id = ? AND inst_id = ? AND near_timeout_alerted = 0",
        )
        .bind(node_inst_id)
        .bind(inst_id)
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_pollable_nodes(
        &self,
        due: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<NodeInst>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_insts
             WHERE status = ? AND next_poll_at IS NOT NULL AND next_poll_at <= ?
             ORDER BY next_poll_at ASC, node_inst_id ASC LIMIT ?"
        ))
        .bind(NodeStatus::Waiting.as_str())
        .bind(format_datetime(&due))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_nodes(&rows)
    }

    async fn set_next_poll(
        &self,
        node_inst_id: i64,
        inst_id: i64,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE node_insts SET next_poll_at = ?
             WHERE node_inst_id = ? AND inst_id = ? AND status = ?",
        )
        .bind(format_datetime(&at))
        .bind(node_inst_id)
        .bind(inst_id)
        .bind(NodeStatus::Waiting.as_str())
        .execute(&self.pool.writer)
        .await
        .map_err(query_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_deadline_nodes(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<NodeInst>, RepositoryError> {
        let sql = format!(
            "SELECT {NODE_COLUMNS} FROM node_insts
             WHERE {}
               AND ((timeout_at IS NOT NULL AND timeout_at <= ?)
                    OR (near_timeout_alerted = 0 AND near_timeout_at IS NOT NULL AND near_timeout_at <= ?))
             ORDER BY node_inst_id ASC LIMIT ?",
            live_clause()
        );
        let now = format_datetime(&now);
        let mut query = sqlx::query(&sql);
        for status in NodeStatus::LIVE {
            query = query.bind(status.as_str());
        }
        let query = query.bind(&now).bind(&now).bind(i64::from(limit));
        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_err)?;
        decode_nodes(&rows)
    }

    async fn delete_node_insts(&self, inst_ids: &[i64]) -> Result<u64, RepositoryError> {
        if inst_ids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM node_insts WHERE inst_id IN ({})",
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_support::temp_store;
    use chrono::Duration;
    use dagflow_types::definition::NodeType;
    use serde_json::json;

    fn new_node(inst_id: i64, ref_name: &str, status: NodeStatus) -> NewNodeInst {
        NewNodeInst {
            def_id: 1,
            inst_id,
            ref_name: ref_name.into(),
            node_type: NodeType::Wait,
            status,
            nexts: vec!["next".into()],
            parents: vec![],
            error: None,
            scheduled_at: Utc::now(),
            timeout_at: None,
            near_timeout_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let (store, _dir) = temp_store().await;
        let a = store.create_node_inst(&new_node(1, "a", NodeStatus::Scheduled)).await.unwrap();
        let b = store.create_node_inst(&new_node(1, "b", NodeStatus::Skipped)).await.unwrap();
        store.create_node_inst(&new_node(2, "a", NodeStatus::Scheduled)).await.unwrap();

        assert!(b.node_inst_id > a.node_inst_id);
        assert!(a.completed_at.is_none());
        assert_eq!(b.completed_at, Some(b.scheduled_at));
        assert_eq!(a.nexts, vec!["next".to_string()]);

        let listed = store.list_node_insts(1).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].ref_name, "a");
        assert_eq!(store.max_node_inst_id(1).await.unwrap(), b.node_inst_id);
        assert_eq!(store.max_node_inst_id(99).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transition_applies_only_given_fields() {
        let (store, _dir) = temp_store().await;
        let node = store.create_node_inst(&new_node(1, "a", NodeStatus::Scheduled)).await.unwrap();

        let start = NodeUpdate {
            input: Some(json!({"q": 1})),
            ..Default::default()
        };
        assert!(store
            .transition_node(node.node_inst_id, 1, &[NodeStatus::Scheduled], NodeStatus::Running, &start)
            .await
            .unwrap());
        // Wrong owner.
        assert!(!store
            .transition_node(node.node_inst_id, 2, &NodeStatus::LIVE, NodeStatus::Cancelled, &NodeUpdate::default())
            .await
            .unwrap());

        let now = Utc::now();
        assert!(store
            .transition_node(node.node_inst_id, 1, &NodeStatus::LIVE, NodeStatus::Completed, &NodeUpdate::completed(json!({"ok": true}), now))
            .await
            .unwrap());
        assert!(!store
            .transition_node(node.node_inst_id, 1, &NodeStatus::LIVE, NodeStatus::Failed, &NodeUpdate::failed("late", now))
            .await
            .unwrap());

        let stored = store.get_node_inst(node.node_inst_id).await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Completed);
        assert_eq!(stored.input, Some(json!({"q": 1})));
        assert_eq!(stored.output, Some(json!({"ok": true})));
        assert!(stored.error.is_none());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_deadlines_and_alerts() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        let a = store.create_node_inst(&new_node(1, "a", NodeStatus::Waiting)).await.unwrap();
        let b = store.create_node_inst(&new_node(1, "b", NodeStatus::Running)).await.unwrap();
        let done = store.create_node_inst(&new_node(1, "c", NodeStatus::Completed)).await.unwrap();

        assert!(store.set_node_timeout(a.node_inst_id, 1, now - Duration::seconds(1)).await.unwrap());
        assert!(store.set_node_near_timeout(b.node_inst_id, 1, now - Duration::seconds(1)).await.unwrap());
        assert!(!store.set_node_timeout(done.node_inst_id, 1, now).await.unwrap());

        let due = store.list_deadline_nodes(now, 10).await.unwrap();
        assert_eq!(due.iter().map(|n| n.node_inst_id).collect::<Vec<_>>(), vec![a.node_inst_id, b.node_inst_id]);

        assert!(store.mark_near_timeout_alerted(b.node_inst_id, 1).await.unwrap());
        assert!(!store.mark_near_timeout_alerted(b.node_inst_id, 1).await.unwrap());
        let due = store.list_deadline_nodes(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);

        // Re-arming the warning clears the alert flag.
        assert!(store.set_node_near_timeout(b.node_inst_id, 1, now - Duration::seconds(1)).await.unwrap());
        assert_eq!(store.list_deadline_nodes(now, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_polling_only_waiting_nodes() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        let waiting = store.create_node_inst(&new_node(1, "a", NodeStatus::Waiting)).await.unwrap();
        let running = store.create_node_inst(&new_node(1, "b", NodeStatus::Running)).await.unwrap();

        assert!(store.set_next_poll(waiting.node_inst_id, 1, now - Duration::seconds(5)).await.unwrap());
        assert!(!store.set_next_poll(running.node_inst_id, 1, now).await.unwrap());

        let due = store.list_pollable_nodes(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].node_inst_id, waiting.node_inst_id);
        assert!(store.list_pollable_nodes(now - Duration::seconds(10), 10).await.unwrap().is_empty());

        assert_eq!(store.delete_node_insts(&[1]).await.unwrap(), 2);
        assert!(store.list_node_insts(1).await.unwrap().is_empty());
    }
}
