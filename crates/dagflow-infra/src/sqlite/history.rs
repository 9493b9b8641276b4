//! SQLite `HistoryRepository`.
//!
//! History tables mirror the live ones column for column. Inserts use
//! `ON CONFLICT DO NOTHING`, so re-archiving the same rows is harmless.

use dagflow_core::repository::history::HistoryRepository;
use dagflow_types::error::RepositoryError;
use dagflow_types::instance::WorkflowInst;
use dagflow_types::node::NodeInst;

use super::SqliteWorkflowStore;
use super::rows::{
    INST_COLUMNS, InstRow, NODE_COLUMNS, decode_nodes, format_datetime, opt_json, placeholders,
    query_err, to_json,
};

impl HistoryRepository for SqliteWorkflowStore {
    async fn insert_instance_history(&self, insts: &[WorkflowInst]) -> Result<u64, RepositoryError> {
        if insts.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO workflow_insts_history ({INST_COLUMNS}) VALUES ({}) ON CONFLICT DO NOTHING",
            placeholders(19)
        );
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let mut inserted = 0;
        for inst in insts {
            let result = sqlx::query(&sql)
                .bind(inst.inst_id)
                .bind(inst.def_id)
                .bind(inst.version)
                .bind(inst.status.as_str())
                .bind(to_json(&inst.context)?)
                .bind(to_json(&inst.execute_path)?)
                .bind(to_json(&inst.sched_node_insts)?)
                .bind(inst.cur_node_inst)
                .bind(inst.parent_inst_id)
                .bind(inst.parent_node_inst_id)
                .bind(&inst.operator)
                .bind(&inst.reason)
                .bind(&inst.last_restart_node)
                .bind(inst.last_restart_at.as_ref().map(format_datetime))
                .bind(inst.before_last_restart_max_node_inst_id)
                .bind(inst.timeout_at.as_ref().map(format_datetime))
                .bind(format_datetime(&inst.created_at))
                .bind(format_datetime(&inst.updated_at))
                .bind(inst.ended_at.as_ref().map(format_datetime))
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.map_err(query_err)?;
        Ok(inserted)
    }

    async fn insert_node_history(&self, nodes: &[NodeInst]) -> Result<u64, RepositoryError> {
        if nodes.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "INSERT INTO node_insts_history ({NODE_COLUMNS}) VALUES ({}) ON CONFLICT DO NOTHING",
            placeholders(20)
        );
        let mut tx = self.pool.writer.begin().await.map_err(query_err)?;
        let mut inserted = 0;
        for node in nodes {
            let result = sqlx::query(&sql)
                .bind(node.node_inst_id)
                .bind(node.def_id)
                .bind(node.inst_id)
                .bind(&node.ref_name)
                .bind(node.node_type.as_str())
                .bind(node.status.as_str())
                .bind(opt_json(node.input.as_ref())?)
                .bind(opt_json(node.output.as_ref())?)
                .bind(opt_json(node.poll_input.as_ref())?)
                .bind(opt_json(node.poll_output.as_ref())?)
                .bind(&node.error)
                .bind(to_json(&node.nexts)?)
                .bind(to_json(&node.parents)?)
                .bind(format_datetime(&node.scheduled_at))
                .bind(node.completed_at.as_ref().map(format_datetime))
                .bind(node.timeout_at.as_ref().map(format_datetime))
                .bind(node.near_timeout_at.as_ref().map(format_datetime))
                .bind(node.near_timeout_alerted)
                .bind(node.next_poll_at.as_ref().map(format_datetime))
                .bind(format_datetime(&node.updated_at))
                .execute(&mut *tx)
                .await
                .map_err(query_err)?;
            inserted += result.rows_affected();
        }
        tx.commit().await.map_err(query_err)?;
        Ok(inserted)
    }

    async fn get_history_instance(&self, inst_id: i64) -> Result<Option<WorkflowInst>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {INST_COLUMNS} FROM workflow_insts_history WHERE inst_id = ?"
        ))
        .bind(inst_id)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_err)?;
        row.map(|r| InstRow::from_row(&r)?.into_inst()).transpose()
    }

    async fn list_history_nodes(&self, inst_id: i64) -> Result<Vec<NodeInst>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {NODE_COLUMNS} FROM node_insts_history WHERE inst_id = ? ORDER BY node_inst_id ASC"
        ))
        .bind(inst_id)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_err)?;
        decode_nodes(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::test_support::temp_store;
    use chrono::Utc;
    use dagflow_core::repository::instance::InstanceRepository;
    use dagflow_core::repository::node::NodeRepository;
    use dagflow_types::definition::NodeType;
    use dagflow_types::instance::{InstStatus, InstTransition, NewWorkflowInst};
    use dagflow_types::node::{NewNodeInst, NodeStatus, NodeUpdate};
    use serde_json::json;

    #[tokio::test]
    async fn test_archive_copy_is_duplicate_tolerant() {
        let (store, _dir) = temp_store().await;
        let inst = store
            .create_instance(&NewWorkflowInst {
                def_id: 1,
                version: 1,
                context: json!({"k": "v"}),
                operator: "alice".into(),
                parent_inst_id: None,
                parent_node_inst_id: None,
                timeout_at: None,
            })
            .await
            .unwrap();
        let node = store
            .create_node_inst(&NewNodeInst {
                def_id: 1,
                inst_id: inst.inst_id,
                ref_name: "a".into(),
                node_type: NodeType::Noop,
                status: NodeStatus::Scheduled,
                nexts: vec![],
                parents: vec![],
                error: None,
                scheduled_at: Utc::now(),
                timeout_at: None,
                near_timeout_at: None,
            })
            .await
            .unwrap();
        let now = Utc::now();
        store
            .transition_node(node.node_inst_id, inst.inst_id, &NodeStatus::LIVE, NodeStatus::Completed, &NodeUpdate::completed(json!({"n": 1}), now))
            .await
            .unwrap();
        store
            .transition_instance(
                inst.inst_id,
                1,
                &InstStatus::LIVE,
                InstStatus::Succeed,
                &InstTransition {
                    ended_at: Some(now),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let inst = store.get_instance(inst.inst_id).await.unwrap().unwrap();
        let nodes = store.list_node_insts(inst.inst_id).await.unwrap();

        assert_eq!(store.insert_instance_history(std::slice::from_ref(&inst)).await.unwrap(), 1);
        assert_eq!(store.insert_node_history(&nodes).await.unwrap(), 1);
        assert_eq!(store.insert_instance_history(std::slice::from_ref(&inst)).await.unwrap(), 0);
        assert_eq!(store.insert_node_history(&nodes).await.unwrap(), 0);

        let archived = store.get_history_instance(inst.inst_id).await.unwrap().unwrap();
        assert_eq!(archived, inst);
        assert_eq!(store.list_history_nodes(inst.inst_id).await.unwrap(), nodes);
        assert!(store.get_history_instance(999).await.unwrap().is_none());
    }
}
