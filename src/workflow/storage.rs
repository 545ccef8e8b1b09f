/// Execution Store: durable WorkflowExecution / WorkflowNodeExecution records
///
/// Every write to a node's `status` goes through a compare-and-swap on the expected
/// prior status. That conditional update, not the node lock, is what guarantees a
/// node enters `executing` exactly once.

use crate::workflow::types::{
    parse_json_or_default, ExecutionStatus, NodeStatus, NodeTransition, WorkflowExecution,
    WorkflowNodeExecution,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, sqlite::SqliteRow, QueryBuilder, Row, Sqlite};

/// Persistence operations the scheduler relies on
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist the execution and all its node executions atomically
    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
        nodes: &[WorkflowNodeExecution],
    ) -> Result<()>;

    async fn get_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>>;

    async fn get_node_execution(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<Option<WorkflowNodeExecution>>;

    /// All node executions of a run, in creation order
    async fn list_node_executions(&self, execution_id: &str) -> Result<Vec<WorkflowNodeExecution>>;

    /// How many of `node_ids` are `finish` in this run
    async fn count_finished(&self, execution_id: &str, node_ids: &[String]) -> Result<usize>;

    /// Apply `transition` only if the node's status is one of `expected`; true if it applied
    async fn transition_node(
        &self,
        execution_id: &str,
        node_id: &str,
        expected: &[NodeStatus],
        transition: &NodeTransition,
    ) -> Result<bool>;

    /// Batch `waiting -> finish` (progress 100) for pass-through nodes; returns the ids that changed
    async fn finish_waiting_nodes(
        &self,
        execution_id: &str,
        node_ids: &[String],
        end_time: DateTime<Utc>,
    ) -> Result<Vec<String>>;

    /// Persist derived status and counters
    async fn update_execution_progress(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        executed_nodes: i64,
        failed_nodes: i64,
    ) -> Result<()>;

    /// Executions owned by `uid`, newest first
    async fn list_executions(
        &self,
        uid: &str,
        canvas_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>>;
}

/// SQLite-based execution store
#[derive(Debug, Clone)]
pub struct SqliteExecutionStore {
    /// SQLite connection pool for the scheduler database
    pool: SqlitePool,
}

fn to_rfc3339(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn execution_from_row(row: &SqliteRow) -> WorkflowExecution {
    let status: String = row.get("status");
    let variables: Option<String> = row.get("variables");
    WorkflowExecution {
        execution_id: row.get("execution_id"),
        uid: row.get("uid"),
        title: row.get("title"),
        canvas_id: row.get("canvas_id"),
        source_canvas_id: row.get("source_canvas_id"),
        variables: parse_json_or_default(variables.as_deref()),
        status: ExecutionStatus::parse(&status).unwrap_or(ExecutionStatus::Executing),
        total_nodes: row.get("total_nodes"),
        executed_nodes: row.get("executed_nodes"),
        failed_nodes: row.get("failed_nodes"),
        created_at: parse_ts(row.get("created_at")).unwrap_or_else(Utc::now),
        updated_at: parse_ts(row.get("updated_at")).unwrap_or_else(Utc::now),
    }
}

fn node_from_row(row: &SqliteRow) -> WorkflowNodeExecution {
    let status: String = row.get("status");
    let node_data: Option<String> = row.get("node_data");
    let connect_to: Option<String> = row.get("connect_to");
    let parents: Option<String> = row.get("parent_node_ids");
    let children: Option<String> = row.get("child_node_ids");
    let history: Option<String> = row.get("result_history");

    WorkflowNodeExecution {
        node_execution_id: row.get("node_execution_id"),
        execution_id: row.get("execution_id"),
        node_id: row.get("node_id"),
        node_type: row.get("node_type"),
        entity_id: row.get("entity_id"),
        title: row.get("title"),
        status: NodeStatus::parse(&status).unwrap_or_else(|| {
            tracing::warn!("⚠️ Unknown node status {:?}, treating as failed", status);
            NodeStatus::Failed
        }),
        progress: row.get("progress"),
        error_message: row.get("error_message"),
        processed_query: row.get("processed_query"),
        original_query: row.get("original_query"),
        node_data: parse_json_or_default(node_data.as_deref()),
        connect_to: parse_json_or_default(connect_to.as_deref()),
        parent_node_ids: parse_json_or_default(parents.as_deref()),
        child_node_ids: parse_json_or_default(children.as_deref()),
        result_history: parse_json_or_default(history.as_deref()),
        start_time: parse_ts(row.get("start_time")),
        end_time: parse_ts(row.get("end_time")),
        created_at: parse_ts(row.get("created_at")).unwrap_or_else(Utc::now),
        updated_at: parse_ts(row.get("updated_at")).unwrap_or_else(Utc::now),
    }
}

impl SqliteExecutionStore {
    /// Create new store instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the execution schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_executions (
                execution_id TEXT PRIMARY KEY,
                uid TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                canvas_id TEXT NOT NULL,
                source_canvas_id TEXT NOT NULL,
                variables TEXT,
                status TEXT NOT NULL,
                total_nodes INTEGER NOT NULL DEFAULT 0,
                executed_nodes INTEGER NOT NULL DEFAULT 0,
                failed_nodes INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflow_node_executions (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                node_execution_id TEXT NOT NULL UNIQUE,
                execution_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                entity_id TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                processed_query TEXT NOT NULL DEFAULT '',
                original_query TEXT NOT NULL DEFAULT '',
                node_data TEXT,
                connect_to TEXT,
                parent_node_ids TEXT,
                child_node_ids TEXT,
                result_history TEXT,
                start_time TEXT,
                end_time TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(execution_id, node_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_workflow_executions_uid ON workflow_executions(uid, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for SqliteExecutionStore {
    async fn create_execution(
        &self,
        execution: &WorkflowExecution,
        nodes: &[WorkflowNodeExecution],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO workflow_executions (
                execution_id, uid, title, canvas_id, source_canvas_id, variables, status,
                total_nodes, executed_nodes, failed_nodes, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.execution_id)
        .bind(&execution.uid)
        .bind(&execution.title)
        .bind(&execution.canvas_id)
        .bind(&execution.source_canvas_id)
        .bind(serde_json::to_string(&execution.variables)?)
        .bind(execution.status.as_str())
        .bind(execution.total_nodes)
        .bind(execution.executed_nodes)
        .bind(execution.failed_nodes)
        .bind(to_rfc3339(&execution.created_at))
        .bind(to_rfc3339(&execution.updated_at))
        .execute(&mut *tx)
        .await
        .context("Failed to insert workflow execution")?;

        for node in nodes {
            sqlx::query(
                r#"
                INSERT INTO workflow_node_executions (
                    node_execution_id, execution_id, node_id, node_type, entity_id, title,
                    status, progress, error_message, processed_query, original_query,
                    node_data, connect_to, parent_node_ids, child_node_ids, result_history,
                    start_time, end_time, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&node.node_execution_id)
            .bind(&node.execution_id)
            .bind(&node.node_id)
            .bind(&node.node_type)
            .bind(&node.entity_id)
            .bind(&node.title)
            .bind(node.status.as_str())
            .bind(node.progress)
            .bind(&node.error_message)
            .bind(&node.processed_query)
            .bind(&node.original_query)
            .bind(serde_json::to_string(&node.node_data)?)
            .bind(serde_json::to_string(&node.connect_to)?)
            .bind(serde_json::to_string(&node.parent_node_ids)?)
            .bind(serde_json::to_string(&node.child_node_ids)?)
            .bind(serde_json::to_string(&node.result_history)?)
            .bind(node.start_time.as_ref().map(to_rfc3339))
            .bind(node.end_time.as_ref().map(to_rfc3339))
            .bind(to_rfc3339(&node.created_at))
            .bind(to_rfc3339(&node.updated_at))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to insert node execution {}", node.node_id))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> Result<Option<WorkflowExecution>> {
        let row = sqlx::query("SELECT * FROM workflow_executions WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(execution_from_row))
    }

    async fn get_node_execution(
        &self,
        execution_id: &str,
        node_id: &str,
    ) -> Result<Option<WorkflowNodeExecution>> {
        let row = sqlx::query(
            "SELECT * FROM workflow_node_executions WHERE execution_id = ? AND node_id = ?",
        )
        .bind(execution_id)
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(node_from_row))
    }

    async fn list_node_executions(&self, execution_id: &str) -> Result<Vec<WorkflowNodeExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_node_executions WHERE execution_id = ? ORDER BY seq",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(node_from_row).collect())
    }

    async fn count_finished(&self, execution_id: &str, node_ids: &[String]) -> Result<usize> {
        if node_ids.is_empty() {
            return Ok(0);
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) FROM workflow_node_executions WHERE execution_id = ",
        );
        query.push_bind(execution_id);
        query.push(" AND status = ");
        query.push_bind(NodeStatus::Finish.as_str());
        query.push(" AND node_id IN (");
        let mut separated = query.separated(", ");
        for id in node_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");

        let count: i64 = query.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count as usize)
    }

    async fn transition_node(
        &self,
        execution_id: &str,
        node_id: &str,
        expected: &[NodeStatus],
        transition: &NodeTransition,
    ) -> Result<bool> {
        if expected.is_empty() {
            return Ok(false);
        }

        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE workflow_node_executions SET status = ");
        query.push_bind(transition.status.as_str());
        query.push(", updated_at = ");
        query.push_bind(Utc::now().to_rfc3339());
        if let Some(start) = &transition.start_time {
            query.push(", start_time = ");
            query.push_bind(to_rfc3339(start));
        }
        if let Some(end) = &transition.end_time {
            query.push(", end_time = ");
            query.push_bind(to_rfc3339(end));
        }
        if let Some(progress) = transition.progress {
            query.push(", progress = ");
            query.push_bind(progress);
        }
        if let Some(message) = &transition.error_message {
            query.push(", error_message = ");
            query.push_bind(message.clone());
        }
        query.push(" WHERE execution_id = ");
        query.push_bind(execution_id);
        query.push(" AND node_id = ");
        query.push_bind(node_id);
        query.push(" AND status IN (");
        let mut separated = query.separated(", ");
        for status in expected {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(")");

        let result = query.build().execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_waiting_nodes(
        &self,
        execution_id: &str,
        node_ids: &[String],
        end_time: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }

        let end = to_rfc3339(&end_time);
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE workflow_node_executions SET status = ");
        query.push_bind(NodeStatus::Finish.as_str());
        query.push(", progress = 100, end_time = ");
        query.push_bind(end.clone());
        query.push(", updated_at = ");
        query.push_bind(end);
        query.push(" WHERE execution_id = ");
        query.push_bind(execution_id);
        query.push(" AND status = ");
        query.push_bind(NodeStatus::Waiting.as_str());
        query.push(" AND node_id IN (");
        let mut separated = query.separated(", ");
        for id in node_ids {
            separated.push_bind(id);
        }
        separated.push_unseparated(")");
        query.push(" RETURNING node_id");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut changed: Vec<String> = rows.iter().map(|row| row.get("node_id")).collect();
        changed.sort();
        Ok(changed)
    }

    async fn update_execution_progress(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        executed_nodes: i64,
        failed_nodes: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = ?, executed_nodes = ?, failed_nodes = ?, updated_at = ?
            WHERE execution_id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(executed_nodes)
        .bind(failed_nodes)
        .bind(Utc::now().to_rfc3339())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_executions(
        &self,
        uid: &str,
        canvas_id: Option<&str>,
    ) -> Result<Vec<WorkflowExecution>> {
        let rows = match canvas_id {
            Some(canvas_id) => {
                sqlx::query(
                    r#"
                    SELECT * FROM workflow_executions
                    WHERE uid = ? AND (canvas_id = ? OR source_canvas_id = ?)
                    ORDER BY created_at DESC
                    "#,
                )
                .bind(uid)
                .bind(canvas_id)
                .bind(canvas_id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM workflow_executions WHERE uid = ? ORDER BY created_at DESC")
                    .bind(uid)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        Ok(rows.iter().map(execution_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory_pool;
    use serde_json::json;

    async fn store() -> SqliteExecutionStore {
        let store = SqliteExecutionStore::new(memory_pool().await.unwrap());
        store.init_schema().await.unwrap();
        store
    }

    fn execution(id: &str) -> WorkflowExecution {
        let now = Utc::now();
        WorkflowExecution {
            execution_id: id.to_string(),
            uid: "u1".into(),
            title: "demo".into(),
            canvas_id: "c1".into(),
            source_canvas_id: "c1".into(),
            variables: vec![],
            status: ExecutionStatus::Executing,
            total_nodes: 2,
            executed_nodes: 0,
            failed_nodes: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn node(execution_id: &str, node_id: &str, parents: &[&str]) -> WorkflowNodeExecution {
        let now = Utc::now();
        WorkflowNodeExecution {
            node_execution_id: format!("{}-{}", execution_id, node_id),
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            node_type: "skillResponse".into(),
            entity_id: format!("e-{}", node_id),
            title: node_id.to_uppercase(),
            status: NodeStatus::Waiting,
            progress: 0,
            error_message: None,
            processed_query: "q".into(),
            original_query: "q".into(),
            node_data: json!({ "id": node_id }),
            connect_to: vec![],
            parent_node_ids: parents.iter().map(|p| p.to_string()).collect(),
            child_node_ids: vec![],
            result_history: vec![],
            start_time: None,
            end_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_and_load_execution() {
        let store = store().await;
        store
            .create_execution(&execution("ex1"), &[node("ex1", "a", &[]), node("ex1", "b", &["a"])])
            .await
            .unwrap();

        let loaded = store.get_execution("ex1").await.unwrap().unwrap();
        assert_eq!(loaded.total_nodes, 2);
        assert_eq!(loaded.status, ExecutionStatus::Executing);

        let nodes = store.list_node_executions("ex1").await.unwrap();
        assert_eq!(nodes.iter().map(|n| n.node_id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(nodes[1].parent_node_ids, vec!["a".to_string()]);
        assert!(store.get_node_execution("ex1", "zzz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_execution_is_atomic() {
        let store = store().await;
        // Duplicate node id violates UNIQUE(execution_id, node_id) and rolls back everything
        let result = store
            .create_execution(&execution("ex1"), &[node("ex1", "a", &[]), {
                let mut dup = node("ex1", "a", &[]);
                dup.node_execution_id = "other".into();
                dup
            }])
            .await;

        assert!(result.is_err());
        assert!(store.get_execution("ex1").await.unwrap().is_none());
        assert!(store.list_node_executions("ex1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let store = store().await;
        store.create_execution(&execution("ex1"), &[node("ex1", "a", &[])]).await.unwrap();

        let now = Utc::now();
        let first = store
            .transition_node("ex1", "a", &[NodeStatus::Waiting], &NodeTransition::executing(now))
            .await
            .unwrap();
        let second = store
            .transition_node("ex1", "a", &[NodeStatus::Waiting], &NodeTransition::executing(now))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let node = store.get_node_execution("ex1", "a").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Executing);
        assert!(node.start_time.is_some());
        assert_eq!(node.progress, 0);

        let failed = store
            .transition_node("ex1", "a", &[NodeStatus::Executing], &NodeTransition::failed(now, "boom"))
            .await
            .unwrap();
        assert!(failed);
        let node = store.get_node_execution("ex1", "a").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert_eq!(node.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_count_finished_and_batch_finish() {
        let store = store().await;
        store
            .create_execution(
                &execution("ex1"),
                &[node("ex1", "a", &[]), node("ex1", "b", &[]), node("ex1", "c", &["a", "b"])],
            )
            .await
            .unwrap();

        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(store.count_finished("ex1", &ids).await.unwrap(), 0);

        let changed = store.finish_waiting_nodes("ex1", &ids, Utc::now()).await.unwrap();
        assert_eq!(changed, ids);
        assert_eq!(store.count_finished("ex1", &ids).await.unwrap(), 2);

        // Already finished rows are not touched again
        let again = store.finish_waiting_nodes("ex1", &ids, Utc::now()).await.unwrap();
        assert!(again.is_empty());
        let a = store.get_node_execution("ex1", "a").await.unwrap().unwrap();
        assert_eq!(a.progress, 100);
        assert!(a.end_time.is_some());
    }

    #[tokio::test]
    async fn test_corrupt_json_columns_degrade_to_defaults() {
        let store = store().await;
        store.create_execution(&execution("ex1"), &[node("ex1", "a", &[])]).await.unwrap();

        sqlx::query("UPDATE workflow_node_executions SET parent_node_ids = '{oops', result_history = NULL")
            .execute(&store.pool)
            .await
            .unwrap();

        let node = store.get_node_execution("ex1", "a").await.unwrap().unwrap();
        assert!(node.parent_node_ids.is_empty());
        assert!(node.result_history.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_status_never_reads_as_runnable() {
        let store = store().await;
        store.create_execution(&execution("ex1"), &[node("ex1", "a", &[])]).await.unwrap();

        sqlx::query("UPDATE workflow_node_executions SET status = 'paused'")
            .execute(&store.pool)
            .await
            .unwrap();

        let node = store.get_node_execution("ex1", "a").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        let applied = store
            .transition_node("ex1", "a", &[NodeStatus::Waiting], &NodeTransition::executing(Utc::now()))
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn test_progress_update_and_listing() {
        let store = store().await;
        store.create_execution(&execution("ex1"), &[]).await.unwrap();
        store
            .update_execution_progress("ex1", ExecutionStatus::Finish, 2, 0)
            .await
            .unwrap();

        let listed = store.list_executions("u1", Some("c1")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ExecutionStatus::Finish);
        assert_eq!(listed[0].executed_nodes, 2);
        assert!(store.list_executions("someone-else", None).await.unwrap().is_empty());
    }
}
