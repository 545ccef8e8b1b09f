/// Canvas layer boundary and its SQLite implementation
///
/// The scheduler talks to canvases only through `CanvasService`. The SQLite
/// store keeps canvases as rows, nodes and edges as child rows so that
/// materializing a node is a single idempotent insert.

use crate::canvas::types::{
    Canvas, CanvasEdge, CanvasGraph, CanvasNode, CanvasNodeData, ConnectFilter,
    CreateCanvasRequest, NodeDiff, WorkflowVariable,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{sqlite::SqlitePool, Row};

/// Operations the scheduler needs from the canvas layer
#[async_trait]
pub trait CanvasService: Send + Sync {
    /// Load a canvas with its graph and variables
    async fn get_canvas(&self, canvas_id: &str) -> Result<Option<Canvas>>;

    /// Create an empty canvas; returns the variables as the canvas layer stored them
    async fn create_canvas(&self, request: CreateCanvasRequest) -> Result<Vec<WorkflowVariable>>;

    /// Replace a canvas's variable bindings; returns the stored (normalized) values
    async fn update_variables(
        &self,
        canvas_id: &str,
        variables: &[WorkflowVariable],
    ) -> Result<Vec<WorkflowVariable>>;

    /// Materialize a node into a target canvas, wiring it to already-present parents
    async fn add_node_to_canvas(
        &self,
        canvas_id: &str,
        node: &CanvasNode,
        connect_to: &[ConnectFilter],
    ) -> Result<()>;

    /// Push a partial node update to a live canvas
    async fn sync_node_diff(&self, canvas_id: &str, diff: &NodeDiff) -> Result<()>;
}

/// Canvas layer validation: trimmed unique names, typed values
pub fn normalize_variables(variables: &[WorkflowVariable]) -> Vec<WorkflowVariable> {
    let mut normalized: Vec<WorkflowVariable> = Vec::with_capacity(variables.len());

    for var in variables {
        let name = var.name.trim();
        if name.is_empty() {
            continue;
        }

        let mut var = var.clone();
        var.name = name.to_string();
        for value in &mut var.value {
            if value.kind.is_empty() {
                value.kind = "text".to_string();
            }
        }
        if var.variable_type.is_none() {
            var.variable_type = Some("string".to_string());
        }

        // Last binding for a name wins
        if let Some(existing) = normalized.iter_mut().find(|v| v.name == var.name) {
            *existing = var;
        } else {
            normalized.push(var);
        }
    }

    normalized
}

/// SQLite-backed canvas store
#[derive(Debug, Clone)]
pub struct SqliteCanvasService {
    pool: SqlitePool,
}

impl SqliteCanvasService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the canvas schema (safe to call repeatedly)
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvases (
                canvas_id TEXT PRIMARY KEY,
                uid TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                variables TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvas_nodes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                canvas_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                UNIQUE(canvas_id, node_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvas_edges (
                canvas_id TEXT NOT NULL,
                source TEXT NOT NULL,
                target TEXT NOT NULL,
                PRIMARY KEY (canvas_id, source, target)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvas_node_diffs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                canvas_id TEXT NOT NULL,
                node_id TEXT NOT NULL,
                diff TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store a canvas, replacing its graph and variables
    pub async fn save_canvas(&self, canvas: &Canvas) -> Result<()> {
        let now = chrono::Utc::now().to_rfc3339();
        let variables_json = serde_json::to_string(&normalize_variables(&canvas.variables))?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO canvases (canvas_id, uid, title, variables, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(canvas_id) DO UPDATE SET
                uid = excluded.uid,
                title = excluded.title,
                variables = excluded.variables,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&canvas.canvas_id)
        .bind(&canvas.uid)
        .bind(&canvas.title)
        .bind(&variables_json)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM canvas_nodes WHERE canvas_id = ?")
            .bind(&canvas.canvas_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM canvas_edges WHERE canvas_id = ?")
            .bind(&canvas.canvas_id)
            .execute(&mut *tx)
            .await?;

        for node in &canvas.graph.nodes {
            sqlx::query(
                "INSERT INTO canvas_nodes (canvas_id, node_id, node_type, data) VALUES (?, ?, ?, ?)",
            )
            .bind(&canvas.canvas_id)
            .bind(&node.id)
            .bind(&node.node_type)
            .bind(serde_json::to_string(&node.data)?)
            .execute(&mut *tx)
            .await?;
        }

        for edge in &canvas.graph.edges {
            sqlx::query(
                "INSERT OR IGNORE INTO canvas_edges (canvas_id, source, target) VALUES (?, ?, ?)",
            )
            .bind(&canvas.canvas_id)
            .bind(&edge.source)
            .bind(&edge.target)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Node diffs pushed to a canvas, oldest first
    pub async fn list_node_diffs(&self, canvas_id: &str) -> Result<Vec<NodeDiff>> {
        let rows = sqlx::query(
            "SELECT node_id, diff FROM canvas_node_diffs WHERE canvas_id = ? ORDER BY id",
        )
        .bind(canvas_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| NodeDiff {
                node_id: row.get("node_id"),
                metadata: serde_json::from_str(row.get::<String, _>("diff").as_str())
                    .unwrap_or_default(),
            })
            .collect())
    }

    /// Number of canvases (used by tests and health reporting)
    pub async fn count_canvases(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM canvases")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn load_graph(&self, canvas_id: &str) -> Result<CanvasGraph> {
        let node_rows = sqlx::query(
            "SELECT node_id, node_type, data FROM canvas_nodes WHERE canvas_id = ? ORDER BY seq",
        )
        .bind(canvas_id)
        .fetch_all(&self.pool)
        .await?;

        let nodes = node_rows
            .into_iter()
            .map(|row| {
                let data: String = row.get("data");
                CanvasNode {
                    id: row.get("node_id"),
                    node_type: row.get("node_type"),
                    data: serde_json::from_str::<CanvasNodeData>(&data).unwrap_or_default(),
                }
            })
            .collect();

        let edge_rows = sqlx::query(
            "SELECT source, target FROM canvas_edges WHERE canvas_id = ? ORDER BY rowid",
        )
        .bind(canvas_id)
        .fetch_all(&self.pool)
        .await?;

        let edges = edge_rows
            .into_iter()
            .map(|row| CanvasEdge::new(row.get::<String, _>("source"), row.get::<String, _>("target")))
            .collect();

        Ok(CanvasGraph { nodes, edges })
    }

    async fn read_variables(&self, canvas_id: &str) -> Result<Vec<WorkflowVariable>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT variables FROM canvases WHERE canvas_id = ?")
            .bind(canvas_id)
            .fetch_optional(&self.pool)
            .await?;
        let raw = raw.with_context(|| format!("Canvas not found: {}", canvas_id))?;
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }
}

#[async_trait]
impl CanvasService for SqliteCanvasService {
    async fn get_canvas(&self, canvas_id: &str) -> Result<Option<Canvas>> {
        let row = sqlx::query("SELECT canvas_id, uid, title, variables FROM canvases WHERE canvas_id = ?")
            .bind(canvas_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let variables: String = row.get("variables");
        Ok(Some(Canvas {
            canvas_id: row.get("canvas_id"),
            uid: row.get("uid"),
            title: row.get("title"),
            variables: serde_json::from_str(&variables).unwrap_or_default(),
            graph: self.load_graph(canvas_id).await?,
        }))
    }

    async fn create_canvas(&self, request: CreateCanvasRequest) -> Result<Vec<WorkflowVariable>> {
        let now = chrono::Utc::now().to_rfc3339();
        let variables_json = serde_json::to_string(&normalize_variables(&request.variables))?;

        sqlx::query(
            r#"
            INSERT INTO canvases (canvas_id, uid, title, variables, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.canvas_id)
        .bind(&request.uid)
        .bind(&request.title)
        .bind(&variables_json)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to create canvas {}", request.canvas_id))?;

        tracing::info!("🆕 Created canvas {} ({})", request.canvas_id, request.title);

        self.read_variables(&request.canvas_id).await
    }

    async fn update_variables(
        &self,
        canvas_id: &str,
        variables: &[WorkflowVariable],
    ) -> Result<Vec<WorkflowVariable>> {
        let variables_json = serde_json::to_string(&normalize_variables(variables))?;

        let result = sqlx::query("UPDATE canvases SET variables = ?, updated_at = ? WHERE canvas_id = ?")
            .bind(&variables_json)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(canvas_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("Canvas not found: {}", canvas_id);
        }

        self.read_variables(canvas_id).await
    }

    async fn add_node_to_canvas(
        &self,
        canvas_id: &str,
        node: &CanvasNode,
        connect_to: &[ConnectFilter],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO canvas_nodes (canvas_id, node_id, node_type, data) VALUES (?, ?, ?, ?)",
        )
        .bind(canvas_id)
        .bind(&node.id)
        .bind(&node.node_type)
        .bind(serde_json::to_string(&node.data)?)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!("♻️ Node {} already present in canvas {}", node.id, canvas_id);
            tx.commit().await?;
            return Ok(());
        }

        // Wire to every materialized node whose entity matches a connect filter
        for filter in connect_to {
            let sources: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT node_id FROM canvas_nodes
                WHERE canvas_id = ? AND node_type = ?
                  AND json_extract(data, '$.entityId') = ?
                "#,
            )
            .bind(canvas_id)
            .bind(&filter.node_type)
            .bind(&filter.entity_id)
            .fetch_all(&mut *tx)
            .await?;

            for source in sources {
                let (from, to) = if filter.handle_type == "target" {
                    (node.id.clone(), source)
                } else {
                    (source, node.id.clone())
                };
                sqlx::query(
                    "INSERT OR IGNORE INTO canvas_edges (canvas_id, source, target) VALUES (?, ?, ?)",
                )
                .bind(canvas_id)
                .bind(&from)
                .bind(&to)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        tracing::debug!("🧩 Materialized node {} into canvas {}", node.id, canvas_id);
        Ok(())
    }

    async fn sync_node_diff(&self, canvas_id: &str, diff: &NodeDiff) -> Result<()> {
        let patch = serde_json::to_string(&diff.metadata)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE canvas_nodes
            SET data = json_set(data, '$.metadata', json_patch(COALESCE(json_extract(data, '$.metadata'), '{}'), json(?)))
            WHERE canvas_id = ? AND node_id = ?
            "#,
        )
        .bind(&patch)
        .bind(canvas_id)
        .bind(&diff.node_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO canvas_node_diffs (canvas_id, node_id, diff, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(canvas_id)
        .bind(&diff.node_id)
        .bind(&patch)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::types::VariableValue;
    use crate::database::memory_pool;
    use serde_json::json;

    async fn store() -> SqliteCanvasService {
        let service = SqliteCanvasService::new(memory_pool().await.unwrap());
        service.init_schema().await.unwrap();
        service
    }

    fn node(id: &str, entity: &str) -> CanvasNode {
        CanvasNode {
            id: id.to_string(),
            node_type: "skillResponse".to_string(),
            data: CanvasNodeData {
                title: id.to_uppercase(),
                entity_id: entity.to_string(),
                metadata: json!({ "query": format!("run {}", id) }),
            },
        }
    }

    #[test]
    fn test_normalize_variables() {
        let vars = vec![
            WorkflowVariable {
                name: "  topic ".into(),
                value: vec![VariableValue { kind: String::new(), text: Some("a".into()) }],
                variable_type: None,
            },
            WorkflowVariable::text("", "dropped"),
            WorkflowVariable::text("topic", "b"),
        ];

        let normalized = normalize_variables(&vars);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].name, "topic");
        assert_eq!(normalized[0].rendered(), "b");
        assert_eq!(normalized[0].variable_type.as_deref(), Some("string"));
    }

    #[tokio::test]
    async fn test_save_and_load_canvas() {
        let service = store().await;
        let canvas = Canvas {
            canvas_id: "c1".into(),
            uid: "u1".into(),
            title: "Demo".into(),
            variables: vec![WorkflowVariable::text("topic", "rust")],
            graph: CanvasGraph {
                nodes: vec![node("a", "e-a"), node("b", "e-b")],
                edges: vec![CanvasEdge::new("a", "b")],
            },
        };
        service.save_canvas(&canvas).await.unwrap();

        let loaded = service.get_canvas("c1").await.unwrap().unwrap();
        assert_eq!(loaded.uid, "u1");
        assert_eq!(loaded.graph.nodes.len(), 2);
        assert_eq!(loaded.graph.nodes[0].id, "a");
        assert_eq!(loaded.graph.edges, vec![CanvasEdge::new("a", "b")]);
        assert_eq!(loaded.variables[0].rendered(), "rust");
        assert!(service.get_canvas("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_node_wires_connect_filters_and_is_idempotent() {
        let service = store().await;
        service
            .create_canvas(CreateCanvasRequest {
                canvas_id: "fork".into(),
                uid: "u1".into(),
                title: "Fork".into(),
                variables: vec![],
            })
            .await
            .unwrap();

        service.add_node_to_canvas("fork", &node("a", "e-a"), &[]).await.unwrap();
        let filter = ConnectFilter {
            node_type: "skillResponse".into(),
            entity_id: "e-a".into(),
            handle_type: "source".into(),
        };
        service.add_node_to_canvas("fork", &node("b", "e-b"), &[filter.clone()]).await.unwrap();
        service.add_node_to_canvas("fork", &node("b", "e-b"), &[filter]).await.unwrap();

        let graph = service.get_canvas("fork").await.unwrap().unwrap().graph;
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges, vec![CanvasEdge::new("a", "b")]);
    }

    #[tokio::test]
    async fn test_sync_node_diff_patches_metadata() {
        let service = store().await;
        let canvas = Canvas {
            canvas_id: "c1".into(),
            uid: "u1".into(),
            title: String::new(),
            variables: vec![],
            graph: CanvasGraph { nodes: vec![node("a", "e-a")], edges: vec![] },
        };
        service.save_canvas(&canvas).await.unwrap();

        let diff = NodeDiff {
            node_id: "a".into(),
            metadata: json!({ "status": "executing" }),
        };
        service.sync_node_diff("c1", &diff).await.unwrap();

        let loaded = service.get_canvas("c1").await.unwrap().unwrap();
        let metadata = &loaded.graph.nodes[0].data.metadata;
        assert_eq!(metadata["status"], "executing");
        assert_eq!(metadata["query"], "run a");
        assert_eq!(service.list_node_diffs("c1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_variables_requires_existing_canvas() {
        let service = store().await;
        let err = service
            .update_variables("nope", &[WorkflowVariable::text("a", "b")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Canvas not found"));
    }
}
