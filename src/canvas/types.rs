/// Canvas type definitions
///
/// The canvas is the visual graph a workflow is derived from. Only the parts the
/// scheduler reads or writes are modelled; anything else a node carries stays in
/// its free-form `metadata` JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A canvas: owner, title, variable bindings and the node graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Canvas {
    #[serde(default)]
    pub canvas_id: String,
    /// Owning user id
    pub uid: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub variables: Vec<WorkflowVariable>,
    #[serde(default)]
    pub graph: CanvasGraph,
}

/// Nodes and directed edges of a canvas
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanvasGraph {
    #[serde(default)]
    pub nodes: Vec<CanvasNode>,
    #[serde(default)]
    pub edges: Vec<CanvasEdge>,
}

/// A single canvas node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasNode {
    /// Stable node id, unique within the canvas
    pub id: String,
    /// Node type; "skillResponse" nodes are skill nodes, the rest are structural
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: CanvasNodeData,
}

/// Payload of a canvas node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasNodeData {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub entity_id: String,
    /// Free-form node metadata: query, contextItems, modelInfo, selectedToolsets, status...
    #[serde(default)]
    pub metadata: Value,
}

/// Directed edge `source -> target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
}

impl CanvasEdge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            id: format!("{}-{}", source, target),
            source,
            target,
        }
    }
}

/// A named workflow input variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowVariable {
    pub name: String,
    #[serde(default)]
    pub value: Vec<VariableValue>,
    #[serde(default)]
    pub variable_type: Option<String>,
}

/// One value of a variable (text, or a resource reference rendered by name)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableValue {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

impl WorkflowVariable {
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: vec![VariableValue {
                kind: "text".to_string(),
                text: Some(text.into()),
            }],
            variable_type: Some("string".to_string()),
        }
    }

    /// Text rendering used for query substitution
    pub fn rendered(&self) -> String {
        self.value
            .iter()
            .filter_map(|v| v.text.as_deref())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Resolve the effective variable set: explicit inputs override stored ones by name
pub fn merge_variables(
    explicit: Option<&[WorkflowVariable]>,
    stored: &[WorkflowVariable],
) -> Vec<WorkflowVariable> {
    let Some(explicit) = explicit else {
        return stored.to_vec();
    };

    let mut merged: Vec<WorkflowVariable> = stored
        .iter()
        .map(|var| {
            explicit
                .iter()
                .find(|candidate| candidate.name == var.name)
                .cloned()
                .unwrap_or_else(|| var.clone())
        })
        .collect();

    for var in explicit {
        if !merged.iter().any(|existing| existing.name == var.name) {
            merged.push(var.clone());
        }
    }

    merged
}

/// Where a node materialized into a fork canvas attaches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectFilter {
    #[serde(rename = "type")]
    pub node_type: String,
    pub entity_id: String,
    pub handle_type: String,
}

/// Partial node update pushed to a live canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDiff {
    pub node_id: String,
    /// Merge-patch applied to the node's `data.metadata`
    pub metadata: Value,
}

/// Request to create a fork target canvas
#[derive(Debug, Clone)]
pub struct CreateCanvasRequest {
    pub canvas_id: String,
    pub uid: String,
    pub title: String,
    pub variables: Vec<WorkflowVariable>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_explicit_variables_take_precedence() {
        let stored = vec![
            WorkflowVariable::text("topic", "rust"),
            WorkflowVariable::text("tone", "formal"),
        ];
        let explicit = vec![
            WorkflowVariable::text("tone", "casual"),
            WorkflowVariable::text("audience", "students"),
        ];

        let merged = merge_variables(Some(&explicit), &stored);
        let rendered: Vec<(String, String)> = merged
            .iter()
            .map(|v| (v.name.clone(), v.rendered()))
            .collect();

        assert_eq!(
            rendered,
            vec![
                ("topic".to_string(), "rust".to_string()),
                ("tone".to_string(), "casual".to_string()),
                ("audience".to_string(), "students".to_string()),
            ]
        );
        assert_eq!(merge_variables(None, &stored), stored);
    }

    #[test]
    fn test_canvas_node_deserializes_with_defaults() {
        let node: CanvasNode = serde_json::from_value(json!({
            "id": "n1",
            "type": "skillResponse",
            "data": { "title": "Summarize", "metadata": { "query": "hi" } }
        }))
        .unwrap();

        assert_eq!(node.node_type, "skillResponse");
        assert_eq!(node.data.entity_id, "");
        assert_eq!(node.data.metadata["query"], "hi");
    }

    #[test]
    fn test_rendered_skips_empty_values() {
        let var = WorkflowVariable {
            name: "files".into(),
            value: vec![
                VariableValue { kind: "resource".into(), text: Some("a.pdf".into()) },
                VariableValue { kind: "text".into(), text: None },
                VariableValue { kind: "text".into(), text: Some("b.pdf".into()) },
            ],
            variable_type: None,
        };
        assert_eq!(var.rendered(), "a.pdf, b.pdf");
    }
}
