//! Graph ("space") documents.
//!
//! Live layout, shared with the web client:
//! ```text
//! root map "context"
//!   ├── "edges": Y.Map<edge id, { from, to }>
//!   └── "nodes": Y.Map<node id, { id, type, x, y, name, src? }>
//! ```
//! Entry values are plain objects. Stored layout is the same two maps, each
//! serialized to its own JSON string.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use yrs::{Any, Array, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn, Transact, WriteTxn};

use super::CodecError;
use crate::identity::DocumentKind;
use crate::storage::StoredPayload;

pub const CONTEXT_MAP: &str = "context";
pub const EDGES_KEY: &str = "edges";
pub const NODES_KEY: &str = "nodes";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Head,
    Note,
    Subspace,
    Url,
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub x: f64,
    pub y: f64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, node_type: NodeType, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type,
            x: 0.0,
            y: 0.0,
            name: name.into(),
            src: None,
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.x = x;
        self.y = y;
        self
    }

    pub fn with_src(mut self, src: impl Into<String>) -> Self {
        self.src = Some(src.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

impl GraphEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Decoded graph document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDocument {
    pub nodes: BTreeMap<String, GraphNode>,
    pub edges: BTreeMap<String, GraphEdge>,
}

impl GraphDocument {
    /// A fresh document holding only its head node.
    pub fn with_head(head: GraphNode) -> Self {
        let mut graph = Self::default();
        graph.nodes.insert(head.id.clone(), head);
        graph
    }

    pub fn head(&self) -> Option<&GraphNode> {
        self.nodes.values().find(|n| n.node_type == NodeType::Head)
    }

    pub fn insert_node(&mut self, node: GraphNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn insert_edge(&mut self, id: impl Into<String>, edge: GraphEdge) {
        self.edges.insert(id.into(), edge);
    }

    /// Check the graph invariants: node keys match ids, exactly one head,
    /// every edge endpoint exists, and the head never loops onto itself.
    pub fn validate(&self) -> Result<(), CodecError> {
        for (key, node) in &self.nodes {
            if key != &node.id {
                return Err(CodecError::NodeKeyMismatch {
                    key: key.clone(),
                    id: node.id.clone(),
                });
            }
        }

        let heads: Vec<&GraphNode> = self
            .nodes
            .values()
            .filter(|n| n.node_type == NodeType::Head)
            .collect();
        let head = match heads.as_slice() {
            [] => return Err(CodecError::MissingHead),
            [head] => *head,
            many => return Err(CodecError::MultipleHeads(many.len())),
        };

        for (edge_id, edge) in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(CodecError::DanglingEdge {
                        edge: edge_id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
            if edge.from == head.id && edge.to == head.id {
                return Err(CodecError::HeadSelfLoop(edge_id.clone()));
            }
        }
        Ok(())
    }
}

/// Stored form: the two maps as independent JSON strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphPayload {
    pub edges: String,
    pub nodes: String,
}

impl StoredPayload for GraphPayload {
    const KIND: DocumentKind = DocumentKind::Graph;
}

pub struct GraphCodec;

impl GraphCodec {
    /// Serialize a well-formed graph. Invariant violations are rejected.
    pub fn encode(graph: &GraphDocument) -> Result<GraphPayload, CodecError> {
        graph.validate()?;
        let edges = serde_json::to_string(&graph.edges)
            .map_err(|source| CodecError::Json { field: EDGES_KEY, source })?;
        let nodes = serde_json::to_string(&graph.nodes)
            .map_err(|source| CodecError::Json { field: NODES_KEY, source })?;
        Ok(GraphPayload { edges, nodes })
    }

    pub fn decode(payload: &GraphPayload) -> Result<GraphDocument, CodecError> {
        let edges = serde_json::from_str(&payload.edges)
            .map_err(|source| CodecError::Json { field: EDGES_KEY, source })?;
        let nodes = serde_json::from_str(&payload.nodes)
            .map_err(|source| CodecError::Json { field: NODES_KEY, source })?;
        let graph = GraphDocument { nodes, edges };
        graph.validate()?;
        Ok(graph)
    }

    /// Write `graph` into the live document's `context` map.
    pub fn apply(doc: &Doc, graph: &GraphDocument) -> Result<(), CodecError> {
        let edge_values = graph
            .edges
            .iter()
            .map(|(id, edge)| Ok((id.clone(), to_any(EDGES_KEY, id, edge)?)))
            .collect::<Result<Vec<_>, CodecError>>()?;
        let node_values = graph
            .nodes
            .iter()
            .map(|(id, node)| Ok((id.clone(), to_any(NODES_KEY, id, node)?)))
            .collect::<Result<Vec<_>, CodecError>>()?;

        let mut txn = doc.transact_mut();
        let context = txn.get_or_insert_map(CONTEXT_MAP);
        let edges: MapRef = context.insert(&mut txn, EDGES_KEY, MapPrelim::default());
        for (id, value) in edge_values {
            edges.insert(&mut txn, id, value);
        }
        let nodes: MapRef = context.insert(&mut txn, NODES_KEY, MapPrelim::default());
        for (id, value) in node_values {
            nodes.insert(&mut txn, id, value);
        }
        Ok(())
    }

    /// Read the current graph out of a live document.
    ///
    /// Does not validate; a document mid-edit may be transiently inconsistent.
    pub fn extract(doc: &Doc) -> Result<GraphDocument, CodecError> {
        let txn = doc.transact();
        let Some(context) = txn.get_map(CONTEXT_MAP) else {
            return Ok(GraphDocument::default());
        };
        Ok(GraphDocument {
            edges: read_entries(&txn, &context, EDGES_KEY)?,
            nodes: read_entries(&txn, &context, NODES_KEY)?,
        })
    }
}

fn to_any<T: Serialize>(field: &'static str, key: &str, value: &T) -> Result<Any, CodecError> {
    let json = serde_json::to_value(value).map_err(|source| CodecError::Entry {
        field,
        key: key.to_string(),
        source,
    })?;
    Ok(json_to_any(&json))
}

fn read_entries<T, Txn>(
    txn: &Txn,
    context: &MapRef,
    field: &'static str,
) -> Result<BTreeMap<String, T>, CodecError>
where
    T: DeserializeOwned,
    Txn: ReadTxn,
{
    let raw: Vec<(String, Value)> = match context.get(txn, field) {
        None => Vec::new(),
        Some(Out::YMap(map)) => map
            .iter(txn)
            .map(|(key, value)| (key.to_string(), out_to_json(txn, value)))
            .collect(),
        Some(Out::Any(Any::Map(map))) => map
            .iter()
            .map(|(key, value)| (key.clone(), any_to_json(value)))
            .collect(),
        Some(_) => return Err(CodecError::NotAMap(field)),
    };

    raw.into_iter()
        .map(|(key, json)| {
            let parsed = serde_json::from_value(json).map_err(|source| CodecError::Entry {
                field,
                key: key.clone(),
                source,
            })?;
            Ok((key, parsed))
        })
        .collect()
}

fn out_to_json<Txn: ReadTxn>(txn: &Txn, value: Out) -> Value {
    match value {
        Out::Any(any) => any_to_json(&any),
        Out::YMap(map) => Value::Object(
            map.iter(txn)
                .map(|(key, value)| (key.to_string(), out_to_json(txn, value)))
                .collect(),
        ),
        Out::YArray(array) => {
            Value::Array(array.iter(txn).map(|value| out_to_json(txn, value)).collect())
        }
        Out::YText(text) => Value::String(text.get_string(txn)),
        _ => Value::Null,
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), any_to_json(value)))
                .collect(),
        ),
        _ => Value::Null,
    }
}

fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => Any::Number(n.as_f64().unwrap_or_default()),
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn head() -> GraphNode {
        GraphNode::new("H", NodeType::Head, "My space").with_src("url-h")
    }

    fn sample_graph() -> GraphDocument {
        let mut graph = GraphDocument::with_head(head());
        graph.insert_node(GraphNode::new("N1", NodeType::Note, "todo").at(120.0, -40.5).with_src("n1"));
        graph.insert_node(GraphNode::new("U1", NodeType::Url, "docs").at(-3.0, 8.0));
        graph.insert_edge("e1", GraphEdge::new("H", "N1"));
        graph.insert_edge("e2", GraphEdge::new("N1", "U1"));
        graph
    }

    #[test]
    fn test_payload_roundtrip() {
        let graph = sample_graph();
        let payload = GraphCodec::encode(&graph).unwrap();
        assert_eq!(GraphCodec::decode(&payload).unwrap(), graph);
    }

    #[test]
    fn test_payload_shape() {
        let mut graph = GraphDocument::with_head(GraphNode::new("H", NodeType::Head, "s"));
        graph.insert_node(GraphNode::new("N1", NodeType::Note, "n"));
        graph.insert_edge("e1", GraphEdge::new("H", "N1"));
        let payload = GraphCodec::encode(&graph).unwrap();

        assert_eq!(payload.edges, r#"{"e1":{"from":"H","to":"N1"}}"#);
        let nodes: Value = serde_json::from_str(&payload.nodes).unwrap();
        assert_eq!(nodes["H"]["type"], "head");
        assert_eq!(nodes["N1"]["name"], "n");
        assert!(nodes["N1"].get("src").is_none());
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        let payload = GraphPayload {
            edges: "{not json".into(),
            nodes: "{}".into(),
        };
        assert!(matches!(
            GraphCodec::decode(&payload),
            Err(CodecError::Json { field: "edges", .. })
        ));
    }

    #[test]
    fn test_decode_rejects_dangling_edge() {
        let payload = GraphPayload {
            edges: r#"{"e1":{"from":"H","to":"GONE"}}"#.into(),
            nodes: r#"{"H":{"id":"H","type":"head","x":0,"y":0,"name":"s"}}"#.into(),
        };
        match GraphCodec::decode(&payload) {
            Err(CodecError::DanglingEdge { edge, node }) => {
                assert_eq!(edge, "e1");
                assert_eq!(node, "GONE");
            }
            other => panic!("expected dangling edge, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_missing_or_duplicate_head() {
        let no_head = GraphPayload {
            edges: "{}".into(),
            nodes: r#"{"N":{"id":"N","type":"note","x":0,"y":0,"name":"n"}}"#.into(),
        };
        assert!(matches!(GraphCodec::decode(&no_head), Err(CodecError::MissingHead)));

        let two_heads = GraphPayload {
            edges: "{}".into(),
            nodes: r#"{"A":{"id":"A","type":"head","x":0,"y":0,"name":"a"},
                       "B":{"id":"B","type":"head","x":0,"y":0,"name":"b"}}"#
                .into(),
        };
        assert!(matches!(GraphCodec::decode(&two_heads), Err(CodecError::MultipleHeads(2))));
    }

    #[test]
    fn test_decode_rejects_unknown_node_type() {
        let payload = GraphPayload {
            edges: "{}".into(),
            nodes: r#"{"H":{"id":"H","type":"banana","x":0,"y":0,"name":"s"}}"#.into(),
        };
        assert!(GraphCodec::decode(&payload).is_err());
    }

    #[test]
    fn test_validate_head_self_loop_and_key_mismatch() {
        let mut graph = GraphDocument::with_head(head());
        graph.insert_edge("loop", GraphEdge::new("H", "H"));
        assert!(matches!(graph.validate(), Err(CodecError::HeadSelfLoop(_))));

        let mut graph = GraphDocument::with_head(head());
        graph.nodes.insert("other".into(), GraphNode::new("N1", NodeType::Image, "img"));
        assert!(matches!(graph.validate(), Err(CodecError::NodeKeyMismatch { .. })));
    }

    #[test]
    fn test_live_document_roundtrip() {
        let graph = sample_graph();
        let doc = Doc::new();
        GraphCodec::apply(&doc, &graph).unwrap();
        assert_eq!(GraphCodec::extract(&doc).unwrap(), graph);
    }

    #[test]
    fn test_extract_empty_document() {
        let doc = Doc::new();
        let graph = GraphCodec::extract(&doc).unwrap();
        assert!(graph.nodes.is_empty());
        assert!(matches!(graph.validate(), Err(CodecError::MissingHead)));
    }

    #[test]
    fn test_extract_reads_edits_made_by_a_client() {
        let doc = Doc::new();
        GraphCodec::apply(&doc, &GraphDocument::with_head(head())).unwrap();
        {
            let mut txn = doc.transact_mut();
            let context = txn.get_or_insert_map(CONTEXT_MAP);
            let Some(Out::YMap(nodes)) = context.get(&txn, NODES_KEY) else {
                panic!("nodes map missing");
            };
            let node = json_to_any(&serde_json::json!({
                "id": "I1", "type": "image", "x": 5, "y": 6, "name": "pic", "src": "s3://pic"
            }));
            nodes.insert(&mut txn, "I1", node);
        }
        let graph = GraphCodec::extract(&doc).unwrap();
        let image = &graph.nodes["I1"];
        assert_eq!(image.node_type, NodeType::Image);
        assert_eq!(image.x, 5.0);
        assert_eq!(image.src.as_deref(), Some("s3://pic"));
    }

    fn node_type() -> impl Strategy<Value = NodeType> {
        prop_oneof![
            Just(NodeType::Note),
            Just(NodeType::Subspace),
            Just(NodeType::Url),
            Just(NodeType::Image),
        ]
    }

    // Quarter-unit coordinates survive a JSON text round trip exactly.
    fn coordinate() -> impl Strategy<Value = f64> {
        (-40_000i32..40_000).prop_map(|v| f64::from(v) / 4.0)
    }

    fn well_formed_graph() -> impl Strategy<Value = GraphDocument> {
        let children = prop::collection::vec(
            (node_type(), coordinate(), coordinate(), "[a-z ]{0,12}", prop::option::of("[a-z0-9]{1,8}")),
            0..8,
        );
        (children, prop::collection::vec((any::<prop::sample::Index>(), any::<prop::sample::Index>()), 0..8))
            .prop_map(|(children, edges)| {
                let mut graph = GraphDocument::with_head(GraphNode::new("head", NodeType::Head, "root"));
                for (i, (node_type, x, y, name, src)) in children.into_iter().enumerate() {
                    let mut node = GraphNode::new(format!("n{i}"), node_type, name).at(x, y);
                    node.src = src;
                    graph.insert_node(node);
                }
                let ids: Vec<String> = graph.nodes.keys().cloned().collect();
                for (i, (from, to)) in edges.into_iter().enumerate() {
                    let from = from.get(&ids).clone();
                    let to = to.get(&ids).clone();
                    if from == "head" && to == "head" {
                        continue;
                    }
                    graph.insert_edge(format!("e{i}"), GraphEdge::new(from, to));
                }
                graph
            })
    }

    proptest! {
        #[test]
        fn prop_payload_roundtrip(graph in well_formed_graph()) {
            let payload = GraphCodec::encode(&graph).unwrap();
            prop_assert_eq!(GraphCodec::decode(&payload).unwrap(), graph);
        }

        #[test]
        fn prop_live_roundtrip(graph in well_formed_graph()) {
            let doc = Doc::new();
            GraphCodec::apply(&doc, &graph).unwrap();
            prop_assert_eq!(GraphCodec::extract(&doc).unwrap(), graph);
        }
    }
}
