// Graph store for the lowering pass
//
// Dataflow IR on petgraph. Each node's ordered input list is authoritative
// for edge identity; petgraph edges mirror it for consumer queries and are
// kept consistent by the mutators here. All structural mutation goes through
// `Graph` methods; callers never rewire edges directly.

use petgraph::stable_graph::StableGraph;
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::dtype::{AttrValue, DType};
use crate::error::{LowerError, Result};

/// Node identifier in the graph (petgraph NodeIndex)
pub type NodeId = petgraph::stable_graph::NodeIndex;

/// Reference from a node to one of its inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputRef {
    /// Data edge: the `port`-th output of `producer`.
    Data { producer: String, port: u32 },
    /// Ordering-only edge, carries no data.
    Control { producer: String },
}

impl InputRef {
    pub fn data(producer: impl Into<String>, port: u32) -> Self {
        InputRef::Data {
            producer: producer.into(),
            port,
        }
    }

    pub fn control(producer: impl Into<String>) -> Self {
        InputRef::Control {
            producer: producer.into(),
        }
    }

    pub fn producer(&self) -> &str {
        match self {
            InputRef::Data { producer, .. } | InputRef::Control { producer } => producer,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, InputRef::Control { .. })
    }
}

/// Dependency edge between nodes
#[derive(Debug, Clone)]
pub enum Dependency {
    /// Tensor flows from `output_slot` on the source into the consumer's
    /// input-list entry at `input_slot`.
    Data { output_slot: u32, input_slot: u32 },
    /// Execution-order dependency without data transfer.
    Control,
}

/// A node in the computation graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique name (the graph key)
    pub name: String,
    /// Operation type tag (e.g. "MatMul", "Cast", "Const")
    pub op_type: String,
    /// Ordered inputs; data entries align with the operation's input slots,
    /// control entries conventionally trail.
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    /// Attribute map (type tags, literals, flags)
    #[serde(default)]
    pub attrs: FxHashMap<String, AttrValue>,
}

impl Node {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            inputs: Vec::new(),
            attrs: FxHashMap::default(),
        }
    }

    pub fn with_input(mut self, input: InputRef) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: AttrValue) -> Self {
        self.attrs.insert(name.into(), value);
        self
    }

    pub fn attr(&self, name: &str) -> Option<&AttrValue> {
        self.attrs.get(name)
    }

    /// Current value of a type-carrying attribute.
    pub fn attr_dtype(&self, name: &str) -> Option<DType> {
        self.attrs.get(name).and_then(AttrValue::as_dtype)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: AttrValue) {
        self.attrs.insert(name.into(), value);
    }
}

/// Auxiliary graph metadata copied verbatim through the pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphMeta {
    #[serde(default)]
    pub producer: String,
    #[serde(default)]
    pub version: i64,
}

/// Serialized form of a whole graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphDoc {
    #[serde(default)]
    pub meta: GraphMeta,
    pub nodes: Vec<Node>,
}

/// Mutable dataflow graph keyed by node name.
pub struct Graph {
    /// The underlying petgraph structure
    graph: StableGraph<Node, Dependency>,

    /// Node name to node ID mapping
    name_to_id: FxHashMap<String, NodeId>,

    /// Insertion order, for deterministic dumps (StableGraph reuses indices)
    order: Vec<NodeId>,

    /// Untouched auxiliary metadata
    meta: GraphMeta,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            graph: StableGraph::new(),
            name_to_id: FxHashMap::default(),
            order: Vec::new(),
            meta: GraphMeta::default(),
        }
    }

    pub fn meta(&self) -> &GraphMeta {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut GraphMeta {
        &mut self.meta
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_id.contains_key(name)
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.name_to_id.get(name).copied()
    }

    /// Get node by ID
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.graph.node_weight(id)
    }

    /// Get mutable node by ID
    ///
    /// Attribute edits are fine through here; structural fields (`inputs`)
    /// must only change via [`Graph::set_input`].
    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.graph.node_weight_mut(id)
    }

    /// Get node by name
    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.name_to_id.get(name).and_then(|&id| self.node(id))
    }

    /// Node names in insertion order.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.order
            .iter()
            .filter_map(|&id| self.graph.node_weight(id))
            .map(|n| n.name.as_str())
    }

    /// Add a node, wiring edges from its input list. Producer references that
    /// name no node in the graph are tolerated (the reference is kept, no
    /// edge is created).
    ///
    /// Fails with [`LowerError::DuplicateNode`] when the name is taken.
    pub fn add_node(&mut self, node: Node) -> Result<NodeId> {
        let id = self.add_unwired(node)?;
        let inputs = self.graph[id].inputs.clone();
        for (index, input) in inputs.iter().enumerate() {
            self.connect(id, index, input);
        }
        Ok(id)
    }

    fn add_unwired(&mut self, node: Node) -> Result<NodeId> {
        if self.name_to_id.contains_key(&node.name) {
            return Err(LowerError::DuplicateNode(node.name));
        }
        let name = node.name.clone();
        let id = self.graph.add_node(node);
        self.name_to_id.insert(name, id);
        self.order.push(id);
        Ok(id)
    }

    fn connect(&mut self, consumer: NodeId, index: usize, input: &InputRef) {
        if let Some(&src) = self.name_to_id.get(input.producer()) {
            let dep = match input {
                InputRef::Data { port, .. } => Dependency::Data {
                    output_slot: *port,
                    input_slot: index as u32,
                },
                InputRef::Control { .. } => Dependency::Control,
            };
            self.graph.add_edge(src, consumer, dep);
        }
    }

    /// Rewire one data entry of a node's input list, keeping edges consistent.
    pub fn set_input(&mut self, consumer: NodeId, index: usize, input: InputRef) -> Result<()> {
        let old = {
            let node = self
                .graph
                .node_weight(consumer)
                .ok_or_else(|| LowerError::InvalidGraph("unknown consumer node".into()))?;
            node.inputs.get(index).cloned().ok_or_else(|| {
                LowerError::InvalidGraph(format!(
                    "input index {index} out of range for '{}'",
                    node.name
                ))
            })?
        };
        let InputRef::Data {
            producer: old_producer,
            port: old_port,
        } = &old
        else {
            return Err(LowerError::InvalidGraph(
                "cannot rewire a control dependency".into(),
            ));
        };

        if let Some(&src) = self.name_to_id.get(old_producer.as_str()) {
            let edge = self
                .graph
                .edges_directed(consumer, Direction::Incoming)
                .find(|e| {
                    e.source() == src
                        && matches!(
                            e.weight(),
                            Dependency::Data { output_slot, input_slot }
                                if *input_slot as usize == index && output_slot == old_port
                        )
                })
                .map(|e| e.id());
            if let Some(edge) = edge {
                self.graph.remove_edge(edge);
            }
        }

        self.graph[consumer].inputs[index] = input.clone();
        self.connect(consumer, index, &input);
        Ok(())
    }

    /// Remove a node from the graph; petgraph drops its edges.
    pub fn remove_node(&mut self, id: NodeId) -> Option<Node> {
        let node = self.graph.remove_node(id)?;
        self.name_to_id.remove(&node.name);
        self.order.retain(|&n| n != id);
        Some(node)
    }

    /// Distinct consumer names of a node, sorted for determinism.
    pub fn consumers(&self, id: NodeId) -> Vec<String> {
        let mut names: Vec<String> = self
            .graph
            .edges_directed(id, Direction::Outgoing)
            .filter_map(|e| self.graph.node_weight(e.target()))
            .map(|n| n.name.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Total outgoing edge count (data and control). This is the quantity the
    /// "exactly one consumer" rewrite guards compare against.
    pub fn consumer_edge_count(&self, id: NodeId) -> usize {
        self.graph.edges_directed(id, Direction::Outgoing).count()
    }

    /// Build a graph from its serialized form. Nodes are added first, then
    /// wired, so document order does not matter.
    pub fn from_doc(doc: GraphDoc) -> Result<Self> {
        let mut graph = Graph::new();
        graph.meta = doc.meta;
        for node in doc.nodes {
            graph.add_unwired(node)?;
        }
        let ids = graph.order.clone();
        for id in ids {
            let inputs = graph.graph[id].inputs.clone();
            for (index, input) in inputs.iter().enumerate() {
                graph.connect(id, index, input);
            }
        }
        Ok(graph)
    }

    /// Parse a JSON graph document.
    pub fn parse(text: &str) -> Result<Self> {
        let doc: GraphDoc =
            serde_json::from_str(text).map_err(|e| LowerError::ParseError(e.to_string()))?;
        Self::from_doc(doc)
    }

    /// Serialized form, nodes in insertion order, metadata verbatim.
    pub fn to_doc(&self) -> GraphDoc {
        GraphDoc {
            meta: self.meta.clone(),
            nodes: self
                .order
                .iter()
                .filter_map(|&id| self.graph.node_weight(id))
                .cloned()
                .collect(),
        }
    }

    /// Dump the whole graph as a JSON document.
    pub fn dump(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.to_doc())
            .map_err(|e| LowerError::SerializationError(e.to_string()))
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn placeholder(name: &str) -> Node {
        Node::new(name, "Placeholder").with_attr("dtype", AttrValue::DType(DType::F32))
    }

    #[test]
    fn test_empty_graph() {
        let graph = Graph::new();
        assert_eq!(graph.node_count(), 0);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_add_wires_edges() {
        let mut graph = Graph::new();
        let a = graph.add_node(placeholder("a")).unwrap();
        let _add = graph
            .add_node(
                Node::new("sum", "Add")
                    .with_input(InputRef::data("a", 0))
                    .with_input(InputRef::data("a", 0)),
            )
            .unwrap();
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.consumer_edge_count(a), 2);
        assert_eq!(graph.consumers(a), vec!["sum".to_string()]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut graph = Graph::new();
        graph.add_node(placeholder("a")).unwrap();
        let err = graph.add_node(placeholder("a")).unwrap_err();
        assert!(matches!(err, LowerError::DuplicateNode(name) if name == "a"));
    }

    #[test]
    fn test_dangling_reference_tolerated() {
        let mut graph = Graph::new();
        graph
            .add_node(Node::new("r", "Relu").with_input(InputRef::data("missing", 0)))
            .unwrap();
        assert_eq!(graph.edge_count(), 0);
        // the reference itself is preserved
        assert_eq!(
            graph.node_by_name("r").unwrap().inputs[0],
            InputRef::data("missing", 0)
        );
    }

    #[test]
    fn test_set_input_rewires() {
        let mut graph = Graph::new();
        let a = graph.add_node(placeholder("a")).unwrap();
        let b = graph.add_node(placeholder("b")).unwrap();
        let r = graph
            .add_node(Node::new("r", "Relu").with_input(InputRef::data("a", 0)))
            .unwrap();

        graph.set_input(r, 0, InputRef::data("b", 0)).unwrap();
        assert_eq!(graph.consumer_edge_count(a), 0);
        assert_eq!(graph.consumer_edge_count(b), 1);
        assert_eq!(
            graph.node(r).unwrap().inputs[0],
            InputRef::data("b", 0)
        );
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_remove_node_drops_edges_and_name() {
        let mut graph = Graph::new();
        let a = graph.add_node(placeholder("a")).unwrap();
        graph
            .add_node(Node::new("r", "Relu").with_input(InputRef::data("a", 0)))
            .unwrap();

        let removed = graph.remove_node(a).unwrap();
        assert_eq!(removed.name, "a");
        assert!(!graph.contains("a"));
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn test_control_dependency_edge() {
        let mut graph = Graph::new();
        let a = graph.add_node(Node::new("init", "NoOp")).unwrap();
        graph
            .add_node(Node::new("r", "Relu").with_input(InputRef::control("init")))
            .unwrap();
        assert_eq!(graph.consumer_edge_count(a), 1);
        assert_eq!(graph.consumers(a), vec!["r".to_string()]);
    }

    #[test]
    fn test_doc_round_trip() {
        let mut graph = Graph::new();
        graph.meta_mut().producer = "trainer".into();
        graph.meta_mut().version = 27;
        graph.add_node(placeholder("a")).unwrap();
        graph
            .add_node(
                Node::new("r", "Relu")
                    .with_input(InputRef::data("a", 0))
                    .with_attr("T", AttrValue::DType(DType::F32)),
            )
            .unwrap();

        let text = graph.dump().unwrap();
        let parsed = Graph::parse(&text).unwrap();
        assert_eq!(parsed.to_doc(), graph.to_doc());
        assert_eq!(parsed.meta().producer, "trainer");
        assert_eq!(parsed.edge_count(), 1);
    }

    #[test]
    fn test_doc_order_independent_wiring() {
        // consumer listed before its producer still gets an edge
        let doc = GraphDoc {
            meta: GraphMeta::default(),
            nodes: vec![
                Node::new("r", "Relu").with_input(InputRef::data("a", 0)),
                placeholder("a"),
            ],
        };
        let graph = Graph::from_doc(doc).unwrap();
        assert_eq!(graph.edge_count(), 1);
    }
}
