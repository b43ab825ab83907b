//! Precision-lowering pass over a trained dataflow graph.
//!
//! Converts caller-selected f32 computation nodes to bfloat16, inserting,
//! removing or retyping explicit `Cast` nodes so the rewritten graph stays
//! numerically well-typed end to end. The pass is one stage of a larger
//! model-optimization pipeline: the caller decides *which* nodes convert,
//! this crate performs strictly the graph rewrite.
//!
//! ```
//! use bf16_lower::{lower_to_bf16, AttrValue, DType, Device, Graph, InputRef, Node};
//!
//! let mut graph = Graph::new();
//! graph
//!     .add_node(Node::new("input", "Placeholder").with_attr("dtype", AttrValue::DType(DType::F32)))
//!     .unwrap();
//! graph
//!     .add_node(
//!         Node::new("act", "Relu")
//!             .with_input(InputRef::data("input", 0))
//!             .with_attr("T", AttrValue::DType(DType::F32)),
//!     )
//!     .unwrap();
//!
//! let changed = lower_to_bf16(&mut graph, Vec::<String>::new(), vec!["act"], Device::Cpu).unwrap();
//! assert!(changed);
//! // "act" now computes in bf16 behind a spliced f32 -> bf16 cast
//! assert_eq!(graph.node_by_name("act").unwrap().attr_dtype("T"), Some(DType::Bf16));
//! ```

pub mod dtype;
pub mod error;
pub mod graph;
pub mod passes;
pub mod schema;

pub use dtype::{AttrValue, DType, TensorData, TensorValue};
pub use error::{LowerError, Result};
pub use graph::{Graph, GraphDoc, GraphMeta, InputRef, Node, NodeId};
pub use passes::{lower_to_bf16, Bf16Lowering, GraphPass};
pub use schema::Device;
