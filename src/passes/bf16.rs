// bf16 lowering pass
//
// Rewrites the nodes named in the convert set from f32 to bf16, managing the
// Cast nodes on every crossing edge: redundant bf16->f32 round trips are
// fused away, single-consumer casts and constants are retyped in place, and
// fresh casts are spliced wherever a neighbor must keep f32. Each node is
// visited at most once per invocation; the visit recurses into producers that
// are themselves scheduled for conversion so their outputs are already bf16
// when the edge is finalized.

use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::dtype::{AttrValue, DType};
use crate::error::Result;
use crate::graph::{Graph, InputRef, Node, NodeId};
use crate::schema::resolve::{allowed_dtypes, input_bindings, output_bindings, SlotBinding};
use crate::schema::Device;

use super::GraphPass;

const CAST: &str = "Cast";
const CONST: &str = "Const";
const QUANTIZE: &str = "QuantizeV2";

/// Operations converting quantized values back to float. Never rewritten and
/// never descended into, even when requested.
fn is_dequantize(op_type: &str) -> bool {
    op_type.contains("Dequantize")
}

/// The bf16 lowering pass.
///
/// The caller owns membership of both name sets; this pass neither selects
/// conversion candidates nor measures accuracy impact. Names absent from the
/// graph are dropped silently. The force-fp32 set is carried for the
/// surrounding pipeline's bookkeeping; sibling rewrite stages own that side.
///
/// Re-running the pass over its own output with the same request set is
/// unsupported: visited/converted bookkeeping does not persist across
/// invocations.
pub struct Bf16Lowering {
    fp32_nodes: FxHashSet<String>,
    bf16_nodes: FxHashSet<String>,
    device: Device,
}

impl Bf16Lowering {
    pub fn new(
        fp32_nodes: impl IntoIterator<Item = impl Into<String>>,
        bf16_nodes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            fp32_nodes: fp32_nodes.into_iter().map(Into::into).collect(),
            bf16_nodes: bf16_nodes.into_iter().map(Into::into).collect(),
            device: Device::default(),
        }
    }

    /// Target device for kernel capability lookups.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }
}

impl GraphPass for Bf16Lowering {
    fn name(&self) -> &str {
        "bf16-lowering"
    }

    fn run(&self, graph: &mut Graph) -> Result<bool> {
        debug!(
            fp32_requested = self.fp32_nodes.len(),
            bf16_requested = self.bf16_nodes.len(),
            "start bf16 graph conversion"
        );

        // requested names absent from the graph are dropped, never errors
        let bf16_nodes: FxHashSet<String> = self
            .bf16_nodes
            .iter()
            .filter(|n| graph.contains(n))
            .cloned()
            .collect();

        // sorted for reproducible synthesized-node ordering; correctness does
        // not depend on visit order
        let mut order: Vec<String> = bf16_nodes.iter().cloned().collect();
        order.sort();

        let mut ctx = Lowering {
            graph,
            bf16_nodes: &bf16_nodes,
            device: self.device,
            visited: FxHashSet::default(),
            changed: false,
        };
        for name in &order {
            ctx.convert(name)?;
        }

        debug!(
            converted = ctx.visited.len(),
            changed = ctx.changed,
            "bf16 graph conversion done"
        );
        Ok(ctx.changed)
    }
}

/// Rewrite `graph` in place, converting the nodes named in `bf16_nodes`.
///
/// Convenience wrapper over [`Bf16Lowering`]; returns whether the graph
/// changed. Graph metadata survives untouched.
pub fn lower_to_bf16(
    graph: &mut Graph,
    fp32_nodes: impl IntoIterator<Item = impl Into<String>>,
    bf16_nodes: impl IntoIterator<Item = impl Into<String>>,
    device: Device,
) -> Result<bool> {
    Bf16Lowering::new(fp32_nodes, bf16_nodes)
        .with_device(device)
        .run(graph)
}

/// Per-invocation rewrite state. The visited set is freshly constructed for
/// every run and discarded with it.
struct Lowering<'a> {
    graph: &'a mut Graph,
    bf16_nodes: &'a FxHashSet<String>,
    device: Device,
    visited: FxHashSet<String>,
    changed: bool,
}

impl Lowering<'_> {
    fn convert(&mut self, name: &str) -> Result<()> {
        if self.visited.contains(name) {
            return Ok(());
        }
        let Some(id) = self.graph.node_id(name) else {
            return Ok(()); // unknown references are skipped, never surfaced
        };
        {
            let Some(node) = self.graph.node(id) else {
                return Ok(());
            };
            if is_dequantize(&node.op_type) {
                return Ok(());
            }
        }
        self.visited.insert(name.to_owned());

        let Some(node) = self.graph.node(id) else {
            return Ok(());
        };
        let (Some(input_slots), Some(output_slots)) =
            (input_bindings(node), output_bindings(node))
        else {
            return Ok(()); // op unknown to the registry: nothing to reason about
        };
        let allowed = allowed_dtypes(node, self.device);

        self.rewrite_inputs(id, &input_slots, &allowed)?;
        self.rewrite_outputs(id, &output_slots)?;
        Ok(())
    }

    fn rewrite_inputs(
        &mut self,
        id: NodeId,
        slots: &[SlotBinding],
        allowed: &FxHashMap<&'static str, &'static [DType]>,
    ) -> Result<()> {
        // the whole step is skipped unless some input currently carries f32
        if !slots.iter().any(|s| s.dtype == Some(DType::F32)) {
            return Ok(());
        }

        let (name, input_refs) = {
            let Some(node) = self.graph.node(id) else {
                return Ok(());
            };
            (node.name.clone(), node.inputs.clone())
        };

        let mut data_slot = 0usize;
        for (index, input) in input_refs.iter().enumerate() {
            let InputRef::Data { producer, port } = input else {
                continue; // control dependencies carry no data
            };
            let slot = data_slot;
            data_slot += 1;

            let Some(binding) = slots.get(slot) else {
                continue;
            };
            // fixed-type slots have no governing attribute to retype
            let Some(type_attr) = binding.type_attr else {
                continue;
            };
            if allowed
                .get(type_attr)
                .is_some_and(|set| !set.contains(&DType::Bf16))
            {
                continue;
            }
            if binding.dtype != Some(DType::F32) {
                continue;
            }

            if self.rewrite_input_edge(id, &name, index, slot, producer, *port)? {
                // the slot is declared bf16 no matter which action fired; see
                // DESIGN.md on the recurse branch
                if let Some(node) = self.graph.node_mut(id) {
                    node.set_attr(type_attr, AttrValue::DType(DType::Bf16));
                }
                self.changed = true;
            }
        }
        Ok(())
    }

    /// Apply exactly one action to the input edge `producer:port -> node`, in
    /// priority order: fuse a redundant round trip, flip a cast in place,
    /// down-convert a constant in place, recurse into a converting producer,
    /// or splice a fresh cast. Returns whether an action fired.
    fn rewrite_input_edge(
        &mut self,
        id: NodeId,
        name: &str,
        index: usize,
        slot: usize,
        producer: &str,
        port: u32,
    ) -> Result<bool> {
        let Some(prod_id) = self.graph.node_id(producer) else {
            return Ok(false); // dangling producer reference: leave the edge alone
        };
        let Some(prod) = self.graph.node(prod_id).cloned() else {
            return Ok(false);
        };
        let prod_consumers = self.graph.consumer_edge_count(prod_id);

        // undo an existing bf16 -> f32 round trip used only by this edge
        if prod.op_type == CAST
            && prod.attr_dtype("SrcT") == Some(DType::Bf16)
            && prod.attr_dtype("DstT") == Some(DType::F32)
            && prod_consumers == 1
        {
            if let Some(upstream) = prod.inputs.first().cloned() {
                trace!(node = name, cast = producer, "fusing redundant bf16->f32 cast");
                self.graph.set_input(id, index, upstream)?;
                self.graph.remove_node(prod_id);
                return Ok(true);
            }
        }

        // retype a single-consumer f32-producing cast in place
        if prod.op_type == CAST
            && prod.attr_dtype("DstT") == Some(DType::F32)
            && prod_consumers == 1
        {
            trace!(node = name, cast = producer, "flipping cast output to bf16");
            if let Some(cast) = self.graph.node_mut(prod_id) {
                cast.set_attr("DstT", AttrValue::DType(DType::Bf16));
            }
            return Ok(true);
        }

        // down-convert a single-consumer f32 constant literal in place
        if prod.op_type == CONST && prod_consumers == 1 {
            if let Some(tensor) = prod.attr("value").and_then(AttrValue::as_tensor) {
                if tensor.dtype() == DType::F32 {
                    let lowered = tensor.to_bf16();
                    trace!(node = name, constant = producer, "down-converting f32 constant");
                    if let Some(constant) = self.graph.node_mut(prod_id) {
                        constant.set_attr("dtype", AttrValue::DType(DType::Bf16));
                        constant.set_attr("value", AttrValue::Tensor(lowered));
                    }
                    return Ok(true);
                }
            }
        }

        // the producer converts too: let it finish before finalizing this edge
        if self.bf16_nodes.contains(producer) && !is_dequantize(&prod.op_type) {
            self.convert(producer)?;
            return Ok(true);
        }

        // splice a fresh f32 -> bf16 cast on this edge
        let cast_name = format!("{producer}_{port}/{name}_{slot}_FP32toBF16");
        trace!(node = name, cast = %cast_name, "inserting f32->bf16 cast");
        let cast = Node::new(cast_name.as_str(), CAST)
            .with_input(InputRef::data(producer, port))
            .with_attr("SrcT", AttrValue::DType(DType::F32))
            .with_attr("DstT", AttrValue::DType(DType::Bf16))
            .with_attr("Truncate", AttrValue::Bool(false));
        // a taken name here is a fatal invariant violation
        self.graph.add_node(cast)?;
        self.graph.set_input(id, index, InputRef::data(cast_name, 0))?;
        Ok(true)
    }

    fn rewrite_outputs(&mut self, id: NodeId, slots: &[SlotBinding]) -> Result<()> {
        // output slots were resolved before the input rewrite touched the
        // node's type attributes; that snapshot decides what still needs casts
        if !slots.iter().any(|s| s.dtype == Some(DType::F32)) {
            return Ok(());
        }

        let Some(node) = self.graph.node(id) else {
            return Ok(());
        };
        let name = node.name.clone();

        for consumer_name in self.graph.consumers(id) {
            self.rewrite_consumer_edges(&name, slots, &consumer_name)?;
        }
        Ok(())
    }

    /// Retype or cast every f32 edge between this node and one consumer.
    fn rewrite_consumer_edges(
        &mut self,
        name: &str,
        out_slots: &[SlotBinding],
        consumer_name: &str,
    ) -> Result<()> {
        let Some(cons_id) = self.graph.node_id(consumer_name) else {
            return Ok(());
        };
        let Some(cons) = self.graph.node(cons_id).cloned() else {
            return Ok(());
        };
        let cons_slots = input_bindings(&cons);
        let cons_allowed = allowed_dtypes(&cons, self.device);

        // (vec index, data slot, port) of every reference the consumer holds to us
        let mut refs: Vec<(usize, usize, u32)> = Vec::new();
        let mut data_slot = 0usize;
        for (index, input) in cons.inputs.iter().enumerate() {
            let InputRef::Data { producer, port } = input else {
                continue;
            };
            let slot = data_slot;
            data_slot += 1;
            if producer == name {
                refs.push((index, slot, *port));
            }
        }

        // one synthesized cast per referenced port, shared by its references
        let mut port_casts: FxHashMap<u32, String> = FxHashMap::default();

        for (index, slot, port) in refs {
            if out_slots.get(port as usize).and_then(|b| b.dtype) != Some(DType::F32) {
                continue;
            }

            if cons.op_type == CAST {
                trace!(
                    node = name,
                    cast = consumer_name,
                    "flipping consumer cast source to bf16"
                );
                if let Some(cast) = self.graph.node_mut(cons_id) {
                    cast.set_attr("SrcT", AttrValue::DType(DType::Bf16));
                }
                self.changed = true;
            } else if cons.op_type == QUANTIZE
                && cons.attr("dtype").is_some()
                && cons_allowed
                    .get("dtype")
                    .is_some_and(|set| set.contains(&DType::Bf16))
            {
                trace!(
                    node = name,
                    quantize = consumer_name,
                    "flipping quantize input dtype to bf16"
                );
                if let Some(quantize) = self.graph.node_mut(cons_id) {
                    quantize.set_attr("dtype", AttrValue::DType(DType::Bf16));
                }
                self.changed = true;
            } else if !self.bf16_nodes.contains(consumer_name)
                || slot_excludes_bf16(cons_slots.as_deref(), slot, &cons_allowed)
            {
                let cast_name = match port_casts.get(&port) {
                    Some(existing) => existing.clone(),
                    None => {
                        let cast_name = format!("{name}_{port}/{consumer_name}_BF16toFP32");
                        trace!(node = name, cast = %cast_name, "inserting bf16->f32 cast");
                        let cast = Node::new(cast_name.as_str(), CAST)
                            .with_input(InputRef::data(name, port))
                            .with_attr("SrcT", AttrValue::DType(DType::Bf16))
                            .with_attr("DstT", AttrValue::DType(DType::F32))
                            .with_attr("Truncate", AttrValue::Bool(false));
                        // a taken name here is a fatal invariant violation
                        self.graph.add_node(cast)?;
                        port_casts.insert(port, cast_name.clone());
                        cast_name
                    }
                };
                self.graph.set_input(cons_id, index, InputRef::data(cast_name, 0))?;
                self.changed = true;
            }
            // otherwise the consumer converts too and tolerates bf16 on this
            // slot: its own visit declares the input bf16, no cast needed
        }
        Ok(())
    }
}

fn slot_excludes_bf16(
    slots: Option<&[SlotBinding]>,
    slot: usize,
    allowed: &FxHashMap<&'static str, &'static [DType]>,
) -> bool {
    let Some(attr) = slots.and_then(|s| s.get(slot)).and_then(|b| b.type_attr) else {
        return false;
    };
    allowed.get(attr).is_some_and(|set| !set.contains(&DType::Bf16))
}
