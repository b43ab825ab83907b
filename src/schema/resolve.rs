// Slot and dtype resolution
//
// Maps a node onto its signature: which attribute governs each slot, what
// concrete dtype each slot currently carries, and which dtypes each governing
// attribute may legally take on the configured device. Pure functions of the
// node and the registry; nothing here mutates the graph.

use rustc_hash::FxHashMap;

use crate::dtype::{AttrValue, DType};
use crate::graph::Node;

use super::{legal_types, signature, Device, SlotDef};

/// One resolved slot: the governing type attribute (if any) and the slot's
/// current concrete dtype as the node declares it.
///
/// `dtype` is a copy of the node's attribute value, never a view into the
/// node, so holding bindings across mutations is safe. `None` means the node
/// does not set the governing attribute.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlotBinding {
    pub type_attr: Option<&'static str>,
    pub dtype: Option<DType>,
}

/// Input slots of `node`, replicated slots expanded in order.
///
/// `None` when the operation is unknown to the registry.
pub fn input_bindings(node: &Node) -> Option<Vec<SlotBinding>> {
    signature(&node.op_type).map(|sig| expand(node, sig.inputs))
}

/// Output slots of `node`, replicated slots expanded in order.
pub fn output_bindings(node: &Node) -> Option<Vec<SlotBinding>> {
    signature(&node.op_type).map(|sig| expand(node, sig.outputs))
}

fn expand(node: &Node, slots: &[SlotDef]) -> Vec<SlotBinding> {
    let mut bindings = Vec::with_capacity(slots.len());
    for def in slots {
        let count = match def.count_attr {
            // a counted slot without its count attribute contributes nothing
            Some(attr) => node.attr(attr).and_then(AttrValue::as_int).unwrap_or(0).max(0) as usize,
            None => 1,
        };
        let binding = SlotBinding {
            type_attr: def.type_attr,
            dtype: def
                .fixed
                .or_else(|| def.type_attr.and_then(|attr| node.attr_dtype(attr))),
        };
        bindings.extend(std::iter::repeat(binding).take(count));
    }
    bindings
}

/// Legal dtype sets per governing attribute for this node on `device`.
pub fn allowed_dtypes(node: &Node, device: Device) -> FxHashMap<&'static str, &'static [DType]> {
    legal_types(&node.op_type, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InputRef;

    #[test]
    fn test_simple_binding() {
        let node = Node::new("m", "MatMul").with_attr("T", AttrValue::DType(DType::F32));
        let inputs = input_bindings(&node).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].type_attr, Some("T"));
        assert_eq!(inputs[0].dtype, Some(DType::F32));
        let outputs = output_bindings(&node).unwrap();
        assert_eq!(outputs.len(), 1);
    }

    #[test]
    fn test_counted_slot_expansion() {
        let node = Node::new("s", "AddN")
            .with_attr("N", AttrValue::Int(3))
            .with_attr("T", AttrValue::DType(DType::F32));
        let inputs = input_bindings(&node).unwrap();
        assert_eq!(inputs.len(), 3);
        assert!(inputs.iter().all(|b| b.dtype == Some(DType::F32)));
    }

    #[test]
    fn test_missing_count_attr_yields_no_slots() {
        let node = Node::new("s", "AddN").with_attr("T", AttrValue::DType(DType::F32));
        assert!(input_bindings(&node).unwrap().is_empty());
    }

    #[test]
    fn test_fixed_slot_has_no_governing_attr() {
        let node = Node::new("c", "ConcatV2")
            .with_attr("N", AttrValue::Int(2))
            .with_attr("T", AttrValue::DType(DType::F32))
            .with_input(InputRef::data("a", 0))
            .with_input(InputRef::data("b", 0))
            .with_input(InputRef::data("axis", 0));
        let inputs = input_bindings(&node).unwrap();
        assert_eq!(inputs.len(), 3);
        assert_eq!(inputs[2].type_attr, None);
        assert_eq!(inputs[2].dtype, Some(DType::I32));
    }

    #[test]
    fn test_unset_type_attr_resolves_to_none() {
        let node = Node::new("r", "Relu");
        let inputs = input_bindings(&node).unwrap();
        assert_eq!(inputs[0].type_attr, Some("T"));
        assert_eq!(inputs[0].dtype, None);
    }

    #[test]
    fn test_unknown_op_resolves_to_none() {
        let node = Node::new("x", "FusedBananaGrad");
        assert!(input_bindings(&node).is_none());
        assert!(output_bindings(&node).is_none());
    }

    #[test]
    fn test_allowed_dtypes_respects_device() {
        let node = Node::new("e", "Exp").with_attr("T", AttrValue::DType(DType::F32));
        let cpu = allowed_dtypes(&node, Device::Cpu);
        assert!(!cpu["T"].contains(&DType::Bf16));
        let gpu = allowed_dtypes(&node, Device::Gpu);
        assert!(gpu["T"].contains(&DType::Bf16));
    }
}
