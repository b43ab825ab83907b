// Operation schema registry
//
// Signatures describe each operation's ordered input/output slots: a slot is
// either fixed-type or governed by a named type attribute, and may be
// replicated N times via a named count attribute. Per-attribute legal dtype
// sets come from the signature and are narrowed by device-specific kernel
// registrations: a compiled kernel may support fewer types than the generic
// signature admits, and the pass must never declare a type the device cannot
// execute.

pub mod resolve;

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use crate::dtype::DType;

/// Target device for kernel capability lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

/// One input or output slot of an operation signature.
#[derive(Debug, Clone, Copy)]
pub struct SlotDef {
    /// Fixed element type; `None` when `type_attr` governs the slot.
    pub fixed: Option<DType>,
    /// Name of the attribute holding the slot's element type.
    pub type_attr: Option<&'static str>,
    /// Attribute replicating this slot in place, preserving order.
    pub count_attr: Option<&'static str>,
}

impl SlotDef {
    pub const fn fixed(dtype: DType) -> Self {
        Self {
            fixed: Some(dtype),
            type_attr: None,
            count_attr: None,
        }
    }

    pub const fn typed(attr: &'static str) -> Self {
        Self {
            fixed: None,
            type_attr: Some(attr),
            count_attr: None,
        }
    }

    pub const fn counted(attr: &'static str, count_attr: &'static str) -> Self {
        Self {
            fixed: None,
            type_attr: Some(attr),
            count_attr: Some(count_attr),
        }
    }
}

/// Declared legal dtypes for one type attribute.
#[derive(Debug, Clone, Copy)]
pub struct AttrConstraint {
    pub attr: &'static str,
    pub allowed: &'static [DType],
}

/// Signature of one operation type.
#[derive(Debug, Clone, Copy)]
pub struct OpSignature {
    pub op_type: &'static str,
    pub inputs: &'static [SlotDef],
    pub outputs: &'static [SlotDef],
    /// Attributes with no entry here are unconstrained.
    pub constraints: &'static [AttrConstraint],
}

/// Device kernel registration: narrows attribute dtype sets for one device.
#[derive(Debug, Clone, Copy)]
pub struct KernelDef {
    pub op_type: &'static str,
    pub device: Device,
    pub constraints: &'static [AttrConstraint],
}

const FLOAT_TYPES: &[DType] = &[DType::Bf16, DType::F16, DType::F32, DType::F64];

const REAL_NUMBER_TYPES: &[DType] = &[
    DType::Bf16,
    DType::F16,
    DType::F32,
    DType::F64,
    DType::I8,
    DType::I16,
    DType::I32,
    DType::I64,
    DType::U8,
    DType::U16,
];

const MATMUL_TYPES: &[DType] = &[
    DType::Bf16,
    DType::F16,
    DType::F32,
    DType::F64,
    DType::I32,
    DType::I64,
];

const QUANTIZED_TYPES: &[DType] = &[DType::QI8, DType::QU8, DType::QI32];

/// Float types a quantization boundary can ingest or emit.
const QUANT_FLOAT_TYPES: &[DType] = &[DType::Bf16, DType::F32];

const INDEX_TYPES: &[DType] = &[DType::I32, DType::I64];

pub const SIGNATURES: &[OpSignature] = &[
    OpSignature {
        op_type: "Add",
        inputs: &[SlotDef::typed("T"), SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: REAL_NUMBER_TYPES,
        }],
    },
    OpSignature {
        op_type: "AddN",
        inputs: &[SlotDef::counted("T", "N")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: REAL_NUMBER_TYPES,
        }],
    },
    OpSignature {
        op_type: "BiasAdd",
        inputs: &[SlotDef::typed("T"), SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: REAL_NUMBER_TYPES,
        }],
    },
    OpSignature {
        op_type: "Cast",
        inputs: &[SlotDef::typed("SrcT")],
        outputs: &[SlotDef::typed("DstT")],
        constraints: &[],
    },
    OpSignature {
        op_type: "ConcatV2",
        inputs: &[SlotDef::counted("T", "N"), SlotDef::fixed(DType::I32)],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: REAL_NUMBER_TYPES,
        }],
    },
    OpSignature {
        op_type: "Const",
        inputs: &[],
        outputs: &[SlotDef::typed("dtype")],
        constraints: &[],
    },
    OpSignature {
        op_type: "Conv2D",
        inputs: &[SlotDef::typed("T"), SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: FLOAT_TYPES,
        }],
    },
    OpSignature {
        op_type: "Dequantize",
        inputs: &[
            SlotDef::typed("T"),
            SlotDef::fixed(DType::F32),
            SlotDef::fixed(DType::F32),
        ],
        outputs: &[SlotDef::typed("dtype")],
        constraints: &[
            AttrConstraint {
                attr: "T",
                allowed: QUANTIZED_TYPES,
            },
            AttrConstraint {
                attr: "dtype",
                allowed: QUANT_FLOAT_TYPES,
            },
        ],
    },
    OpSignature {
        op_type: "Exp",
        inputs: &[SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: FLOAT_TYPES,
        }],
    },
    OpSignature {
        op_type: "Identity",
        inputs: &[SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[],
    },
    OpSignature {
        op_type: "MatMul",
        inputs: &[SlotDef::typed("T"), SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: MATMUL_TYPES,
        }],
    },
    OpSignature {
        op_type: "MaxPool",
        inputs: &[SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: FLOAT_TYPES,
        }],
    },
    OpSignature {
        op_type: "Mul",
        inputs: &[SlotDef::typed("T"), SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: REAL_NUMBER_TYPES,
        }],
    },
    OpSignature {
        op_type: "NoOp",
        inputs: &[],
        outputs: &[],
        constraints: &[],
    },
    OpSignature {
        op_type: "Placeholder",
        inputs: &[],
        outputs: &[SlotDef::typed("dtype")],
        constraints: &[],
    },
    OpSignature {
        op_type: "QuantizeV2",
        inputs: &[
            SlotDef::typed("dtype"),
            SlotDef::fixed(DType::F32),
            SlotDef::fixed(DType::F32),
        ],
        outputs: &[
            SlotDef::typed("T"),
            SlotDef::fixed(DType::F32),
            SlotDef::fixed(DType::F32),
        ],
        constraints: &[
            AttrConstraint {
                attr: "dtype",
                allowed: QUANT_FLOAT_TYPES,
            },
            AttrConstraint {
                attr: "T",
                allowed: QUANTIZED_TYPES,
            },
        ],
    },
    OpSignature {
        op_type: "Relu",
        inputs: &[SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: REAL_NUMBER_TYPES,
        }],
    },
    OpSignature {
        op_type: "Shape",
        inputs: &[SlotDef::typed("T")],
        outputs: &[SlotDef::typed("out_type")],
        constraints: &[AttrConstraint {
            attr: "out_type",
            allowed: INDEX_TYPES,
        }],
    },
    OpSignature {
        op_type: "Softmax",
        inputs: &[SlotDef::typed("T")],
        outputs: &[SlotDef::typed("T")],
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: FLOAT_TYPES,
        }],
    },
];

pub const KERNELS: &[KernelDef] = &[
    // bf16 Exp has no CPU kernel; the generic signature admits it
    KernelDef {
        op_type: "Exp",
        device: Device::Cpu,
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: &[DType::F32, DType::F64],
        }],
    },
    KernelDef {
        op_type: "Conv2D",
        device: Device::Gpu,
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: &[DType::F16, DType::F32, DType::F64],
        }],
    },
    KernelDef {
        op_type: "MatMul",
        device: Device::Cpu,
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: &[DType::Bf16, DType::F32, DType::F64, DType::I32, DType::I64],
        }],
    },
    KernelDef {
        op_type: "Softmax",
        device: Device::Cpu,
        constraints: &[AttrConstraint {
            attr: "T",
            allowed: &[DType::Bf16, DType::F32, DType::F64],
        }],
    },
];

static SIGNATURE_INDEX: Lazy<FxHashMap<&'static str, &'static OpSignature>> =
    Lazy::new(|| SIGNATURES.iter().map(|sig| (sig.op_type, sig)).collect());

/// Look up the signature for an operation type.
pub fn signature(op_type: &str) -> Option<&'static OpSignature> {
    SIGNATURE_INDEX.get(op_type).copied()
}

/// Legal dtype sets per type attribute for (op, device).
///
/// Starts from the signature's declared sets; a non-empty kernel constraint
/// for the same attribute on the requested device overrides the generic set.
pub fn legal_types(op_type: &str, device: Device) -> FxHashMap<&'static str, &'static [DType]> {
    let mut allowed: FxHashMap<&'static str, &'static [DType]> = FxHashMap::default();
    let Some(sig) = signature(op_type) else {
        return allowed;
    };
    for constraint in sig.constraints {
        allowed.insert(constraint.attr, constraint.allowed);
    }
    for kernel in KERNELS {
        if kernel.op_type != op_type || kernel.device != device {
            continue;
        }
        for constraint in kernel.constraints {
            if !constraint.allowed.is_empty() && allowed.contains_key(constraint.attr) {
                allowed.insert(constraint.attr, constraint.allowed);
            }
        }
    }
    allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_lookup() {
        let sig = signature("MatMul").unwrap();
        assert_eq!(sig.inputs.len(), 2);
        assert_eq!(sig.outputs.len(), 1);
        assert!(signature("FusedBananaGrad").is_none());
    }

    #[test]
    fn test_kernel_overrides_generic_set() {
        let cpu = legal_types("Exp", Device::Cpu);
        assert_eq!(cpu["T"], &[DType::F32, DType::F64]);

        // no GPU registration for Exp: the generic set stands
        let gpu = legal_types("Exp", Device::Gpu);
        assert!(gpu["T"].contains(&DType::Bf16));
    }

    #[test]
    fn test_unconstrained_attr_absent() {
        let allowed = legal_types("Cast", Device::Cpu);
        assert!(allowed.is_empty());
    }

    #[test]
    fn test_unknown_op_has_no_legal_sets() {
        assert!(legal_types("FusedBananaGrad", Device::Cpu).is_empty());
    }
}
