//! Element types, attribute values and constant tensor literals.
//!
//! `DType` is the precision vocabulary of the pass: the rewrite only ever
//! moves data between `F32` and `Bf16`, but nodes carry the full inventory so
//! quantized and integer graphs pass through untouched.

use half::bf16;
use serde::{Deserialize, Serialize};

/// Element type of a tensor or of a type-carrying attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F16,
    Bf16,
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    Bool,
    /// Quantized signed 8-bit
    QI8,
    /// Quantized unsigned 8-bit
    QU8,
    /// Quantized signed 32-bit
    QI32,
}

impl DType {
    pub fn is_floating(self) -> bool {
        matches!(self, DType::F16 | DType::Bf16 | DType::F32 | DType::F64)
    }

    pub fn is_quantized(self) -> bool {
        matches!(self, DType::QI8 | DType::QU8 | DType::QI32)
    }
}

/// Typed attribute value carried by a graph node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    DType(DType),
    Bool(bool),
    Int(i64),
    Float(f32),
    Str(String),
    IntList(Vec<i64>),
    Tensor(TensorValue),
}

impl AttrValue {
    pub fn as_dtype(&self) -> Option<DType> {
        match self {
            AttrValue::DType(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            AttrValue::Tensor(t) => Some(t),
            _ => None,
        }
    }
}

/// Constant tensor literal stored on `Const` nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dims: Vec<i64>,
    pub data: TensorData,
}

/// Element storage for a constant literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(Vec<f32>),
    Bf16(Vec<bf16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl TensorValue {
    /// Scalar f32 literal (rank 0).
    pub fn f32_scalar(value: f32) -> Self {
        Self {
            dims: Vec::new(),
            data: TensorData::F32(vec![value]),
        }
    }

    pub fn f32(data: Vec<f32>, dims: Vec<i64>) -> Self {
        Self {
            dims,
            data: TensorData::F32(data),
        }
    }

    pub fn dtype(&self) -> DType {
        match self.data {
            TensorData::F32(_) => DType::F32,
            TensorData::Bf16(_) => DType::Bf16,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
        }
    }

    /// Lossy down-conversion of f32 storage to bf16, shape preserved.
    /// Non-f32 literals are returned unchanged.
    pub fn to_bf16(&self) -> TensorValue {
        match &self.data {
            TensorData::F32(values) => TensorValue {
                dims: self.dims.clone(),
                data: TensorData::Bf16(values.iter().copied().map(bf16::from_f32).collect()),
            },
            _ => self.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floating_predicate() {
        assert!(DType::F32.is_floating());
        assert!(DType::Bf16.is_floating());
        assert!(!DType::I32.is_floating());
        assert!(!DType::QI8.is_floating());
        assert!(DType::QI8.is_quantized());
    }

    #[test]
    fn test_scalar_down_conversion_is_exact_for_small_values() {
        // 1.0 is exactly representable in bf16
        let t = TensorValue::f32_scalar(1.0);
        let lowered = t.to_bf16();
        assert_eq!(lowered.dtype(), DType::Bf16);
        assert_eq!(lowered.data, TensorData::Bf16(vec![bf16::from_f32(1.0)]));
        assert!(lowered.dims.is_empty());
    }

    #[test]
    fn test_down_conversion_preserves_shape() {
        let t = TensorValue::f32(vec![0.5, 1.5, 2.5, 3.5], vec![2, 2]);
        let lowered = t.to_bf16();
        assert_eq!(lowered.dims, vec![2, 2]);
        match lowered.data {
            TensorData::Bf16(v) => assert_eq!(v.len(), 4),
            other => panic!("expected bf16 storage, got {:?}", other),
        }
    }

    #[test]
    fn test_non_f32_literal_unchanged() {
        let t = TensorValue {
            dims: vec![3],
            data: TensorData::I32(vec![1, 2, 3]),
        };
        assert_eq!(t.to_bf16(), t);
    }

    #[test]
    fn test_attr_accessors() {
        assert_eq!(AttrValue::DType(DType::F32).as_dtype(), Some(DType::F32));
        assert_eq!(AttrValue::Int(4).as_int(), Some(4));
        assert_eq!(AttrValue::Bool(true).as_bool(), Some(true));
        assert_eq!(AttrValue::Int(4).as_dtype(), None);
    }
}
