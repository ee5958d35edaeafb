use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::PlinyError;

/// Element types a graph may declare.
///
/// Only `F32`, `F64`, `I32`, `I64` and `Bool` can cross the wire; `F16` and
/// `U8` are recognised so they can be declared, but their data is rejected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
    F16,
    U8,
}

impl DType {
    pub const SUPPORTED: [DType; 5] = [DType::F32, DType::F64, DType::I32, DType::I64, DType::Bool];

    pub fn byte_size(self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::F16 => 2,
            DType::Bool | DType::U8 => 1,
        }
    }

    pub fn is_supported(self) -> bool {
        Self::SUPPORTED.contains(&self)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::Bool => "bool",
            DType::F16 => "f16",
            DType::U8 => "u8",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn scalar() -> Self {
        Self(SmallVec::new())
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    /// Number of elements; 1 for a scalar, 0 when any dimension is 0.
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }

    /// Like [`Shape::numel`], but `None` when the count does not fit a `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        if self.0.contains(&0) {
            return Some(0);
        }
        self.0.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(SmallVec::from_vec(dims))
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self::from_slice(dims)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims())
    }
}

/// Rust scalar types that map one-to-one onto a wire-supported [`DType`].
pub trait Element: Copy + sealed::Sealed {
    const DTYPE: DType;

    fn write_le(self, out: &mut Vec<u8>);
    fn read_le(bytes: &[u8]) -> Self;
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
    impl Sealed for i32 {}
    impl Sealed for i64 {}
    impl Sealed for bool {}
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(b: &[u8]) -> Self {
        f32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(b: &[u8]) -> Self {
        f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(b: &[u8]) -> Self {
        i32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(b: &[u8]) -> Self {
        i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
    }
}

impl Element for bool {
    const DTYPE: DType = DType::Bool;
    fn write_le(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }
    fn read_le(b: &[u8]) -> Self {
        b[0] != 0
    }
}

/// A dense tensor stored as little-endian element bytes.
///
/// The constructors enforce `data.len() == shape.numel() * dtype.byte_size()`,
/// so every `Tensor` in circulation is internally consistent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TensorRepr")]
pub struct Tensor {
    dtype: DType,
    shape: Shape,
    data: Bytes,
}

#[derive(Deserialize)]
struct TensorRepr {
    dtype: DType,
    shape: Shape,
    data: Bytes,
}

impl TryFrom<TensorRepr> for Tensor {
    type Error = PlinyError;

    fn try_from(repr: TensorRepr) -> Result<Self, Self::Error> {
        Tensor::from_bytes(repr.dtype, repr.shape, repr.data)
    }
}

impl Tensor {
    pub fn from_bytes(dtype: DType, shape: Shape, data: Bytes) -> Result<Self, PlinyError> {
        let Some(expected) = shape
            .checked_numel()
            .and_then(|n| n.checked_mul(dtype.byte_size()))
        else {
            return Err(PlinyError::InvalidTensor {
                message: format!("{dtype} tensor of shape {shape} is too large to address"),
            });
        };
        if data.len() != expected {
            return Err(PlinyError::InvalidTensor {
                message: format!(
                    "{dtype} tensor of shape {shape} needs {expected} bytes, got {}",
                    data.len()
                ),
            });
        }
        if dtype == DType::Bool && data.iter().any(|b| *b > 1) {
            return Err(PlinyError::InvalidTensor {
                message: "bool tensor contains bytes other than 0 and 1".to_string(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn from_values<T: Element>(shape: Shape, values: &[T]) -> Result<Self, PlinyError> {
        let mut buf = Vec::with_capacity(values.len() * T::DTYPE.byte_size());
        for v in values {
            v.write_le(&mut buf);
        }
        Self::from_bytes(T::DTYPE, shape, Bytes::from(buf))
    }

    pub fn from_f32(shape: Shape, values: &[f32]) -> Result<Self, PlinyError> {
        Self::from_values(shape, values)
    }

    pub fn scalar<T: Element>(value: T) -> Self {
        let mut buf = Vec::with_capacity(T::DTYPE.byte_size());
        value.write_le(&mut buf);
        Self {
            dtype: T::DTYPE,
            shape: Shape::scalar(),
            data: Bytes::from(buf),
        }
    }

    pub fn zeros(dtype: DType, shape: Shape) -> Self {
        let len = shape.numel() * dtype.byte_size();
        Self {
            dtype,
            shape,
            data: Bytes::from(vec![0u8; len]),
        }
    }

    pub fn ones(dtype: DType, shape: Shape) -> Self {
        let one: &[u8] = match dtype {
            DType::F32 => &[0x00, 0x00, 0x80, 0x3f],
            DType::F64 => &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xf0, 0x3f],
            DType::I32 => &[1, 0, 0, 0],
            DType::I64 => &[1, 0, 0, 0, 0, 0, 0, 0],
            DType::F16 => &[0x00, 0x3c],
            DType::Bool | DType::U8 => &[1],
        };
        let data = one.repeat(shape.numel());
        Self {
            dtype,
            shape,
            data: Bytes::from(data),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, PlinyError> {
        if self.dtype != T::DTYPE {
            return Err(PlinyError::InvalidTensor {
                message: format!("cannot read {} tensor as {}", self.dtype, T::DTYPE),
            });
        }
        Ok(self
            .data
            .chunks_exact(T::DTYPE.byte_size())
            .map(T::read_le)
            .collect())
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>, PlinyError> {
        self.to_vec::<f32>()
    }
}
