//! Dense host tensors and the shape/dtype contracts they are checked against.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};

/// Element precision of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Float64,
    Int16,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::Float32 => 4,
            DType::Float64 => 8,
            DType::Int16 => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int16 => "int16",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed element storage.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I16(Vec<i16>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I16(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::Float32,
            TensorData::F64(_) => DType::Float64,
            TensorData::I16(_) => DType::Int16,
        }
    }
}

/// N-dimensional tensor held in host memory.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl Tensor {
    /// Creates a tensor, requiring the data length to match the shape exactly.
    pub fn new(shape: &[usize], data: TensorData) -> Result<Self> {
        let total = element_count(shape).ok_or_else(|| overflow(shape))?;
        if data.len() != total {
            return Err(ExportError::ShapeMismatch {
                name: "tensor".into(),
                expected: format!("{total} elements for shape {}", format_dims(shape)),
                got: format!("{} elements", data.len()),
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// Creates a 1-D float32 tensor. Cannot fail: the shape is the data length.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data: TensorData::F32(data),
        }
    }

    pub fn from_f32(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        Self::new(shape, TensorData::F32(data))
    }

    pub fn from_f64(shape: &[usize], data: Vec<f64>) -> Result<Self> {
        Self::new(shape, TensorData::F64(data))
    }

    pub fn from_i16(shape: &[usize], data: Vec<i16>) -> Result<Self> {
        Self::new(shape, TensorData::I16(data))
    }

    /// Creates a zero-filled tensor.
    ///
    /// # Panics
    ///
    /// Panics if the element count overflows `usize`.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let total: usize = shape.iter().product();
        let data = match dtype {
            DType::Float32 => TensorData::F32(vec![0.0; total]),
            DType::Float64 => TensorData::F64(vec![0.0; total]),
            DType::Int16 => TensorData::I16(vec![0; total]),
        };
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Borrows the elements when the tensor is float32.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Copies the elements into a float32 vector, casting as needed.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            TensorData::F32(v) => v.clone(),
            TensorData::F64(v) => v.iter().map(|&x| x as f32).collect(),
            TensorData::I16(v) => v.iter().map(|&x| x as f32).collect(),
        }
    }

    /// Encodes the elements as little-endian bytes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.dtype().size());
        match &self.data {
            TensorData::F32(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            TensorData::F64(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
            TensorData::I16(v) => v.iter().for_each(|x| out.extend_from_slice(&x.to_le_bytes())),
        }
        out
    }

    /// Decodes little-endian bytes produced by [`Tensor::to_le_bytes`].
    pub fn from_le_bytes(shape: &[usize], dtype: DType, bytes: &[u8]) -> Result<Self> {
        let want = byte_len(shape, dtype).ok_or_else(|| overflow(shape))?;
        if bytes.len() != want {
            return Err(ExportError::ShapeMismatch {
                name: "tensor".into(),
                expected: format!("{want} bytes for {} {dtype}", format_dims(shape)),
                got: format!("{} bytes", bytes.len()),
            });
        }
        let data = match dtype {
            DType::Float32 => TensorData::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::Float64 => TensorData::F64(
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect(),
            ),
            DType::Int16 => TensorData::I16(
                bytes
                    .chunks_exact(2)
                    .map(|c| i16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
        };
        Self::new(shape, data)
    }
}

/// Named shape and dtype contract for a tensor.
///
/// `shape` is `None` when even the rank is unknown; a dimension of `-1`
/// accepts any extent. A spec with a known rank and no `-1` dimensions is
/// fully defined, and only fully-defined specs may be persisted as a
/// serving signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<Vec<i64>>,
    pub dtype: DType,
}

impl TensorSpec {
    /// A spec with every dimension known.
    pub fn fixed(name: impl Into<String>, shape: &[usize], dtype: DType) -> Self {
        Self {
            name: name.into(),
            shape: Some(shape.iter().map(|&d| d as i64).collect()),
            dtype,
        }
    }

    /// A spec with unknown rank.
    pub fn dynamic(name: impl Into<String>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            shape: None,
            dtype,
        }
    }

    /// The exact spec of an existing tensor.
    pub fn of(name: impl Into<String>, tensor: &Tensor) -> Self {
        Self::fixed(name, tensor.shape(), tensor.dtype())
    }

    pub fn is_fully_defined(&self) -> bool {
        self.shape
            .as_ref()
            .is_some_and(|dims| dims.iter().all(|&d| d >= 0))
    }

    /// Returns the concrete dimensions of a fully-defined spec.
    pub fn fixed_shape(&self) -> Option<Vec<usize>> {
        if !self.is_fully_defined() {
            return None;
        }
        self.shape
            .as_ref()
            .map(|dims| dims.iter().map(|&d| d as usize).collect())
    }

    /// Verifies that `tensor` satisfies this contract.
    ///
    /// Never reshapes, truncates or casts: any dtype or dimension that
    /// differs from a known one fails with [`ExportError::ShapeMismatch`].
    pub fn check(&self, tensor: &Tensor) -> Result<()> {
        let mismatch = || ExportError::ShapeMismatch {
            name: self.name.clone(),
            expected: self.to_string(),
            got: format!("{} {}", format_dims(tensor.shape()), tensor.dtype()),
        };

        if tensor.dtype() != self.dtype {
            return Err(mismatch());
        }
        if let Some(dims) = &self.shape {
            if dims.len() != tensor.shape().len() {
                return Err(mismatch());
            }
            let ok = dims
                .iter()
                .zip(tensor.shape())
                .all(|(&want, &got)| want < 0 || want as usize == got);
            if !ok {
                return Err(mismatch());
            }
        }
        Ok(())
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shape {
            None => write!(f, "[*] {}", self.dtype),
            Some(dims) => {
                let parts: Vec<String> = dims
                    .iter()
                    .map(|&d| if d < 0 { "?".to_string() } else { d.to_string() })
                    .collect();
                write!(f, "[{}] {}", parts.join(", "), self.dtype)
            }
        }
    }
}

/// Number of elements in `shape`, or `None` if it overflows `usize`.
pub fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Size in bytes of a `shape` tensor of `dtype`, or `None` on overflow.
pub fn byte_len(shape: &[usize], dtype: DType) -> Option<usize> {
    element_count(shape)?.checked_mul(dtype.size())
}

fn overflow(shape: &[usize]) -> ExportError {
    ExportError::ShapeMismatch {
        name: "tensor".into(),
        expected: "a shape whose size fits in memory".into(),
        got: format_dims(shape),
    }
}

pub(crate) fn format_dims(shape: &[usize]) -> String {
    let parts: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", parts.join(", "))
}
