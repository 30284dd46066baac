//! Tensor schemas and the raw typed buffers that travel over the log protocol.
//!
//! Buffers are kept as the exact bytes the producer wrote (host endian, no
//! padding) and decoded on demand.

use crate::errors::MlgoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Float64,
}

impl DType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "int8_t" => Some(Self::Int8),
            "uint8_t" => Some(Self::UInt8),
            "int16_t" => Some(Self::Int16),
            "uint16_t" => Some(Self::UInt16),
            "int32_t" => Some(Self::Int32),
            "uint32_t" => Some(Self::UInt32),
            "int64_t" => Some(Self::Int64),
            "uint64_t" => Some(Self::UInt64),
            "float" => Some(Self::Float32),
            "double" => Some(Self::Float64),
            _ => None,
        }
    }

    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Int8 => "int8_t",
            Self::UInt8 => "uint8_t",
            Self::Int16 => "int16_t",
            Self::UInt16 => "uint16_t",
            Self::Int32 => "int32_t",
            Self::UInt32 => "uint32_t",
            Self::Int64 => "int64_t",
            Self::UInt64 => "uint64_t",
            Self::Float32 => "float",
            Self::Float64 => "double",
        }
    }

    pub fn element_size(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorSpec {
    pub name: String,
    pub port: u32,
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, dtype: DType) -> Self {
        Self {
            name: name.into(),
            port: 0,
            shape,
            dtype,
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.dtype.element_size()
    }

    /// Validates a descriptor as it appears in a log header.
    pub fn from_descriptor(descriptor: &TensorDescriptor) -> Result<Self, MlgoError> {
        let dtype = DType::parse(&descriptor.dtype).ok_or_else(|| {
            MlgoError::Framing(format!(
                "tensor `{}` has unsupported type `{}`",
                descriptor.name, descriptor.dtype
            ))
        })?;
        if descriptor.shape.is_empty() {
            return Err(MlgoError::Framing(format!(
                "tensor `{}` declares an empty shape",
                descriptor.name
            )));
        }
        let shape = descriptor
            .shape
            .iter()
            .map(|dim| {
                usize::try_from(*dim).ok().filter(|dim| *dim > 0).ok_or_else(|| {
                    MlgoError::Framing(format!(
                        "tensor `{}` has non-positive dimension {dim}",
                        descriptor.name
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        shape
            .iter()
            .try_fold(dtype.element_size(), |size, dim| size.checked_mul(*dim))
            .ok_or_else(|| {
                MlgoError::Framing(format!(
                    "tensor `{}` shape {:?} overflows its byte size",
                    descriptor.name, descriptor.shape
                ))
            })?;
        Ok(Self {
            name: descriptor.name.clone(),
            port: descriptor.port,
            shape,
            dtype,
        })
    }

    pub fn to_descriptor(&self) -> TensorDescriptor {
        TensorDescriptor {
            name: self.name.clone(),
            port: self.port,
            shape: self.shape.iter().map(|dim| *dim as i64).collect(),
            dtype: self.dtype.as_str().to_string(),
        }
    }
}

/// JSON form of a tensor spec inside the log header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TensorDescriptor {
    pub name: String,
    pub port: u32,
    pub shape: Vec<i64>,
    #[serde(rename = "type")]
    pub dtype: String,
}

/// Fixed-width element types that can be packed into a [`TensorValue`].
pub trait Element: Copy + sealed::Sealed {
    const DTYPE: DType;

    fn append_ne_bytes(self, out: &mut Vec<u8>);
    fn from_ne_chunk(chunk: &[u8]) -> Self;
    fn widen(self) -> f64;
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Element for $ty {
                const DTYPE: DType = $dtype;

                fn append_ne_bytes(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_ne_bytes());
                }

                fn from_ne_chunk(chunk: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(chunk);
                    <$ty>::from_ne_bytes(raw)
                }

                fn widen(self) -> f64 {
                    self as f64
                }
            }
        )*
    };
}

impl_element! {
    i8 => DType::Int8,
    u8 => DType::UInt8,
    i16 => DType::Int16,
    u16 => DType::UInt16,
    i32 => DType::Int32,
    u32 => DType::UInt32,
    i64 => DType::Int64,
    u64 => DType::UInt64,
    f32 => DType::Float32,
    f64 => DType::Float64,
}

/// A spec plus exactly `spec.byte_size()` bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    spec: Arc<TensorSpec>,
    bytes: Vec<u8>,
}

impl TensorValue {
    pub fn from_bytes(spec: Arc<TensorSpec>, bytes: Vec<u8>) -> Result<Self, MlgoError> {
        let expected = spec.byte_size();
        if bytes.len() < expected {
            return Err(MlgoError::TruncatedBuffer {
                tensor: spec.name.clone(),
                expected,
                actual: bytes.len(),
            });
        }
        if bytes.len() > expected {
            return Err(MlgoError::Framing(format!(
                "buffer for tensor `{}` has {} bytes, expected {expected}",
                spec.name,
                bytes.len()
            )));
        }
        Ok(Self { spec, bytes })
    }

    /// Packs `values` into a tensor whose dtype is inferred from `T`.
    pub fn from_slice<T: Element>(
        name: impl Into<String>,
        shape: Vec<usize>,
        values: &[T],
    ) -> Result<Self, MlgoError> {
        let spec = Arc::new(TensorSpec::new(name, shape, T::DTYPE));
        let mut bytes = Vec::with_capacity(values.len() * T::DTYPE.element_size());
        for value in values {
            value.append_ne_bytes(&mut bytes);
        }
        Self::from_bytes(spec, bytes)
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn element_count(&self) -> usize {
        self.spec.element_count()
    }

    /// Decodes the buffer; `T` must match the declared dtype exactly.
    pub fn values<T: Element>(&self) -> Result<Vec<T>, MlgoError> {
        if T::DTYPE != self.spec.dtype {
            return Err(MlgoError::Framing(format!(
                "tensor `{}` holds {} elements, requested {}",
                self.spec.name, self.spec.dtype, T::DTYPE
            )));
        }
        Ok(self.decode::<T>())
    }

    /// Decodes any dtype into `f64`.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self.spec.dtype {
            DType::Int8 => widen_all(self.decode::<i8>()),
            DType::UInt8 => widen_all(self.decode::<u8>()),
            DType::Int16 => widen_all(self.decode::<i16>()),
            DType::UInt16 => widen_all(self.decode::<u16>()),
            DType::Int32 => widen_all(self.decode::<i32>()),
            DType::UInt32 => widen_all(self.decode::<u32>()),
            DType::Int64 => widen_all(self.decode::<i64>()),
            DType::UInt64 => widen_all(self.decode::<u64>()),
            DType::Float32 => widen_all(self.decode::<f32>()),
            DType::Float64 => self.decode::<f64>(),
        }
    }

    /// Integer dtypes widened to `i64`; `None` for float dtypes.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        let out = match self.spec.dtype {
            DType::Int8 => self.decode::<i8>().into_iter().map(i64::from).collect(),
            DType::UInt8 => self.decode::<u8>().into_iter().map(i64::from).collect(),
            DType::Int16 => self.decode::<i16>().into_iter().map(i64::from).collect(),
            DType::UInt16 => self.decode::<u16>().into_iter().map(i64::from).collect(),
            DType::Int32 => self.decode::<i32>().into_iter().map(i64::from).collect(),
            DType::UInt32 => self.decode::<u32>().into_iter().map(i64::from).collect(),
            DType::Int64 => self.decode::<i64>(),
            DType::UInt64 => self.decode::<u64>().into_iter().map(|v| v as i64).collect(),
            DType::Float32 | DType::Float64 => return None,
        };
        Some(out)
    }

    fn decode<T: Element>(&self) -> Vec<T> {
        self.bytes
            .chunks_exact(T::DTYPE.element_size())
            .map(T::from_ne_chunk)
            .collect()
    }
}

fn widen_all<T: Element>(values: Vec<T>) -> Vec<f64> {
    values.into_iter().map(Element::widen).collect()
}
