//! Host and device tensor values
//!
//! Both value kinds share their element buffer through an `Arc`, so handing a
//! value to the worker or back to a caller never copies the data.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::{AnvilError, AnvilResult};
use super::core::{DType, Shape, TensorMeta};
use super::devices::Device;

/// Typed element buffer
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F64(_) => DType::F64,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::U8(_) => DType::U8,
            TensorData::Bool(_) => DType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_in_bytes(&self) -> usize {
        self.len() * self.dtype().size()
    }

    /// Feed the bit pattern of every element into `state`.
    ///
    /// Floats hash by their bits, so `-0.0` and `0.0` hash differently.
    pub fn hash_bits<H: Hasher>(&self, state: &mut H) {
        self.dtype().hash(state);
        match self {
            TensorData::F32(v) => v.iter().for_each(|x| x.to_bits().hash(state)),
            TensorData::F64(v) => v.iter().for_each(|x| x.to_bits().hash(state)),
            TensorData::I32(v) => v.hash(state),
            TensorData::I64(v) => v.hash(state),
            TensorData::U8(v) => v.hash(state),
            TensorData::Bool(v) => v.hash(state),
        }
    }
}

/// A host-resident tensor value
#[derive(Debug, Clone, PartialEq)]
pub struct HostTensor {
    shape: Shape,
    data: Arc<TensorData>,
}

impl HostTensor {
    pub fn new(shape: impl Into<Shape>, data: TensorData) -> AnvilResult<Self> {
        let shape = shape.into();
        check_len(&shape, &data)?;
        Ok(Self {
            shape,
            data: Arc::new(data),
        })
    }

    pub fn from_f32(shape: impl Into<Shape>, values: Vec<f32>) -> AnvilResult<Self> {
        Self::new(shape, TensorData::F32(values))
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn numel(&self) -> usize {
        self.shape.total_elements()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &*self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn to_vec_f32(&self) -> AnvilResult<Vec<f32>> {
        self.as_f32()
            .map(|v| v.to_vec())
            .ok_or_else(|| AnvilError::InvalidInput(format!("Expected float32 tensor, got {}", self.dtype())))
    }
}

/// A device-resident tensor value
#[derive(Debug, Clone)]
pub struct DeviceTensor {
    device: Device,
    shape: Shape,
    data: Arc<TensorData>,
}

impl DeviceTensor {
    pub fn new(device: Device, shape: impl Into<Shape>, data: TensorData) -> AnvilResult<Self> {
        let shape = shape.into();
        check_len(&shape, &data)?;
        Ok(Self {
            device,
            shape,
            data: Arc::new(data),
        })
    }

    /// Upload a host value; the element buffer is shared, not copied
    pub fn from_host(host: &HostTensor, device: Device) -> Self {
        Self {
            device,
            shape: host.shape.clone(),
            data: host.data.clone(),
        }
    }

    /// Download to the host; the element buffer is shared, not copied
    pub fn to_host(&self) -> HostTensor {
        HostTensor {
            shape: self.shape.clone(),
            data: self.data.clone(),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &TensorData {
        &self.data
    }

    pub fn meta(&self) -> TensorMeta {
        TensorMeta {
            shape: self.shape.clone(),
            dtype: self.dtype(),
            device: self.device,
        }
    }

    pub fn nbytes(&self) -> usize {
        self.data.size_in_bytes()
    }

    pub fn shares_storage(&self, other: &DeviceTensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

fn check_len(shape: &Shape, data: &TensorData) -> AnvilResult<()> {
    if data.len() != shape.total_elements() {
        return Err(AnvilError::shape_error(
            &format!("{} elements for shape {}", shape.total_elements(), shape),
            &format!("{} elements", data.len()),
            None,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_tensor_validation() {
        assert!(HostTensor::from_f32([2, 2], vec![1.0, 2.0, 3.0, 4.0]).is_ok());
        let err = HostTensor::from_f32([2, 2], vec![1.0]).unwrap_err();
        assert!(err.to_string().contains("4 elements for shape [2, 2]"));
    }

    #[test]
    fn test_device_round_trip_shares_buffer() {
        let host = HostTensor::from_f32([3], vec![1.0, 2.0, 3.0]).unwrap();
        let dev = DeviceTensor::from_host(&host, Device::Cuda(0));
        assert_eq!(dev.meta(), TensorMeta::new([3], DType::F32, Device::Cuda(0)));
        assert_eq!(dev.nbytes(), 12);

        let back = dev.to_host();
        assert_eq!(back, host);
        assert!(dev.shares_storage(&DeviceTensor::from_host(&back, Device::Cpu)));
    }

    #[test]
    fn test_dtype_accessors() {
        let host = HostTensor::new([2], TensorData::I64(vec![1, 2])).unwrap();
        assert_eq!(host.dtype(), DType::I64);
        assert!(host.as_f32().is_none());
        assert!(host.to_vec_f32().is_err());
    }
}
