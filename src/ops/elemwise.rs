//! Reference float32 elementwise kernel
//!
//! Small enough to exercise the interpreter end to end; it is not meant to
//! be fast.

use std::any::Any;

use crate::{
    tensor::{DeviceTensor, DType, TensorData, TensorMeta},
    error::{AnvilError, AnvilResult},
    ops::core::{Kernel, OpDef},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ElemwiseMode {
    AddScalar(f32),
    MulScalar(f32),
    DivScalar(f32),
    Relu,
    Neg,
    Add,
    Sub,
    Mul,
    Div,
}

impl ElemwiseMode {
    pub fn arity(&self) -> usize {
        match self {
            ElemwiseMode::AddScalar(_)
            | ElemwiseMode::MulScalar(_)
            | ElemwiseMode::DivScalar(_)
            | ElemwiseMode::Relu
            | ElemwiseMode::Neg => 1,
            ElemwiseMode::Add | ElemwiseMode::Sub | ElemwiseMode::Mul | ElemwiseMode::Div => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElemwiseMode::AddScalar(_) => "add_scalar",
            ElemwiseMode::MulScalar(_) => "mul_scalar",
            ElemwiseMode::DivScalar(_) => "div_scalar",
            ElemwiseMode::Relu => "relu",
            ElemwiseMode::Neg => "neg",
            ElemwiseMode::Add => "add",
            ElemwiseMode::Sub => "sub",
            ElemwiseMode::Mul => "mul",
            ElemwiseMode::Div => "div",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Elemwise {
    pub mode: ElemwiseMode,
}

impl Elemwise {
    pub fn new(mode: ElemwiseMode) -> Self {
        Self { mode }
    }
}

impl OpDef for Elemwise {
    fn name(&self) -> &str {
        self.mode.name()
    }

    fn infer_output_meta(&self, inputs: &[TensorMeta]) -> Option<Vec<TensorMeta>> {
        if inputs.len() != self.mode.arity() {
            return None;
        }
        let first = &inputs[0];
        if first.dtype != DType::F32 {
            return None;
        }
        if inputs.iter().skip(1).any(|m| m != first) {
            return None;
        }
        Some(vec![first.clone()])
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Kernel understanding `Elemwise` descriptors
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceKernel;

impl Kernel for ReferenceKernel {
    fn apply(&self, op: &dyn OpDef, inputs: &[DeviceTensor]) -> AnvilResult<Vec<DeviceTensor>> {
        let elemwise = op
            .as_any()
            .downcast_ref::<Elemwise>()
            .ok_or_else(|| AnvilError::UnsupportedOperation(op.name().to_string()))?;
        let mode = elemwise.mode;
        if inputs.len() != mode.arity() {
            return Err(AnvilError::operation_error(
                mode.name(),
                &format!("expected {} inputs, got {}", mode.arity(), inputs.len()),
            ));
        }

        let first = &inputs[0];
        let lhs = as_f32(mode.name(), first)?;
        let values = match mode {
            ElemwiseMode::AddScalar(s) => lhs.iter().map(|x| x + s).collect(),
            ElemwiseMode::MulScalar(s) => lhs.iter().map(|x| x * s).collect(),
            ElemwiseMode::DivScalar(s) => {
                if s == 0.0 {
                    return Err(AnvilError::operation_error(mode.name(), "division by zero"));
                }
                lhs.iter().map(|x| x / s).collect()
            }
            ElemwiseMode::Relu => lhs.iter().map(|x| x.max(0.0)).collect(),
            ElemwiseMode::Neg => lhs.iter().map(|x| -x).collect(),
            ElemwiseMode::Add | ElemwiseMode::Sub | ElemwiseMode::Mul | ElemwiseMode::Div => {
                let second = &inputs[1];
                if second.shape() != first.shape() {
                    return Err(AnvilError::shape_error(
                        &first.shape().to_string(),
                        &second.shape().to_string(),
                        Some("elementwise binary ops do not broadcast"),
                    ));
                }
                let rhs = as_f32(mode.name(), second)?;
                binary(mode, lhs, rhs)?
            }
        };

        Ok(vec![DeviceTensor::new(
            first.device(),
            first.shape().clone(),
            TensorData::F32(values),
        )?])
    }
}

fn binary(mode: ElemwiseMode, lhs: &[f32], rhs: &[f32]) -> AnvilResult<Vec<f32>> {
    let pairs = lhs.iter().zip(rhs.iter());
    let out = match mode {
        ElemwiseMode::Add => pairs.map(|(a, b)| a + b).collect(),
        ElemwiseMode::Sub => pairs.map(|(a, b)| a - b).collect(),
        ElemwiseMode::Mul => pairs.map(|(a, b)| a * b).collect(),
        ElemwiseMode::Div => {
            if rhs.iter().any(|b| *b == 0.0) {
                return Err(AnvilError::operation_error(mode.name(), "division by zero"));
            }
            pairs.map(|(a, b)| a / b).collect()
        }
        _ => unreachable!("unary mode passed to binary"),
    };
    Ok(out)
}

fn as_f32<'a>(op: &str, tensor: &'a DeviceTensor) -> AnvilResult<&'a [f32]> {
    match tensor.data() {
        TensorData::F32(v) => Ok(v),
        other => Err(AnvilError::operation_error(
            op,
            &format!("expected float32 input, got {}", other.dtype()),
        )),
    }
}
