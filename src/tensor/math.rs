//! Eager tensor arithmetic.
//!
//! Every method allocates its result on the tensor's device and runs the
//! matching kernel through [`Device::run_kernel`](crate::device::Device::run_kernel),
//! so the device registry stays the single place kernels execute.

use super::core::Tensor;
use crate::device::KernelAttributes;
use crate::error::{RuntimeError, RuntimeResult};
use crate::ops::OpKind;

#[allow(clippy::should_implement_trait)]
impl Tensor {
    fn dispatch(&self, kind: OpKind, inputs: &[&Tensor], attrs: KernelAttributes) -> RuntimeResult<Tensor> {
        let metas: Vec<_> = inputs.iter().map(|t| t.meta()).collect();
        let meta = kind.infer(&metas, &attrs)?;
        let mut outputs = [Tensor::zeros(&meta.shape, meta.dtype, self.device())?];
        let inputs: Vec<Tensor> = inputs.iter().map(|t| t.shallow_clone()).collect();
        self.device().run_kernel(kind.name(), &inputs, &mut outputs, &attrs)?;
        let [out] = outputs;
        Ok(out)
    }

    fn binary_op(&self, name: &str, other: &Tensor) -> RuntimeResult<Tensor> {
        let kind = OpKind::lookup(name).ok_or_else(|| RuntimeError::unknown_kernel(name, self.device_id()))?;
        self.dispatch(kind, &[self, other], KernelAttributes::new())
    }

    fn unary_op(&self, name: &str, attrs: KernelAttributes) -> RuntimeResult<Tensor> {
        let kind = OpKind::lookup(name).ok_or_else(|| RuntimeError::unknown_kernel(name, self.device_id()))?;
        self.dispatch(kind, &[self], attrs)
    }

    pub fn add(&self, other: &Tensor) -> RuntimeResult<Tensor> {
        self.binary_op("add", other)
    }

    pub fn sub(&self, other: &Tensor) -> RuntimeResult<Tensor> {
        self.binary_op("sub", other)
    }

    pub fn mul(&self, other: &Tensor) -> RuntimeResult<Tensor> {
        self.binary_op("mul", other)
    }

    pub fn div(&self, other: &Tensor) -> RuntimeResult<Tensor> {
        self.binary_op("div", other)
    }

    pub fn maximum(&self, other: &Tensor) -> RuntimeResult<Tensor> {
        self.binary_op("maximum", other)
    }

    pub fn minimum(&self, other: &Tensor) -> RuntimeResult<Tensor> {
        self.binary_op("minimum", other)
    }

    pub fn add_scalar(&self, value: f64) -> RuntimeResult<Tensor> {
        self.unary_op("add_scalar", KernelAttributes::new().with_float("scalar", value))
    }

    pub fn mul_scalar(&self, value: f64) -> RuntimeResult<Tensor> {
        self.unary_op("mul_scalar", KernelAttributes::new().with_float("scalar", value))
    }

    pub fn neg(&self) -> RuntimeResult<Tensor> {
        self.unary_op("neg", KernelAttributes::new())
    }

    pub fn abs(&self) -> RuntimeResult<Tensor> {
        self.unary_op("abs", KernelAttributes::new())
    }

    pub fn relu(&self) -> RuntimeResult<Tensor> {
        self.unary_op("relu", KernelAttributes::new())
    }

    pub fn exp(&self) -> RuntimeResult<Tensor> {
        self.unary_op("exp", KernelAttributes::new())
    }

    pub fn sqrt(&self) -> RuntimeResult<Tensor> {
        self.unary_op("sqrt", KernelAttributes::new())
    }

    fn reduction(&self, name: &str, axis: Option<isize>, keepdim: bool) -> RuntimeResult<Tensor> {
        let mut attrs = KernelAttributes::new().with_int("keepdim", keepdim as i64);
        if let Some(axis) = axis {
            attrs = attrs.with_int("axis", axis as i64);
        }
        self.unary_op(name, attrs)
    }

    /// Sum over `axis` (negative counts from the end), or everything
    pub fn sum(&self, axis: Option<isize>, keepdim: bool) -> RuntimeResult<Tensor> {
        self.reduction("sum", axis, keepdim)
    }

    pub fn mean(&self, axis: Option<isize>, keepdim: bool) -> RuntimeResult<Tensor> {
        self.reduction("mean", axis, keepdim)
    }

    pub fn max(&self, axis: Option<isize>, keepdim: bool) -> RuntimeResult<Tensor> {
        self.reduction("max", axis, keepdim)
    }

    pub fn min(&self, axis: Option<isize>, keepdim: bool) -> RuntimeResult<Tensor> {
        self.reduction("min", axis, keepdim)
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::cpu::cpu_device;
    use crate::config::ExecutionConfig;
    use crate::error::RuntimeError;
    use crate::tensor::{DType, Tensor};
    use std::sync::Arc;

    #[test]
    fn test_eager_arithmetic() {
        let device = Arc::new(cpu_device(0, &Default::default(), &ExecutionConfig::default()));
        let a = Tensor::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2], &device).unwrap();
        let b = Tensor::from_slice(&[10.0f32, 20.0], &[2], &device).unwrap();

        let sum = a.add(&b).unwrap();
        assert_eq!(sum.to_vec::<f32>().unwrap(), vec![11.0, 22.0, 13.0, 24.0]);

        let scaled = a.mul_scalar(2.0).unwrap().add_scalar(1.0).unwrap();
        assert_eq!(scaled.to_vec::<f32>().unwrap(), vec![3.0, 5.0, 7.0, 9.0]);

        let rows = a.sum(Some(-1), false).unwrap();
        assert_eq!(rows.shape(), &[2]);
        assert_eq!(rows.to_vec::<f32>().unwrap(), vec![3.0, 7.0]);

        let total = a.mean(None, true).unwrap();
        assert_eq!(total.shape(), &[1, 1]);
        assert_eq!(total.get::<f32>(&[0, 0]).unwrap(), 2.5);

        let biggest = a.neg().unwrap().abs().unwrap().max(None, false).unwrap();
        assert_eq!(biggest.get::<f32>(&[]).unwrap(), 4.0);
    }

    #[test]
    fn test_eager_errors() {
        let device = Arc::new(cpu_device(0, &Default::default(), &ExecutionConfig::default()));
        let a = Tensor::zeros(&[2, 3], DType::F32, &device).unwrap();
        let b = Tensor::zeros(&[4], DType::F32, &device).unwrap();
        assert!(matches!(a.add(&b), Err(RuntimeError::ShapeMismatch(_))));

        let ints = Tensor::from_slice(&[1i32, 0], &[2], &device).unwrap();
        assert!(matches!(ints.div(&ints), Err(RuntimeError::InvalidInput(_))));
        assert!(matches!(ints.exp(), Err(RuntimeError::UnsupportedDType { .. })));
    }

    #[test]
    fn test_bare_device_has_no_kernels() {
        let device = Arc::new(crate::device::Device::cpu(0));
        let a = Tensor::zeros(&[2], DType::F32, &device).unwrap();
        assert!(matches!(a.relu(), Err(RuntimeError::UnknownKernel { .. })));
    }
}
