//! Kernel registry entries and their attribute bags

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{RuntimeError, RuntimeResult};
use crate::tensor::Tensor;

/// Named parameters passed to a kernel.
///
/// The three groups are opaque to the runtime: names are never validated
/// here, only by the kernel that reads them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelAttributes {
    pub floats: BTreeMap<String, f64>,
    pub ints: BTreeMap<String, i64>,
    pub strings: BTreeMap<String, String>,
}

impl KernelAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_float(mut self, name: &str, value: f64) -> Self {
        self.floats.insert(name.to_string(), value);
        self
    }

    pub fn with_int(mut self, name: &str, value: i64) -> Self {
        self.ints.insert(name.to_string(), value);
        self
    }

    pub fn with_string(mut self, name: &str, value: &str) -> Self {
        self.strings.insert(name.to_string(), value.to_string());
        self
    }

    pub fn float(&self, name: &str) -> Option<f64> {
        self.floats.get(name).copied()
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        self.ints.get(name).copied()
    }

    pub fn string(&self, name: &str) -> Option<&str> {
        self.strings.get(name).map(String::as_str)
    }

    pub fn require_float(&self, name: &str) -> RuntimeResult<f64> {
        self.float(name)
            .ok_or_else(|| RuntimeError::InvalidInput(format!("missing float attribute '{}'", name)))
    }

    pub fn is_empty(&self) -> bool {
        self.floats.is_empty() && self.ints.is_empty() && self.strings.is_empty()
    }
}

impl fmt::Display for KernelAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        for (k, v) in &self.floats {
            parts.push(format!("{}={}", k, v));
        }
        for (k, v) in &self.ints {
            parts.push(format!("{}={}", k, v));
        }
        for (k, v) in &self.strings {
            parts.push(format!("{}=\"{}\"", k, v));
        }
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// A compiled routine bound to one device's kernel registry
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;

    /// Outputs are preallocated by the caller; the kernel only writes them.
    fn launch(&self, inputs: &[Tensor], outputs: &mut [Tensor], attrs: &KernelAttributes) -> RuntimeResult<()>;
}

type KernelFn = dyn Fn(&[Tensor], &mut [Tensor], &KernelAttributes) -> RuntimeResult<()> + Send + Sync;

/// Adapts a closure into a registry entry
pub struct FnKernel {
    name: String,
    func: Box<KernelFn>,
}

impl FnKernel {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Tensor], &mut [Tensor], &KernelAttributes) -> RuntimeResult<()> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            func: Box::new(func),
        }
    }
}

impl Kernel for FnKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn launch(&self, inputs: &[Tensor], outputs: &mut [Tensor], attrs: &KernelAttributes) -> RuntimeResult<()> {
        (self.func)(inputs, outputs, attrs)
    }
}

/// Check kernel arity before touching any tensor
pub fn expect_arity(kernel: &str, inputs: &[Tensor], outputs: &[Tensor], n_in: usize, n_out: usize) -> RuntimeResult<()> {
    if inputs.len() != n_in || outputs.len() < n_out {
        return Err(RuntimeError::InvalidInput(format!(
            "kernel '{}' expects {} inputs and {} outputs, got {} and {}",
            kernel,
            n_in,
            n_out,
            inputs.len(),
            outputs.len()
        )));
    }
    Ok(())
}
