//! Device families and the registry that resolves devices by id.
//!
//! A [`Backend`] groups every device of one [`DeviceType`] and may supply a
//! compiler for them. Backends are registered into a [`BackendManager`],
//! which callers construct and pass around explicitly.

pub mod cpu;
pub mod manager;

pub use manager::BackendManager;

use std::fmt;
use std::sync::Arc;

use crate::compiler::Compiler;
use crate::device::{Device, DeviceId, DeviceType};
use crate::error::{RuntimeError, RuntimeResult};

/// Builds a compiler targeting one device of the backend
pub type CompilerFactory = Arc<dyn Fn(Arc<Device>) -> RuntimeResult<Compiler> + Send + Sync>;

pub struct Backend {
    name: String,
    device_type: DeviceType,
    devices: Vec<Arc<Device>>,
    compiler_factory: Option<CompilerFactory>,
}

impl Backend {
    pub fn new(name: &str, device_type: DeviceType) -> Self {
        Self {
            name: name.to_string(),
            device_type,
            devices: Vec::new(),
            compiler_factory: None,
        }
    }

    /// Add a device; it must belong to this backend's family
    pub fn with_device(mut self, device: Arc<Device>) -> RuntimeResult<Self> {
        if device.device_type() != self.device_type {
            return Err(RuntimeError::device_mismatch(
                format!("{} device", self.device_type.prefix()),
                device.id(),
            ));
        }
        if self.devices.iter().any(|d| d.id() == device.id()) {
            return Err(RuntimeError::InvalidInput(format!(
                "device {} is already part of backend '{}'",
                device.id(),
                self.name
            )));
        }
        self.devices.push(device);
        Ok(self)
    }

    pub fn with_compiler<F>(mut self, factory: F) -> Self
    where
        F: Fn(Arc<Device>) -> RuntimeResult<Compiler> + Send + Sync + 'static,
    {
        self.compiler_factory = Some(Arc::new(factory));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(|d| d.id()).collect()
    }

    /// The device with index `index` within this family
    pub fn device(&self, index: usize) -> RuntimeResult<Arc<Device>> {
        self.devices
            .iter()
            .find(|d| d.id().index == index)
            .cloned()
            .ok_or_else(|| RuntimeError::DeviceNotFound(DeviceId::new(self.device_type, index).to_string()))
    }

    pub fn has_compiler(&self) -> bool {
        self.compiler_factory.is_some()
    }

    /// A fresh compiler targeting device `index`
    pub fn create_compiler(&self, index: usize) -> RuntimeResult<Compiler> {
        let device = self.device(index)?;
        let factory = self.compiler_factory.as_ref().ok_or_else(|| {
            RuntimeError::UnsupportedOperation(format!("backend '{}' provides no compiler", self.name))
        })?;
        factory(device)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("name", &self.name)
            .field("device_type", &self.device_type)
            .field("devices", &self.device_ids())
            .field("has_compiler", &self.has_compiler())
            .finish()
    }
}
