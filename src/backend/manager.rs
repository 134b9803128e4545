use parking_lot::Mutex;
use std::sync::Arc;
use tracing::info;

use super::cpu::cpu_backend;
use super::Backend;
use crate::config::RuntimeConfig;
use crate::device::{Device, DeviceId, DeviceType};
use crate::error::{RuntimeError, RuntimeResult};

/// Registry of backends and their devices.
///
/// Registration and lookup are serialized by one lock. The registry only
/// grows: backends stay registered for the manager's lifetime, and callers
/// must keep it alive while tensors on its devices exist.
#[derive(Debug, Default)]
pub struct BackendManager {
    backends: Mutex<Vec<Arc<Backend>>>,
}

impl BackendManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// A manager with the CPU backend described by `config` registered
    pub fn with_defaults(config: &RuntimeConfig) -> RuntimeResult<Self> {
        let manager = Self::new();
        manager.register_backend(cpu_backend(config)?)?;
        Ok(manager)
    }

    /// Register a backend; none of its devices may already be registered
    pub fn register_backend(&self, backend: Backend) -> RuntimeResult<Arc<Backend>> {
        let mut backends = self.backends.lock();
        for device in backend.devices() {
            let id = device.id();
            if backends.iter().any(|b| b.devices().iter().any(|d| d.id() == id)) {
                return Err(RuntimeError::InvalidInput(format!("device {} is already registered", id)));
            }
        }
        info!(
            backend = backend.name(),
            devices = backend.devices().len(),
            compiler = backend.has_compiler(),
            "backend registered"
        );
        let backend = Arc::new(backend);
        backends.push(Arc::clone(&backend));
        Ok(backend)
    }

    /// Every registered device, in registration order
    pub fn enumerate_devices(&self) -> Vec<Arc<Device>> {
        self.backends
            .lock()
            .iter()
            .flat_map(|b| b.devices().iter().cloned())
            .collect()
    }

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.enumerate_devices().iter().map(|d| d.id()).collect()
    }

    pub fn get_device(&self, device_type: DeviceType, index: usize) -> RuntimeResult<Arc<Device>> {
        let id = DeviceId::new(device_type, index);
        self.backends
            .lock()
            .iter()
            .flat_map(|b| b.devices().iter())
            .find(|d| d.id() == id)
            .cloned()
            .ok_or_else(|| RuntimeError::DeviceNotFound(id.to_string()))
    }

    /// The first registered backend of `device_type`
    pub fn backend(&self, device_type: DeviceType) -> RuntimeResult<Arc<Backend>> {
        self.backends
            .lock()
            .iter()
            .find(|b| b.device_type() == device_type)
            .cloned()
            .ok_or_else(|| RuntimeError::DeviceNotFound(format!("no {} backend registered", device_type.prefix())))
    }

    pub fn backends(&self) -> Vec<Arc<Backend>> {
        self.backends.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.backends.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use std::thread;

    #[test]
    fn test_default_manager_exposes_cpu_devices() {
        let config = ConfigBuilder::new().backend(|b| b.cpu_devices = 2).build();
        let manager = BackendManager::with_defaults(&config).unwrap();
        assert_eq!(manager.device_ids(), vec![DeviceId::cpu(0), DeviceId::cpu(1)]);
        let device = manager.get_device(DeviceType::Cpu, 1).unwrap();
        assert!(device.has_kernel("add"));
        assert!(matches!(
            manager.get_device(DeviceType::Cuda, 0),
            Err(RuntimeError::DeviceNotFound(_))
        ));
        assert!(manager.backend(DeviceType::Cpu).unwrap().has_compiler());
        assert!(manager.backend(DeviceType::Rocm).is_err());
    }

    #[test]
    fn test_duplicate_devices_rejected() {
        let manager = BackendManager::new();
        let first = Backend::new("cpu", DeviceType::Cpu)
            .with_device(Arc::new(Device::cpu(0)))
            .unwrap();
        manager.register_backend(first).unwrap();
        let again = Backend::new("cpu-2", DeviceType::Cpu)
            .with_device(Arc::new(Device::cpu(0)))
            .unwrap();
        assert!(manager.register_backend(again).is_err());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_concurrent_registration_and_lookup() {
        let manager = Arc::new(BackendManager::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let backend = Backend::new(&format!("cpu-{}", i), DeviceType::Cpu)
                        .with_device(Arc::new(Device::cpu(i)))
                        .unwrap();
                    manager.register_backend(backend).unwrap();
                    manager.get_device(DeviceType::Cpu, i).unwrap().id()
                })
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), DeviceId::cpu(i));
        }
        assert_eq!(manager.enumerate_devices().len(), 4);
    }
}
