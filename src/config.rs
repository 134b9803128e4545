//! Runtime configuration: optimizer levels, allocator limits and kernel
//! execution tuning, loadable from JSON.

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{RuntimeError, RuntimeResult};

/// How much rewriting the compiler pipeline is allowed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OptimizationLevel {
    /// Shape inference only
    None,
    /// All enabled generic passes
    Basic,
    /// Generic passes plus fusion and memory planning
    Aggressive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub level: OptimizationLevel,
    pub constant_folding: bool,
    pub dead_code_elimination: bool,
    pub canonicalization: bool,
    pub kernel_fusion: bool,
    pub memory_planning: bool,
    /// Upper bound on the number of elementwise steps in one fused node
    pub max_fusion_depth: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            level: OptimizationLevel::Aggressive,
            constant_folding: true,
            dead_code_elimination: true,
            canonicalization: true,
            kernel_fusion: true,
            memory_planning: true,
            max_fusion_depth: 8,
        }
    }
}

impl OptimizerConfig {
    pub fn generic_enabled(&self, flag: bool) -> bool {
        self.level >= OptimizationLevel::Basic && flag
    }

    pub fn backend_enabled(&self, flag: bool) -> bool {
        self.level >= OptimizationLevel::Aggressive && flag
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Byte alignment of every host allocation
    pub alignment: usize,
    /// Freed blocks kept per allocation size for reuse
    pub max_pooled_per_size: usize,
    /// Hard cap on bytes in use per device, if any
    pub device_memory_limit: Option<usize>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            alignment: 64,
            max_pooled_per_size: 100,
            device_memory_limit: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// 0 lets rayon pick the thread count
    pub num_worker_threads: usize,
    /// Minimum element count before a kernel goes parallel
    pub parallel_threshold: usize,
    /// Block size for deterministic floating-point sums
    pub reduction_chunk: usize,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            num_worker_threads: 0,
            parallel_threshold: 32 * 1024,
            reduction_chunk: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub cpu_devices: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self { cpu_devices: 1 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DevelopmentConfig {
    pub verbose_logging: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub optimizer: OptimizerConfig,
    pub memory: MemoryConfig,
    pub execution: ExecutionConfig,
    pub backend: BackendConfig,
    pub development: DevelopmentConfig,
}

impl RuntimeConfig {
    pub fn validate(&self) -> RuntimeResult<()> {
        if !self.memory.alignment.is_power_of_two() {
            return Err(RuntimeError::ConfigurationError(format!(
                "memory.alignment must be a power of two, got {}",
                self.memory.alignment
            )));
        }
        if self.execution.reduction_chunk == 0 {
            return Err(RuntimeError::ConfigurationError(
                "execution.reduction_chunk must be positive".to_string(),
            ));
        }
        if self.backend.cpu_devices == 0 {
            return Err(RuntimeError::ConfigurationError(
                "backend.cpu_devices must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration manager with optional file persistence
pub struct ConfigManager {
    config: Arc<RwLock<RuntimeConfig>>,
    config_file: Option<PathBuf>,
    custom_settings: HashMap<String, serde_json::Value>,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(RuntimeConfig::default())),
            config_file: None,
            custom_settings: HashMap::new(),
        }
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> RuntimeResult<()> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&content)?;
        config.validate()?;

        *self.config.write() = config;
        self.config_file = Some(path.to_path_buf());

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> RuntimeResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read())?;
        std::fs::write(path, content)?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> RuntimeConfig {
        self.config.read().clone()
    }

    /// Apply `f` to a copy of the configuration and commit it if it validates
    pub fn update_config<F>(&mut self, f: F) -> RuntimeResult<()>
    where
        F: FnOnce(&mut RuntimeConfig),
    {
        let mut updated = self.get_config();
        f(&mut updated);
        updated.validate()?;
        *self.config.write() = updated;

        if let Some(ref path) = self.config_file {
            self.save_to_file(path)?;
        }
        Ok(())
    }

    pub fn set_custom_setting(&mut self, key: &str, value: serde_json::Value) {
        self.custom_settings.insert(key.to_string(), value);
    }

    pub fn get_custom_setting(&self, key: &str) -> Option<&serde_json::Value> {
        self.custom_settings.get(key)
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Get the global configuration
pub fn get_config() -> RuntimeConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the global configuration
pub fn update_config<F>(f: F) -> RuntimeResult<()>
where
    F: FnOnce(&mut RuntimeConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file
pub fn load_config_from_file(path: &Path) -> RuntimeResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

pub struct ConfigBuilder {
    config: RuntimeConfig,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn optimizer(mut self, f: impl FnOnce(&mut OptimizerConfig)) -> Self {
        f(&mut self.config.optimizer);
        self
    }

    pub fn memory(mut self, f: impl FnOnce(&mut MemoryConfig)) -> Self {
        f(&mut self.config.memory);
        self
    }

    pub fn execution(mut self, f: impl FnOnce(&mut ExecutionConfig)) -> Self {
        f(&mut self.config.execution);
        self
    }

    pub fn backend(mut self, f: impl FnOnce(&mut BackendConfig)) -> Self {
        f(&mut self.config.backend);
        self
    }

    pub fn development(mut self, f: impl FnOnce(&mut DevelopmentConfig)) -> Self {
        f(&mut self.config.development);
        self
    }

    pub fn build(self) -> RuntimeConfig {
        self.config
    }

    pub fn apply(self) -> RuntimeResult<()> {
        let config = self.config;
        update_config(move |c| *c = config)
    }
}
