//! Configuration management for the graph engine

use lazy_static::lazy_static;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{GraphError, GraphResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Dispatch independent ready operations of a wave on the rayon pool
    pub parallel: bool,
    /// 0 leaves the global rayon pool alone
    pub num_worker_threads: usize,
    /// Iterations a single loop frame may run before the call is aborted
    pub max_loop_iterations: usize,
    /// Compare executor outputs against inferred static shapes
    pub validate_output_shapes: bool,
    pub rng_seed: Option<u64>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallel: cfg!(feature = "parallel"),
            num_worker_threads: 0,
            max_loop_iterations: 100_000,
            validate_output_shapes: true,
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    pub gradient_suffix: String,
    pub gradient_scope: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            gradient_suffix: "-grad".to_string(),
            gradient_scope: "grad".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevelopmentConfig {
    pub debug_mode: bool,
    pub verbose_logging: bool,
}

impl Default for DevelopmentConfig {
    fn default() -> Self {
        Self {
            debug_mode: false,
            verbose_logging: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub execution: ExecutionConfig,
    pub naming: NamingConfig,
    pub development: DevelopmentConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> GraphResult<()> {
        if self.execution.max_loop_iterations == 0 {
            return Err(GraphError::Configuration(
                "max_loop_iterations must be at least 1".to_string(),
            ));
        }
        if self.naming.gradient_suffix.is_empty() {
            return Err(GraphError::Configuration(
                "gradient_suffix must not be empty".to_string(),
            ));
        }
        if self.naming.gradient_scope.is_empty() || self.naming.gradient_scope.contains('/') {
            return Err(GraphError::Configuration(format!(
                "invalid gradient scope '{}'",
                self.naming.gradient_scope
            )));
        }
        Ok(())
    }
}

/// Configuration manager backed by an optional JSON file
pub struct ConfigManager {
    config: Arc<RwLock<EngineConfig>>,
    config_file: Option<PathBuf>,
    custom_settings: HashMap<String, serde_json::Value>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            config: Arc::new(RwLock::new(EngineConfig::default())),
            config_file: None,
            custom_settings: HashMap::new(),
        }
    }

    pub fn with_config_file(mut self, path: PathBuf) -> Self {
        self.config_file = Some(path);
        self
    }

    pub fn load_from_file(&mut self, path: &Path) -> GraphResult<()> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        config.validate()?;

        *self.config.write() = config;
        self.config_file = Some(path.to_path_buf());

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> GraphResult<()> {
        let content = serde_json::to_string_pretty(&*self.config.read())?;
        std::fs::write(path, content)?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn get_config(&self) -> EngineConfig {
        self.config.read().clone()
    }

    pub fn update_config<F>(&mut self, f: F) -> GraphResult<()>
    where
        F: FnOnce(&mut EngineConfig),
    {
        let mut updated = self.get_config();
        f(&mut updated);
        updated.validate()?;
        *self.config.write() = updated;

        // Save to file if configured
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

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref CONFIG_MANAGER: RwLock<ConfigManager> = RwLock::new(ConfigManager::new());
}

/// Get the global configuration
pub fn get_config() -> EngineConfig {
    CONFIG_MANAGER.read().get_config()
}

/// Update the global configuration
pub fn update_config<F>(f: F) -> GraphResult<()>
where
    F: FnOnce(&mut EngineConfig),
{
    CONFIG_MANAGER.write().update_config(f)
}

/// Load the global configuration from a JSON file
pub fn load_config_from_file(path: &Path) -> GraphResult<()> {
    CONFIG_MANAGER.write().load_from_file(path)
}

/// Fluent construction of an `EngineConfig`
pub struct ConfigBuilder {
    config: EngineConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn execution(mut self, f: impl FnOnce(&mut ExecutionConfig)) -> Self {
        f(&mut self.config.execution);
        self
    }

    pub fn naming(mut self, f: impl FnOnce(&mut NamingConfig)) -> Self {
        f(&mut self.config.naming);
        self
    }

    pub fn development(mut self, f: impl FnOnce(&mut DevelopmentConfig)) -> Self {
        f(&mut self.config.development);
        self
    }

    pub fn build(self) -> GraphResult<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Install as the process-wide configuration
    pub fn apply(self) -> GraphResult<()> {
        let config = self.build()?;
        update_config(|c| *c = config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .execution(|e| {
                e.parallel = false;
                e.max_loop_iterations = 10;
            })
            .naming(|n| n.gradient_suffix = "_g".to_string())
            .build()
            .unwrap();

        assert!(!config.execution.parallel);
        assert_eq!(config.execution.max_loop_iterations, 10);
        assert_eq!(config.naming.gradient_suffix, "_g");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let result = ConfigBuilder::new()
            .execution(|e| e.max_loop_iterations = 0)
            .build();
        assert!(matches!(result, Err(GraphError::Configuration(_))));

        let mut manager = ConfigManager::new();
        assert!(manager
            .update_config(|c| c.naming.gradient_scope = "a/b".to_string())
            .is_err());
        assert_eq!(manager.get_config().naming.gradient_scope, "grad");
    }

    #[test]
    fn test_config_manager() {
        let mut manager = ConfigManager::new();
        assert!(manager.get_config().execution.validate_output_shapes);

        manager
            .update_config(|c| c.execution.validate_output_shapes = false)
            .unwrap();
        assert!(!manager.get_config().execution.validate_output_shapes);
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("samediff_config.json");

        let mut manager = ConfigManager::new().with_config_file(config_path.clone());
        manager
            .update_config(|c| c.execution.rng_seed = Some(42))
            .unwrap();

        let mut loaded = ConfigManager::new();
        loaded.load_from_file(&config_path).unwrap();
        assert_eq!(loaded.get_config().execution.rng_seed, Some(42));
    }
}
