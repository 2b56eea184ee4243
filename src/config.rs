//! Configuration for interpreter channels

use serde::{Deserialize, Serialize};
use std::path::Path;
use crate::error::{AnvilError, AnvilResult};
use crate::tensor::Device;

/// Which `Channel` implementation `Interpreter::create_channel` builds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Background worker thread draining the op queue
    Worker,
    /// Executes every entry on the submitting thread
    Inline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub kind: ChannelKind,
    pub default_device: Device,
    pub worker_name: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            kind: ChannelKind::Worker,
            default_device: Device::Cpu,
            worker_name: "anvil-worker".to_string(),
        }
    }
}

/// Initial values of the runtime options, see `interpreter::options`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptionConfig {
    pub async_level: usize,
    pub enable_drop: bool,
    pub eager_shape_inference: bool,
    pub candidate_cache_size: usize,
    pub candidate_max_elements: usize,
}

impl Default for OptionConfig {
    fn default() -> Self {
        Self {
            async_level: 2,
            enable_drop: false,
            eager_shape_inference: true,
            candidate_cache_size: 64,
            candidate_max_elements: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Start a profile as soon as a channel is created
    pub start_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn tracing_level(&self) -> AnvilResult<tracing::Level> {
        self.level
            .parse()
            .map_err(|_| AnvilError::ConfigurationError(format!("Unknown log level '{}'", self.level)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub channel: ChannelConfig,
    pub options: OptionConfig,
    pub profiling: ProfilingConfig,
    pub logging: LoggingConfig,
}

impl InterpreterConfig {
    pub fn load_from_file(path: impl AsRef<Path>) -> AnvilResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| AnvilError::operation_error("config", &format!("Failed to read config file: {}", e)))?;

        let config: InterpreterConfig = serde_json::from_str(&content)
            .map_err(|e| AnvilError::operation_error("config", &format!("Failed to parse config file: {}", e)))?;
        config.validate()?;

        tracing::info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> AnvilResult<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| AnvilError::operation_error("config", &format!("Failed to write config file: {}", e)))?;

        tracing::info!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn validate(&self) -> AnvilResult<()> {
        if self.options.async_level > 2 {
            return Err(AnvilError::ConfigurationError(format!(
                "async_level must be 0, 1 or 2, got {}",
                self.options.async_level
            )));
        }
        if self.channel.worker_name.is_empty() {
            return Err(AnvilError::ConfigurationError("worker_name must not be empty".to_string()));
        }
        self.logging.tracing_level()?;
        Ok(())
    }
}

/// Create a configuration builder for easy setup
pub struct ConfigBuilder {
    config: InterpreterConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: InterpreterConfig::default(),
        }
    }

    pub fn channel(mut self, f: impl FnOnce(&mut ChannelConfig)) -> Self {
        f(&mut self.config.channel);
        self
    }

    pub fn options(mut self, f: impl FnOnce(&mut OptionConfig)) -> Self {
        f(&mut self.config.options);
        self
    }

    pub fn profiling(mut self, f: impl FnOnce(&mut ProfilingConfig)) -> Self {
        f(&mut self.config.profiling);
        self
    }

    pub fn logging(mut self, f: impl FnOnce(&mut LoggingConfig)) -> Self {
        f(&mut self.config.logging);
        self
    }

    pub fn build(self) -> AnvilResult<InterpreterConfig> {
        self.config.validate()?;
        Ok(self.config)
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
            .channel(|c| c.kind = ChannelKind::Inline)
            .options(|o| {
                o.async_level = 0;
                o.enable_drop = true;
            })
            .build()
            .unwrap();

        assert_eq!(config.channel.kind, ChannelKind::Inline);
        assert_eq!(config.options.async_level, 0);
        assert!(config.options.enable_drop);
        assert!(config.options.eager_shape_inference);
    }

    #[test]
    fn test_config_validation() {
        let err = ConfigBuilder::new().options(|o| o.async_level = 3).build().unwrap_err();
        assert!(matches!(err, AnvilError::ConfigurationError(_)));

        let err = ConfigBuilder::new().logging(|l| l.level = "loud".to_string()).build().unwrap_err();
        assert!(err.to_string().contains("loud"));
    }

    #[test]
    fn test_config_file_io() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("interpreter.json");

        let config = ConfigBuilder::new()
            .channel(|c| c.default_device = Device::Cuda(1))
            .options(|o| o.candidate_cache_size = 8)
            .build()
            .unwrap();
        config.save_to_file(&config_path).unwrap();

        let loaded = InterpreterConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.channel.default_device, Device::Cuda(1));
        assert_eq!(loaded.options.candidate_cache_size, 8);
    }

    #[test]
    fn test_partial_config_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("partial.json");
        std::fs::write(&config_path, r#"{ "channel": { "kind": "inline" } }"#).unwrap();

        let loaded = InterpreterConfig::load_from_file(&config_path).unwrap();
        assert_eq!(loaded.channel.kind, ChannelKind::Inline);
        assert_eq!(loaded.options.async_level, 2);
    }
}
