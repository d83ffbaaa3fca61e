//! # Cache and Pool Configuration
//!
//! Tuning knobs for the caches and per-frame pools. Every structure has
//! defaults matching the values the backend has always shipped with, so an
//! application only needs a config file when it wants to change them.
//!
//! Files are loaded through the [`Config`] trait, which picks TOML or RON by
//! file extension:
//!
//! ```toml
//! log_level = "debug"
//!
//! [pipelines]
//! release_frequency = 2
//! time_to_keep = 4
//! ```

use crate::frame_ring::MAX_FRAMES_IN_FLIGHT;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;

        match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
            ConfigFormat::Ron => ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string())),
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => {
                toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
            }
            ConfigFormat::Ron => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?,
        };

        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Values parsed but failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

enum ConfigFormat {
    Toml,
    Ron,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(Self::Toml),
            Some("ron") => Ok(Self::Ron),
            _ => Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        }
    }
}

/// Eviction policy of a content-addressed cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcPolicy {
    /// Collection runs at most once every this many frames
    pub release_frequency: u64,
    /// Entries unused for this many frames are evicted
    pub time_to_keep: u64,
}

impl GcPolicy {
    /// Frames between two collection passes
    pub const DEFAULT_RELEASE_FREQUENCY: u64 = 2;
    /// Frames an unused entry survives
    pub const DEFAULT_TIME_TO_KEEP: u64 = 4;

    /// Create a policy
    pub const fn new(release_frequency: u64, time_to_keep: u64) -> Self {
        Self { release_frequency, time_to_keep }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<(), String> {
        if self.release_frequency == 0 {
            return Err("Release frequency must be at least 1".to_string());
        }
        if self.time_to_keep < MAX_FRAMES_IN_FLIGHT as u64 {
            return Err(format!(
                "Time to keep ({}) must cover the {} frames in flight",
                self.time_to_keep, MAX_FRAMES_IN_FLIGHT
            ));
        }
        Ok(())
    }
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RELEASE_FREQUENCY, Self::DEFAULT_TIME_TO_KEEP)
    }
}

/// Descriptor pool growth and eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorPoolConfig {
    /// Sets in the first pool allocated for a layout
    pub pool_alloc_base: u32,
    /// Multiplier applied when a slot outgrows its pool
    pub pool_alloc_factor: u32,
    /// Eviction of per-layout pools
    pub gc: GcPolicy,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        Self {
            pool_alloc_base: 8,
            pool_alloc_factor: 2,
            gc: GcPolicy::default(),
        }
    }
}

/// Staging buffer bucketing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    /// Size of the smallest bucket in bytes
    pub initial_size: u64,
    /// Multiplier between consecutive bucket sizes
    pub growth_factor: u64,
    /// Buffer count above which a slot's pool is rebuilt from scratch
    pub max_buffers_per_slot: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            initial_size: 256,
            growth_factor: 2,
            max_buffers_per_slot: 1024,
        }
    }
}

/// Transient command pool growth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandPoolConfig {
    /// Command buffers allocated whenever a slot runs out
    pub alloc_step: u32,
}

impl Default for CommandPoolConfig {
    fn default() -> Self {
        Self { alloc_step: 4 }
    }
}

/// # Resource Cache Configuration
///
/// Top-level configuration consumed by
/// [`ResourceContext`](crate::context::ResourceContext).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RhiCacheConfig {
    /// Log level used by [`crate::logging::init_with_level`]
    pub log_level: String,
    /// Pipeline and pipeline layout eviction
    pub pipelines: GcPolicy,
    /// Render pass and framebuffer eviction
    pub framebuffers: GcPolicy,
    /// Descriptor pools
    pub descriptors: DescriptorPoolConfig,
    /// Staging buffers
    pub staging: StagingConfig,
    /// Command pools
    pub command_pools: CommandPoolConfig,
}

impl RhiCacheConfig {
    /// Create a configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log level
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Set the pipeline cache policy
    pub fn with_pipeline_policy(mut self, policy: GcPolicy) -> Self {
        self.pipelines = policy;
        self
    }

    /// Set the framebuffer cache policy
    pub fn with_framebuffer_policy(mut self, policy: GcPolicy) -> Self {
        self.framebuffers = policy;
        self
    }

    /// Set descriptor pool configuration
    pub fn with_descriptors(mut self, descriptors: DescriptorPoolConfig) -> Self {
        self.descriptors = descriptors;
        self
    }

    /// Set staging configuration
    pub fn with_staging(mut self, staging: StagingConfig) -> Self {
        self.staging = staging;
        self
    }

    /// Set command pool configuration
    pub fn with_command_pools(mut self, command_pools: CommandPoolConfig) -> Self {
        self.command_pools = command_pools;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.pipelines.validate().map_err(|e| format!("pipelines: {e}"))?;
        self.framebuffers.validate().map_err(|e| format!("framebuffers: {e}"))?;
        self.descriptors.gc.validate().map_err(|e| format!("descriptors: {e}"))?;

        if self.descriptors.pool_alloc_base == 0 {
            return Err("Descriptor pool base size must be at least 1".to_string());
        }
        if self.descriptors.pool_alloc_factor < 2 {
            return Err("Descriptor pool growth factor must be at least 2".to_string());
        }
        if self.staging.initial_size == 0 {
            return Err("Staging initial size must be at least 1 byte".to_string());
        }
        if self.staging.growth_factor < 2 {
            return Err("Staging growth factor must be at least 2".to_string());
        }
        if self.staging.max_buffers_per_slot == 0 {
            return Err("Staging buffer limit must be at least 1".to_string());
        }
        if self.command_pools.alloc_step == 0 {
            return Err("Command buffer allocation step must be at least 1".to_string());
        }

        Ok(())
    }

    /// Load from file and validate
    pub fn load_validated(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }
}

impl Default for RhiCacheConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            pipelines: GcPolicy::default(),
            framebuffers: GcPolicy::default(),
            descriptors: DescriptorPoolConfig::default(),
            staging: StagingConfig::default(),
            command_pools: CommandPoolConfig::default(),
        }
    }
}

impl Config for RhiCacheConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = RhiCacheConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipelines.release_frequency, 2);
        assert_eq!(config.pipelines.time_to_keep, 4);
        assert_eq!(config.descriptors.pool_alloc_base, 8);
        assert_eq!(config.descriptors.pool_alloc_factor, 2);
        assert_eq!(config.staging.initial_size, 256);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = RhiCacheConfig::new().with_pipeline_policy(GcPolicy::new(0, 4));
        assert!(config.validate().unwrap_err().contains("pipelines"));

        let config = RhiCacheConfig::new().with_framebuffer_policy(GcPolicy::new(2, 1));
        assert!(config.validate().unwrap_err().contains("frames in flight"));

        let config = RhiCacheConfig::new().with_staging(StagingConfig {
            growth_factor: 1,
            ..StagingConfig::default()
        });
        assert!(config.validate().is_err());

        let config = RhiCacheConfig::new().with_command_pools(CommandPoolConfig { alloc_step: 0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rhi.toml");

        let config = RhiCacheConfig::new()
            .with_log_level("debug")
            .with_pipeline_policy(GcPolicy::new(3, 6));
        config.save_to_file(&path).unwrap();

        let loaded = RhiCacheConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_ron_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rhi.ron");

        let config = RhiCacheConfig::new().with_descriptors(DescriptorPoolConfig {
            pool_alloc_base: 16,
            ..DescriptorPoolConfig::default()
        });
        config.save_to_file(&path).unwrap();

        let loaded = RhiCacheConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.descriptors.pool_alloc_base, 16);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[staging]\ninitial_size = 1024\n").unwrap();

        let loaded = RhiCacheConfig::load_validated(&path).unwrap();
        assert_eq!(loaded.staging.initial_size, 1024);
        assert_eq!(loaded.staging.growth_factor, 2);
        assert_eq!(loaded.pipelines, GcPolicy::default());
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pipelines]\nrelease_frequency = 0\n").unwrap();

        assert!(matches!(RhiCacheConfig::load_validated(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unsupported_extension() {
        let config = RhiCacheConfig::default();
        assert!(matches!(
            config.save_to_file("config.json"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
