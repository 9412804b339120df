//! # Render Core Configuration
//!
//! Settings read once at device creation: application identity, logging,
//! validation layers, pooled allocation and the fence wait timeout used by
//! every blocking flush.

use serde::{Deserialize, Serialize};

use crate::foundation::Color;

pub use crate::config::{Config, ConfigError};

/// Default fence timeout for blocking flushes: one second
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 1_000_000_000;

/// # Render Core Configuration
///
/// Loaded from `.toml` or `.ron` through [`Config`], or built in code with
/// the `with_*` methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderCoreConfig {
    /// Application name reported to the Vulkan instance
    pub application_name: String,
    /// Log level name (`error`, `warn`, `info`, `debug`, `trace`)
    pub log_level: String,
    /// Whether to enable validation layers; `None` follows the build type
    pub enable_validation: Option<bool>,
    /// Sub-allocate buffers from a memory pool instead of one allocation each
    pub use_memory_pool: bool,
    /// Timeout for internal fence waits, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Clear color used when callers do not supply one
    pub default_clear_color: Color,
}

impl RenderCoreConfig {
    /// Create a configuration with defaults for everything but the name
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            ..Self::default()
        }
    }

    /// Set the log level name
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Force validation layers on or off
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Enable or disable pooled buffer allocation
    pub fn with_memory_pool(mut self, enabled: bool) -> Self {
        self.use_memory_pool = enabled;
        self
    }

    /// Set the internal fence timeout
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Set the default clear color
    pub fn with_clear_color(mut self, color: Color) -> Self {
        self.default_clear_color = color;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Parsed log level
    pub fn level_filter(&self) -> log::LevelFilter {
        crate::foundation::logging::parse_level(&self.log_level)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.trim().is_empty() {
            return Err("Application name must not be empty".to_string());
        }
        if self.fence_timeout_ns == 0 {
            return Err("Fence timeout must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Load from file and validate in one step
    pub fn load_validated(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate().map_err(ConfigError::Invalid)?;
        Ok(config)
    }
}

impl Default for RenderCoreConfig {
    fn default() -> Self {
        Self {
            application_name: "render_core".to_string(),
            log_level: "info".to_string(),
            enable_validation: None,
            use_memory_pool: true,
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            default_clear_color: Color::CORNFLOWER_BLUE,
        }
    }
}

impl Config for RenderCoreConfig {}
