//! # Core Module
//!
//! Shared configuration used by the device and resource layers.

pub mod config;

pub use crate::foundation;

pub use config::{Config, ConfigError, RenderCoreConfig};
