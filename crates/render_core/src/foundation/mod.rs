//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the crate:
//! - Logging setup and re-exported log macros
//! - RGBA color values used for clear colors

pub mod color;
pub mod logging;

pub use color::Color;
