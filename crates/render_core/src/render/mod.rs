//! # Rendering resources
//!
//! GPU resource and command-buffer lifecycle over the Vulkan backend.

/// Graphics backend implementations
pub mod backends;

pub use backends::vulkan;
