//! Device creation and the native entry point seam

pub mod ash_device;
pub mod context;
pub mod device_api;

pub use ash_device::{create_headless, AshDevice};
pub use context::*;
pub use device_api::DeviceApi;
