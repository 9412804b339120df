//! CPU/GPU synchronization primitives

pub mod sync;

pub use sync::{Fence, FenceState, Semaphore};
