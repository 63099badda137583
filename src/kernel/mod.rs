//! Sandbox kernel: one isolated script context, its capability bindings,
//! its output cache and the guard that serializes execution.

mod error;
mod lifecycle;
pub mod output;
pub mod registry;
mod sandbox;

pub use error::KernelError;
pub use lifecycle::KernelState;
pub use output::{CaptureSink, OutputCache, OutputRecord};
pub use registry::{ImportCache, Registry, RegistryError};
pub use sandbox::{CallOptions, ExecutionResult, KernelConfig, KernelHealth, SandboxKernel};
