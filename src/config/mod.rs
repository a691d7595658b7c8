//! Configuration
//!
//! Environment-driven component settings and the orchestration descriptor

pub mod descriptor;
pub mod env;

pub use descriptor::{DescriptorError, OrchestrationDescriptor};
pub use env::{
    AgentConfig, BackendConfig, PipelineConfig, RegistryConfig, RegistryCredentials, RouterConfig,
};
