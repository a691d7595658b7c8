//! Domain model
//!
//! Plain data structures, no axum/tokio dependencies

pub mod image;
pub mod pipeline;
pub mod route;
pub mod service;

pub use image::{ImageRefError, ImageReference};
pub use pipeline::{
    DeployGate, JobRecord, JobState, LogLine, PipelineRun, PipelineState, Stage, StageStatus,
    TransitionError, TriggerRequest,
};
pub use route::{RouteRule, RouteTableError, RouteTarget, RoutingTable};
pub use service::{BuildSpec, PortMapping, ServiceDefinition};
