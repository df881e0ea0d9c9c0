//! Stevedore — MCP deployment and routing platform.
//! Materializes declarative server templates as containers on a pluggable
//! backend (Docker, Kubernetes, or an in-memory mock), discovers their tools
//! through a cached four-tier cascade, and exposes every deployed server
//! through one authenticated gateway with health checking and per-template
//! load balancing.

pub mod backend;
pub mod config;
pub mod connection;
pub mod deploy;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod settings;
pub mod template;
pub mod tools;

pub use backend::{
    Backend, BackendKind, DeployRequest, Deployment, DeploymentFilter, DeploymentStatus,
    LogOptions, PortMapping,
};
pub use config::{ConfigLayers, ConfigProcessor, ProcessedConfig, VolumeMount};
pub use connection::Connection;
pub use deploy::{DeployOptions, DeployOutcome, DeploymentManager, DeploymentPlan};
pub use error::{Result, StevedoreError};
pub use gateway::{
    gateway_router, AuthMode, GatewayRegistry, GatewayState, HealthChecker, HealthCheckerConfig,
    InstanceRecord, LoadBalancer, RouterConfig, Strategy,
};
pub use protocol::McpTool;
pub use settings::Settings;
pub use template::{
    registry_handle, run_template_watch, RegistryHandle, TemplateDescriptor, TemplateRegistry,
    Transport,
};
pub use tools::{DiscoverOptions, Discovery, DiscoveryMethod, ToolManager};
