//! Gateway runtime — registry, health checker, load balancer, and router.

pub mod balancer;
pub mod health;
pub mod pool;
pub mod registry;
pub mod router;

pub use balancer::{BalancerConfig, LoadBalancer, Strategy};
pub use health::{HealthChecker, HealthCheckerConfig};
pub use pool::{StdioPoolConfig, StdioPools};
pub use registry::{
    Endpoint, GatewayRegistry, HealthThresholds, HealthTransition, InstanceRecord, InstanceStatus,
    TemplateRouting,
};
pub use router::{gateway_router, AuthMode, GatewayState, RouterConfig};
