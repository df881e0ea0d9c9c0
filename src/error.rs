//! Error types for Stevedore platform operations.

use thiserror::Error;

/// Main error type for Stevedore operations
#[derive(Error, Debug)]
pub enum StevedoreError {
    // --- input errors: surfaced to the caller, never retried ---
    /// No template with the given id exists in the registry
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// A template descriptor failed to parse or validate
    #[error("invalid template '{0}': {1}")]
    InvalidTemplate(String, String),

    /// A configuration value failed merge, coercion, or validation
    #[error("invalid configuration for '{0}': {1}")]
    InvalidConfiguration(String, String),

    /// A config property attempted to map onto a reserved environment variable
    #[error("reserved environment variable: {0}")]
    ReservedEnvVar(String),

    // --- backend errors ---
    /// The container runtime or orchestrator is not reachable
    #[error("backend '{0}' unavailable: {1}")]
    BackendUnavailable(String, String),

    /// Image pull failed for a deployment
    #[error("image pull failed for '{0}': {1}")]
    ImagePull(String, String),

    /// A host port could not be bound
    #[error("port bind failed for {0}: {1}")]
    PortBind(String, String),

    /// No non-overlapping subnet could be validated
    #[error("network allocation failed: {0}")]
    NetworkAllocation(String),

    /// Container create / start / remove failed for a template
    #[error("deployment failed for template '{0}': {1}")]
    Deployment(String, String),

    /// No deployment with the given id exists on the backend
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    // --- runtime errors ---
    /// A call to a deployed server timed out
    #[error("call timeout for '{0}'")]
    Timeout(String),

    /// The transport to a deployed server closed with calls outstanding
    #[error("connection closed for '{0}'")]
    ConnectionClosed(String),

    /// JSON-RPC protocol error for a deployed server
    #[error("protocol error for '{0}': {1}")]
    Protocol(String, String),

    /// The remote tool ran and returned a structured error (`isError: true`)
    #[error("tool '{0}' returned an error: {1}")]
    ToolExecution(String, String),

    // --- routing errors ---
    /// Every registered instance of the template is unhealthy
    #[error("no healthy instances for template '{0}'")]
    NoHealthyInstances(String),

    /// The per-instance request queue is at capacity
    #[error("request queue full for instance '{0}'")]
    QueueFull(String),

    /// Gateway authentication failed
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    // --- persistence ---
    /// Writing the gateway registry to disk failed
    #[error("registry persistence failed: {0}")]
    Persistence(String),
}

impl StevedoreError {
    /// Stable machine-readable error type tag, used in gateway error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TemplateNotFound(_) => "template_not_found",
            Self::InvalidTemplate(..) => "invalid_template",
            Self::InvalidConfiguration(..) => "invalid_configuration",
            Self::ReservedEnvVar(_) => "reserved_env_var",
            Self::BackendUnavailable(..) => "backend_unavailable",
            Self::ImagePull(..) => "image_pull_failed",
            Self::PortBind(..) => "port_bind_failed",
            Self::NetworkAllocation(_) => "network_allocation_failed",
            Self::Deployment(..) => "deployment_error",
            Self::DeploymentNotFound(_) => "deployment_not_found",
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed(_) => "connection_closed",
            Self::Protocol(..) => "protocol_error",
            Self::ToolExecution(..) => "tool_execution_error",
            Self::NoHealthyInstances(_) => "no_healthy_instances",
            Self::QueueFull(_) => "queue_full",
            Self::AuthFailed(_) => "auth_failed",
            Self::Persistence(_) => "persistence_failed",
        }
    }

    /// True for transport-level failures the router may retry under its policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectionClosed(_) | Self::BackendUnavailable(..)
        )
    }
}

/// Result type alias for Stevedore operations
pub type Result<T> = std::result::Result<T, StevedoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_not_found_display() {
        let err = StevedoreError::TemplateNotFound("demo".to_string());
        assert_eq!(err.to_string(), "template not found: demo");
    }

    #[test]
    fn test_invalid_configuration_display() {
        let err = StevedoreError::InvalidConfiguration(
            "server.port".to_string(),
            "expected integer".to_string(),
        );
        assert_eq!(
            err.to_string(),
            "invalid configuration for 'server.port': expected integer"
        );
    }

    #[test]
    fn test_timeout_display() {
        let err = StevedoreError::Timeout("demo-a1b2".to_string());
        assert_eq!(err.to_string(), "call timeout for 'demo-a1b2'");
    }

    #[test]
    fn test_tool_execution_never_retryable() {
        let err = StevedoreError::ToolExecution("echo".to_string(), "boom".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "tool_execution_error");
    }

    #[test]
    fn test_transport_errors_retryable() {
        assert!(StevedoreError::Timeout("x".into()).is_retryable());
        assert!(StevedoreError::ConnectionClosed("x".into()).is_retryable());
        assert!(!StevedoreError::TemplateNotFound("x".into()).is_retryable());
    }
}
