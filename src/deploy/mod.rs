//! Deployment orchestration.

pub mod manager;

pub use manager::{
    DeployOptions, DeployOutcome, DeploymentManager, DeploymentPlan, LABEL_DEPLOY_NAME,
};
