//! Template engine — descriptor parsing, disk registry, hot reload.

pub mod descriptor;
pub mod registry;
pub mod watch;

pub use descriptor::{
    ConfigSchema, PropertySchema, TemplateDescriptor, TemplateOrigin, Transport, TransportSpec,
};
pub use registry::TemplateRegistry;
pub use watch::{registry_handle, run_template_watch, RegistryHandle};
