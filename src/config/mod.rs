//! Configuration processing — layered merge, type coercion, and plan output.

pub mod layers;
pub mod processor;

pub use layers::{env_key_for_path, split_path, ConfigLayers, ENV_INPUT_PREFIX};
pub use processor::{
    identity_env, is_reserved_env, ConfigProcessor, ProcessedConfig, VolumeMount,
    IDENTITY_ENV_KEYS, RESERVED_ENV_PREFIX,
};
