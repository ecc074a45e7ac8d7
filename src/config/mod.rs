//! Configuration: a YAML file with `YAACC_*` environment overrides.

mod loader;
mod types;

pub use loader::ENV_PREFIX;
pub use types::*;
