//! Static configuration: TOML model, parsing and semantic validation.

pub mod loader;
pub mod spec;

pub use loader::{load_config, ConfigError};
pub use spec::{
    CommandSpec, CommandTemplate, ConfigSpec, GlobalSpec, GroupSpec, RiskLevel, VarValue,
};
