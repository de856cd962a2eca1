//! Configuration expansion: variables, templates, timeouts, and the
//! spec-to-runtime lowering that ties them together.

pub mod runtime;
pub mod template;
pub mod timeout;
pub mod vars;

pub use runtime::{
    expand_command, expand_global, expand_group, ExpandError, RuntimeCommand, RuntimeGlobal,
    RuntimeGroup,
};
pub use timeout::{Timeout, TimeoutLevel, TimeoutResolution};
