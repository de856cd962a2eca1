//! Pre-execution safety primitives: path validation and file integrity
//! verification against the recorded hash manifest.

pub mod hash;
pub mod path;

pub use hash::{resolve_hash_dir, Verifier};
pub use path::{PathValidator, ValidateOptions, ValidatedPath};
