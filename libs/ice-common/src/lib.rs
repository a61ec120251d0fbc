//! ice-common - shared plumbing for the post-processing crates
//!
//! This library provides logging initialisation, layered configuration
//! loading and the common error type used by the command line tools.

pub mod config;
pub mod error;
pub mod logging;

// Re-exports for convenience
pub use error::{Error, Result};
pub use logging::{init_logging, LogConfig, LogFormat};

/// Common prelude
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use tracing::{debug, error, info, trace, warn};
}
