//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use container_ballast_helper::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{CbhError, Result};
pub use crate::core::size::StorageSize;

// Runtime
pub use crate::runtime::docker::DockerCli;
pub use crate::runtime::mock::MockRuntime;
pub use crate::runtime::{CancelToken, ContainerInfo, ContainerRuntime, ContainerSpec, ExecOutput};

// Ballast
pub use crate::ballast::BallastPolicy;
pub use crate::ballast::adjuster::{Adjustment, BallastAdjuster};

// Lifecycle
pub use crate::lifecycle::{ContainerLifecycle, ContainerStatus, StopReport};

// Logging
pub use crate::logger::ActivityLog;
