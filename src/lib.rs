#![forbid(unsafe_code)]

//! Container Ballast Helper (cbh): keeps quota-limited containers restartable.
//!
//! A container whose root filesystem fills its storage quota cannot be
//! restarted: the runtime has nowhere to write its own bookkeeping. cbh
//! reserves a ballast file inside each container at creation time and, when
//! the container is stopped with almost no headroom left, shrinks that file so
//! the next start succeeds. User data is never touched.
//!
//! # Library usage
//!
//! ```rust,no_run
//! use container_ballast_helper::prelude::*;
//!
//! # fn main() -> Result<()> {
//! let config = Config::load(None)?;
//! let lifecycle = ContainerLifecycle::new(DockerCli::connect(&config.runtime)?, &config);
//! lifecycle.run("test")?;
//! let report = lifecycle.stop("test")?;
//! println!("shrunk: {:?}", report.adjustment);
//! lifecycle.close()
//! # }
//! ```
//!
//! [`runtime::mock::MockRuntime`] stands in for a daemon in tests.

pub mod prelude;

pub mod ballast;
pub mod core;
pub mod lifecycle;
pub mod logger;
pub mod runtime;
