//! Container runtime seam: the lifecycle policy talks to containers only
//! through [`ContainerRuntime`].
//!
//! [`docker::DockerCli`] drives a real daemon through its command-line client;
//! [`mock::MockRuntime`] simulates one in memory for tests.

#![allow(missing_docs)]

pub mod docker;
pub mod exec;
pub mod mock;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::Result;

/// Everything the runtime needs to create a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Runtime storage options (`size=25GB`); empty leaves the runtime default.
    pub storage_opts: BTreeMap<String, String>,
    pub open_stdin: bool,
    pub tty: bool,
}

/// What `inspect` reports about a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerInfo {
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Combined stdout+stderr and exit code of an in-container command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i32,
}

/// Container runtime control surface.
///
/// `exec` returns `Ok` whenever the command ran to completion, whatever its
/// exit code; only failure to create or attach the exec session is an error.
pub trait ContainerRuntime: Send + Sync {
    fn create(&self, spec: &ContainerSpec) -> Result<String>;
    fn start(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<()>;
    /// Missing containers are reported as `CbhError::NotFound`.
    fn remove(&self, name: &str, force: bool) -> Result<()>;
    fn inspect(&self, name: &str) -> Result<ContainerInfo>;
    fn exec(&self, container_id: &str, argv: &[String], cancel: &CancelToken) -> Result<ExecOutput>;
    /// Release the client connection. Later calls fail with `Connection`.
    fn close(&self) -> Result<()>;
}

impl<R: ContainerRuntime + ?Sized> ContainerRuntime for Box<R> {
    fn create(&self, spec: &ContainerSpec) -> Result<String> {
        (**self).create(spec)
    }

    fn start(&self, name: &str) -> Result<()> {
        (**self).start(name)
    }

    fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<()> {
        (**self).stop(name, timeout)
    }

    fn remove(&self, name: &str, force: bool) -> Result<()> {
        (**self).remove(name, force)
    }

    fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        (**self).inspect(name)
    }

    fn exec(&self, container_id: &str, argv: &[String], cancel: &CancelToken) -> Result<ExecOutput> {
        (**self).exec(container_id, argv, cancel)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

impl<R: ContainerRuntime + ?Sized> ContainerRuntime for Arc<R> {
    fn create(&self, spec: &ContainerSpec) -> Result<String> {
        (**self).create(spec)
    }

    fn start(&self, name: &str) -> Result<()> {
        (**self).start(name)
    }

    fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<()> {
        (**self).stop(name, timeout)
    }

    fn remove(&self, name: &str, force: bool) -> Result<()> {
        (**self).remove(name, force)
    }

    fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        (**self).inspect(name)
    }

    fn exec(&self, container_id: &str, argv: &[String], cancel: &CancelToken) -> Result<ExecOutput> {
        (**self).exec(container_id, argv, cancel)
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}

/// Cooperative cancellation flag shared between callers and blocking runtime calls.
///
/// Clones share the same flag. Relaxed ordering is enough: waiters poll it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing flag, e.g. one registered with a signal handler.
    #[must_use]
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// The underlying flag, for registration with `signal_hook::flag`.
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
