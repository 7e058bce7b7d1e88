//! Run a command inside a running container and insist on success.

#![allow(missing_docs)]

use crate::core::errors::{CbhError, Result};
use crate::runtime::{CancelToken, ContainerRuntime};

/// Executes argv inside a container, turning non-zero exits into errors.
///
/// No shell is involved: argv reaches the container's process table verbatim.
pub struct CommandRunner<'a, R: ContainerRuntime + ?Sized> {
    runtime: &'a R,
    cancel: &'a CancelToken,
}

impl<'a, R: ContainerRuntime + ?Sized> CommandRunner<'a, R> {
    pub fn new(runtime: &'a R, cancel: &'a CancelToken) -> Self {
        Self { runtime, cancel }
    }

    /// Run `argv` in `container_id` and return combined stdout+stderr.
    pub fn execute<S: AsRef<str>>(&self, container_id: &str, argv: &[S]) -> Result<String> {
        let argv: Vec<String> = argv.iter().map(|s| s.as_ref().to_string()).collect();
        let result = self.runtime.exec(container_id, &argv, self.cancel)?;
        if result.exit_code != 0 {
            return Err(CbhError::Execution {
                container: container_id.to_string(),
                exit_code: result.exit_code,
                output: result.output.trim().to_string(),
            });
        }
        Ok(result.output)
    }
}
