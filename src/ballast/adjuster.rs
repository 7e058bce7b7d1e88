//! Shrink the in-container ballast file by a fixed amount.
//!
//! Only the ballast path is ever touched: read its size, delete it, and
//! recreate it smaller. A shrink that reaches zero leaves the path absent.

#![allow(missing_docs)]

use serde::Serialize;

use crate::core::errors::{CbhError, Result};
use crate::core::size::StorageSize;
use crate::runtime::exec::CommandRunner;
use crate::runtime::{CancelToken, ContainerRuntime};

/// Ballast size before and after an adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Adjustment {
    pub previous: StorageSize,
    pub current: StorageSize,
}

impl Adjustment {
    #[must_use]
    pub fn released(&self) -> StorageSize {
        self.previous.saturating_sub(self.current)
    }
}

/// Reads, allocates and shrinks the ballast file inside one container.
pub struct BallastAdjuster<'a, R: ContainerRuntime + ?Sized> {
    runner: CommandRunner<'a, R>,
    path: &'a str,
}

impl<'a, R: ContainerRuntime + ?Sized> BallastAdjuster<'a, R> {
    pub fn new(runtime: &'a R, cancel: &'a CancelToken, path: &'a str) -> Self {
        Self {
            runner: CommandRunner::new(runtime, cancel),
            path,
        }
    }

    /// Current ballast size; an absent file counts as zero.
    pub fn current_size(&self, container_id: &str) -> Result<StorageSize> {
        match self
            .runner
            .execute(container_id, &["stat", "-c", "%s", self.path])
        {
            Ok(output) => Ok(StorageSize::from_bytes(super::parse::parse_file_size(&output)?)),
            Err(stat_err @ CbhError::Execution { .. }) => {
                match self.runner.execute(container_id, &["test", "-e", self.path]) {
                    // The file is there, so the stat failure is real.
                    Ok(_) => Err(stat_err),
                    Err(CbhError::Execution { exit_code: 1, .. }) => Ok(StorageSize::ZERO),
                    Err(other) => Err(other),
                }
            }
            Err(other) => Err(other),
        }
    }

    /// Pre-allocate the ballast file at exactly `size` bytes.
    pub fn allocate(&self, container_id: &str, size: StorageSize) -> Result<()> {
        let len = size.bytes().to_string();
        self.runner
            .execute(container_id, &["fallocate", "-l", len.as_str(), self.path])
            .map(drop)
    }

    /// Shrink the ballast by `reduction`, clamping at zero.
    ///
    /// A failed size read leaves the file untouched. Once the old file is
    /// removed, a failed re-allocation leaves the path absent; the next read
    /// then reports zero.
    pub fn reduce(&self, container_id: &str, reduction: StorageSize) -> Result<Adjustment> {
        let previous = self.current_size(container_id)?;
        let current = previous.saturating_sub(reduction);

        self.runner
            .execute(container_id, &["rm", "-f", self.path])
            .map_err(|e| CbhError::Adjustment {
                container: container_id.to_string(),
                details: format!("remove {}: {e}", self.path),
            })?;

        if !current.is_zero() {
            self.allocate(container_id, current)
                .map_err(|e| CbhError::Adjustment {
                    container: container_id.to_string(),
                    details: format!("allocate {} at {} bytes: {e}", self.path, current.bytes()),
                })?;
        }

        Ok(Adjustment { previous, current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;

    const PATH: &str = "/ballast";

    fn setup(ballast: Option<u64>) -> (MockRuntime, String) {
        let runtime = MockRuntime::new();
        let id = runtime.add_running("test");
        runtime.put_file(&id, "/home/user/data.bin", 7_000_000_000);
        if let Some(bytes) = ballast {
            runtime.put_file(&id, PATH, bytes);
        }
        (runtime, id)
    }

    #[test]
    fn reduce_by_half_gigabyte() {
        let (runtime, id) = setup(Some(5_000_000_000));
        let cancel = CancelToken::new();
        let adjuster = BallastAdjuster::new(&runtime, &cancel, PATH);

        let adj = adjuster
            .reduce(&id, StorageSize::from_gigabytes(0.5))
            .unwrap();
        assert_eq!(adj.previous.bytes(), 5_000_000_000);
        assert_eq!(adj.current.bytes(), 4_500_000_000);
        assert_eq!(adj.released().bytes(), 500_000_000);
        assert_eq!(runtime.file_size(&id, PATH), Some(4_500_000_000));
    }

    #[test]
    fn reduce_below_zero_leaves_path_absent() {
        let (runtime, id) = setup(Some(300_000_000));
        let cancel = CancelToken::new();
        let adjuster = BallastAdjuster::new(&runtime, &cancel, PATH);

        let adj = adjuster
            .reduce(&id, StorageSize::from_bytes(500_000_000))
            .unwrap();
        assert!(adj.current.is_zero());
        assert_eq!(runtime.file_size(&id, PATH), None);
        assert_eq!(runtime.exec_count("fallocate"), 0);

        // Shrinking an absent ballast stays at zero.
        let again = adjuster
            .reduce(&id, StorageSize::from_bytes(500_000_000))
            .unwrap();
        assert!(again.previous.is_zero());
        assert!(again.current.is_zero());
        assert_eq!(runtime.file_size(&id, PATH), None);
    }

    #[test]
    fn repeated_reductions_never_grow() {
        let (runtime, id) = setup(Some(1_200_000_000));
        let cancel = CancelToken::new();
        let adjuster = BallastAdjuster::new(&runtime, &cancel, PATH);

        let mut last = u64::MAX;
        for _ in 0..5 {
            let adj = adjuster
                .reduce(&id, StorageSize::from_bytes(500_000_000))
                .unwrap();
            assert!(adj.current <= adj.previous);
            assert!(adj.current.bytes() <= last);
            last = adj.current.bytes();
        }
        assert_eq!(last, 0);
    }

    #[test]
    fn other_files_are_never_touched() {
        let (runtime, id) = setup(Some(5_000_000_000));
        let cancel = CancelToken::new();
        let adjuster = BallastAdjuster::new(&runtime, &cancel, PATH);

        adjuster
            .reduce(&id, StorageSize::from_bytes(500_000_000))
            .unwrap();
        assert_eq!(
            runtime.file_size(&id, "/home/user/data.bin"),
            Some(7_000_000_000)
        );
    }

    #[test]
    fn unreadable_size_aborts_without_touching_file() {
        let (runtime, id) = setup(Some(5_000_000_000));
        runtime.override_exec("stat", 0, "stat: weird output");
        let cancel = CancelToken::new();
        let adjuster = BallastAdjuster::new(&runtime, &cancel, PATH);

        let err = adjuster
            .reduce(&id, StorageSize::from_bytes(500_000_000))
            .unwrap_err();
        assert_eq!(err.code(), "CBH-2301");
        assert_eq!(runtime.exec_count("rm"), 0);
        assert_eq!(runtime.file_size(&id, PATH), Some(5_000_000_000));
    }

    #[test]
    fn failing_stat_on_present_file_surfaces() {
        let (runtime, id) = setup(Some(5_000_000_000));
        runtime.override_exec("stat", 1, "stat: Permission denied");
        let cancel = CancelToken::new();
        let adjuster = BallastAdjuster::new(&runtime, &cancel, PATH);

        let err = adjuster.current_size(&id).unwrap_err();
        assert!(matches!(err, CbhError::Execution { .. }));
    }

    #[test]
    fn allocation_failure_is_adjustment_error() {
        let (runtime, id) = setup(Some(5_000_000_000));
        runtime.override_exec("fallocate", 1, "fallocate: fallocate failed: No space left on device");
        let cancel = CancelToken::new();
        let adjuster = BallastAdjuster::new(&runtime, &cancel, PATH);

        let err = adjuster
            .reduce(&id, StorageSize::from_bytes(500_000_000))
            .unwrap_err();
        assert_eq!(err.code(), "CBH-2302");
        // Removed but not recreated: the next read reports zero.
        assert_eq!(runtime.file_size(&id, PATH), None);
        assert!(adjuster.current_size(&id).unwrap().is_zero());
    }
}
