//! Container lifecycle with ballast management.
//!
//! Run reserves a ballast file next to the user's data and records the
//! combined capacity in a label. Stop reads that label back, samples disk
//! usage, and shrinks the ballast when headroom is nearly gone so the next
//! start has room for the runtime's own bookkeeping.
//!
//! Diagnostics and ballast adjustment never decide whether a stop happens:
//! their errors are logged at one place in [`ContainerLifecycle::stop`] and
//! discarded.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::ballast::BallastPolicy;
use crate::ballast::adjuster::{Adjustment, BallastAdjuster};
use crate::ballast::parse::parse_used_space;
use crate::core::config::{Config, ContainerConfig};
use crate::core::errors::{CbhError, Result};
use crate::core::size::StorageSize;
use crate::logger::ActivityLog;
use crate::logger::jsonl::{EventType, LogEntry, Severity};
use crate::runtime::exec::CommandRunner;
use crate::runtime::{CancelToken, ContainerInfo, ContainerRuntime, ContainerSpec};

/// Disk usage probe for the container root filesystem, in whole gigabytes.
const DF_ARGV: [&str; 3] = ["df", "--block-size=1G", "/"];

// ──────────────────── reports ────────────────────

/// What a stop observed and did besides stopping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// The container carried the threshold label.
    pub managed: bool,
    pub headroom_gb: Option<i64>,
    /// Present when the ballast was shrunk.
    pub adjustment: Option<Adjustment>,
    /// Logged diagnostic or adjustment failure; the stop went ahead anyway.
    pub diagnostic_error: Option<String>,
}

/// Point-in-time view of a container's ballast state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub name: String,
    pub id: String,
    pub running: bool,
    pub managed: bool,
    pub threshold: Option<StorageSize>,
    pub used_gb: Option<i64>,
    pub headroom_gb: Option<i64>,
    pub ballast: Option<StorageSize>,
}

// ──────────────────── per-name locks ────────────────────

/// One mutex per container name, created on first use and dropped once idle.
#[derive(Debug, Default)]
struct NameLocks {
    slots: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    fn slot(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.slots.lock().entry(name.to_string()).or_default())
    }

    /// Run `f` while holding the lock for `name`.
    fn with_name<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let slot = self.slot(name);
        let out = {
            let _guard = slot.lock();
            f()
        };
        self.release(name, &slot);
        out
    }

    fn release(&self, name: &str, slot: &Arc<Mutex<()>>) {
        let mut slots = self.slots.lock();
        // Two owners left: the table and this caller. Nobody else holds or waits on it.
        if Arc::strong_count(slot) == 2 {
            slots.remove(name);
        }
    }
}

// ──────────────────── lifecycle ────────────────────

/// Run, stop, start and remove containers under ballast management.
///
/// Calls for different names proceed in parallel; calls for the same name
/// are serialised.
pub struct ContainerLifecycle<R: ContainerRuntime> {
    runtime: R,
    template: ContainerConfig,
    threshold: StorageSize,
    policy: BallastPolicy,
    locks: NameLocks,
    log: ActivityLog,
    cancel: CancelToken,
}

impl<R: ContainerRuntime> ContainerLifecycle<R> {
    #[must_use]
    pub fn new(runtime: R, config: &Config) -> Self {
        Self {
            runtime,
            template: config.container.clone(),
            threshold: config.container.combined_quota(&config.ballast),
            policy: BallastPolicy::from_config(&config.ballast),
            locks: NameLocks::default(),
            log: ActivityLog::disabled(),
            cancel: CancelToken::new(),
        }
    }

    #[must_use]
    pub fn with_log(mut self, log: ActivityLog) -> Self {
        self.log = log;
        self
    }

    /// Share a cancellation flag with in-container commands. Runtime clients
    /// that interrupt their own calls take the same token separately.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    pub fn policy(&self) -> &BallastPolicy {
        &self.policy
    }

    /// Capacity recorded on every container this lifecycle creates.
    #[must_use]
    pub fn threshold(&self) -> StorageSize {
        self.threshold
    }

    /// Create and start `name`, then allocate its ballast. Returns the container id.
    ///
    /// Any failure after create force-removes the half-built container; a
    /// cleanup failure is logged but the original error is returned.
    pub fn run(&self, name: &str) -> Result<String> {
        self.locks.with_name(name, || self.run_locked(name))
    }

    /// Stop `name`, shrinking its ballast first when headroom is low.
    ///
    /// Only the runtime stop itself can fail this call.
    pub fn stop(&self, name: &str) -> Result<StopReport> {
        self.locks.with_name(name, || self.stop_locked(name))
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.locks.with_name(name, || self.start_locked(name))
    }

    /// Force-remove `name`. A container that is already gone counts as removed.
    pub fn remove(&self, name: &str) -> Result<()> {
        self.locks.with_name(name, || self.remove_locked(name))
    }

    /// Inspect `name` and sample its ballast state without changing anything.
    ///
    /// Samples that cannot be taken are reported as `None`.
    pub fn status(&self, name: &str) -> Result<ContainerStatus> {
        self.locks.with_name(name, || self.status_locked(name))
    }

    /// Release the runtime client. Consumes the lifecycle.
    pub fn close(self) -> Result<()> {
        self.log.sync();
        self.runtime.close()
    }

    // ──────────────────── internals ────────────────────

    fn run_locked(&self, name: &str) -> Result<String> {
        let threshold = self.threshold();
        let spec = self.container_spec(name, threshold);
        let id = self.runtime.create(&spec).inspect_err(|e| {
            self.log
                .record(&LogEntry::new(EventType::ContainerRun, Severity::Warning).container(name).failure(e));
        })?;

        if let Err(err) = self.provision(name, &id) {
            if let Err(cleanup) = self.runtime.remove(name, true) {
                self.log.record(
                    &LogEntry::new(EventType::Error, Severity::Warning)
                        .container(name)
                        .failure(&cleanup)
                        .details("cleanup after failed run"),
                );
            }
            self.log
                .record(&LogEntry::new(EventType::ContainerRun, Severity::Warning).container(name).failure(&err));
            return Err(err);
        }

        let mut entry = LogEntry::new(EventType::ContainerRun, Severity::Info)
            .container(name)
            .ok(true)
            .details(format!("threshold {threshold}"));
        entry.capacity_gb = Some(threshold.whole_gigabytes());
        self.log.record(&entry);
        Ok(id)
    }

    fn stop_locked(&self, name: &str) -> Result<StopReport> {
        let mut report = StopReport::default();
        match self.runtime.inspect(name) {
            Ok(info) => {
                if let Some(label) = info.label(&self.template.threshold_label) {
                    report.managed = true;
                    if let Err(err) = self.diagnose_and_adjust(&info, label, &mut report) {
                        self.log.record(
                            &LogEntry::new(EventType::DiagnosticFailure, Severity::Warning)
                                .container(name)
                                .failure(&err),
                        );
                        report.diagnostic_error = Some(err.to_string());
                    }
                }
            }
            Err(err) => {
                self.log.record(
                    &LogEntry::new(EventType::DiagnosticFailure, Severity::Warning)
                        .container(name)
                        .failure(&err),
                );
                report.diagnostic_error = Some(err.to_string());
            }
        }

        match self.runtime.stop(name, self.template.stop_timeout()) {
            Ok(()) => {
                let mut entry = LogEntry::new(EventType::ContainerStop, Severity::Info)
                    .container(name)
                    .ok(true);
                if !report.managed {
                    entry = entry.details("unmanaged");
                }
                self.log.record(&entry);
                Ok(report)
            }
            Err(err) => {
                self.log
                    .record(&LogEntry::new(EventType::ContainerStop, Severity::Warning).container(name).failure(&err));
                Err(err)
            }
        }
    }

    fn start_locked(&self, name: &str) -> Result<()> {
        match self.runtime.start(name) {
            Ok(()) => {
                self.log
                    .record(&LogEntry::new(EventType::ContainerStart, Severity::Info).container(name).ok(true));
                Ok(())
            }
            Err(err) => {
                self.log
                    .record(&LogEntry::new(EventType::ContainerStart, Severity::Warning).container(name).failure(&err));
                Err(err)
            }
        }
    }

    fn remove_locked(&self, name: &str) -> Result<()> {
        match self.runtime.remove(name, true) {
            Ok(()) => {
                self.log
                    .record(&LogEntry::new(EventType::ContainerRemove, Severity::Info).container(name).ok(true));
                Ok(())
            }
            Err(CbhError::NotFound { .. }) => {
                self.log.record(
                    &LogEntry::new(EventType::ContainerRemove, Severity::Info)
                        .container(name)
                        .ok(true)
                        .details("already absent"),
                );
                Ok(())
            }
            Err(err) => {
                self.log
                    .record(&LogEntry::new(EventType::ContainerRemove, Severity::Warning).container(name).failure(&err));
                Err(err)
            }
        }
    }

    fn status_locked(&self, name: &str) -> Result<ContainerStatus> {
        let info = self.runtime.inspect(name)?;
        let threshold = info
            .label(&self.template.threshold_label)
            .and_then(|raw| raw.parse::<StorageSize>().ok());
        let (used_gb, ballast) = if info.running {
            let used = CommandRunner::new(&self.runtime, &self.cancel)
                .execute(&info.id, &DF_ARGV)
                .and_then(|out| parse_used_space(&out))
                .ok();
            let ballast = self.adjuster().current_size(&info.id).ok();
            (used, ballast)
        } else {
            (None, None)
        };
        let headroom_gb = match (threshold, used_gb) {
            (Some(t), Some(used)) => Some(BallastPolicy::headroom_gb(t.whole_gigabytes(), used)),
            _ => None,
        };

        Ok(ContainerStatus {
            managed: info.label(&self.template.threshold_label).is_some(),
            name: info.name,
            id: info.id,
            running: info.running,
            threshold,
            used_gb,
            headroom_gb,
            ballast,
        })
    }

    fn adjuster(&self) -> BallastAdjuster<'_, R> {
        BallastAdjuster::new(&self.runtime, &self.cancel, &self.policy.path)
    }

    fn container_spec(&self, name: &str, threshold: StorageSize) -> ContainerSpec {
        let labels = BTreeMap::from([(self.template.threshold_label.clone(), threshold.to_string())]);
        let mut storage_opts = BTreeMap::new();
        if self.template.enforce_storage_quota {
            storage_opts.insert("size".to_string(), threshold.to_string());
        }
        ContainerSpec {
            name: name.to_string(),
            image: self.template.image.clone(),
            command: self.template.command.clone(),
            env: self.template.env.clone(),
            labels,
            storage_opts,
            open_stdin: true,
            tty: true,
        }
    }

    fn provision(&self, name: &str, id: &str) -> Result<()> {
        self.runtime.start(name)?;
        self.adjuster().allocate(id, self.policy.margin)?;

        let mut entry = LogEntry::new(EventType::BallastAllocate, Severity::Info)
            .container(name)
            .ok(true);
        entry.size = Some(self.policy.margin.bytes());
        self.log.record(&entry);
        Ok(())
    }

    fn diagnose_and_adjust(
        &self,
        info: &ContainerInfo,
        label: &str,
        report: &mut StopReport,
    ) -> Result<()> {
        let capacity_gb = label.parse::<StorageSize>()?.whole_gigabytes();
        if !info.running {
            return Ok(());
        }

        let df = CommandRunner::new(&self.runtime, &self.cancel).execute(&info.id, &DF_ARGV)?;
        let used_gb = parse_used_space(&df)?;
        let headroom = BallastPolicy::headroom_gb(capacity_gb, used_gb);
        report.headroom_gb = Some(headroom);
        if !self.policy.should_shrink(headroom) {
            return Ok(());
        }

        let adjustment = self
            .adjuster()
            .reduce(&info.id, self.policy.shrink_step)?;
        report.adjustment = Some(adjustment);

        let mut entry = LogEntry::new(EventType::BallastShrink, Severity::Info)
            .container(&info.name)
            .ok(true);
        entry.size = Some(adjustment.current.bytes());
        entry.previous_size = Some(adjustment.previous.bytes());
        entry.used_gb = Some(used_gb);
        entry.capacity_gb = Some(capacity_gb);
        self.log.record(&entry);
        Ok(())
    }
}
