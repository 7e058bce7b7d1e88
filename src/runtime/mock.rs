//! In-memory container runtime for tests and dry runs.
//!
//! Simulates just enough of a daemon for the ballast policy: names, ids,
//! labels, running state, and a per-container file table that answers the
//! `fallocate`, `rm -f`, `stat -c %s`, `test -e` and `df` invocations the
//! policy issues. Every call is recorded for assertions.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::errors::{CbhError, Result};
use crate::core::size::{GB, StorageSize};
use crate::runtime::{CancelToken, ContainerInfo, ContainerRuntime, ContainerSpec, ExecOutput};

/// Host disk reported by `df` when a container has no storage quota.
const HOST_DISK_BYTES: u64 = 100 * GB;

/// One recorded runtime call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Create(String),
    Start(String),
    Stop(String),
    Remove(String),
    Inspect(String),
    Exec { container: String, argv: Vec<String> },
}

#[derive(Debug, Clone)]
struct MockContainer {
    id: String,
    name: String,
    running: bool,
    labels: BTreeMap<String, String>,
    files: BTreeMap<String, u64>,
    /// Bytes used by everything that is not in `files` (image + user data).
    user_data_bytes: u64,
    quota_bytes: Option<u64>,
}

impl MockContainer {
    fn used_bytes(&self) -> u64 {
        self.user_data_bytes + self.files.values().sum::<u64>()
    }
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    next_id: u64,
    calls: Vec<RuntimeCall>,
    exec_overrides: HashMap<String, ExecOutput>,
    create_error: Option<String>,
    start_error: Option<String>,
    stop_error: Option<String>,
    remove_error: Option<String>,
    closed: bool,
}

impl MockState {
    fn find(&self, name_or_id: &str) -> Option<&MockContainer> {
        self.containers
            .get(name_or_id)
            .or_else(|| self.containers.values().find(|c| c.id == name_or_id))
    }

    fn find_mut(&mut self, name_or_id: &str) -> Option<&mut MockContainer> {
        if self.containers.contains_key(name_or_id) {
            return self.containers.get_mut(name_or_id);
        }
        self.containers.values_mut().find(|c| c.id == name_or_id)
    }

    fn insert(&mut self, name: &str, running: bool, labels: BTreeMap<String, String>) -> String {
        self.next_id += 1;
        let id = format!("{:012x}", 0xc0_ffee_0000_u64 + self.next_id);
        self.containers.insert(
            name.to_string(),
            MockContainer {
                id: id.clone(),
                name: name.to_string(),
                running,
                labels,
                files: BTreeMap::new(),
                user_data_bytes: 0,
                quota_bytes: None,
            },
        );
        id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(CbhError::Connection {
                details: "runtime client already closed".to_string(),
            });
        }
        Ok(())
    }
}

/// Deterministic stand-in for a container daemon.
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ──────────────────── fixtures ────────────────────

    /// Add a running, unmanaged container. Returns its id.
    pub fn add_running(&self, name: &str) -> String {
        self.state.lock().insert(name, true, BTreeMap::new())
    }

    /// Add a stopped, unmanaged container. Returns its id.
    pub fn add_stopped(&self, name: &str) -> String {
        self.state.lock().insert(name, false, BTreeMap::new())
    }

    /// Add a running container carrying `label = value`. Returns its id.
    pub fn add_labelled(&self, name: &str, label: &str, value: &str) -> String {
        let labels = BTreeMap::from([(label.to_string(), value.to_string())]);
        self.state.lock().insert(name, true, labels)
    }

    /// Place a file of `bytes` at `path` inside a container.
    pub fn put_file(&self, name_or_id: &str, path: &str, bytes: u64) {
        if let Some(c) = self.state.lock().find_mut(name_or_id) {
            c.files.insert(path.to_string(), bytes);
        }
    }

    /// Set the non-ballast usage `df` accounts for.
    pub fn set_user_data(&self, name_or_id: &str, bytes: u64) {
        if let Some(c) = self.state.lock().find_mut(name_or_id) {
            c.user_data_bytes = bytes;
        }
    }

    /// Make every exec of `program` return this output instead of simulating it.
    pub fn override_exec(&self, program: &str, exit_code: i32, output: &str) {
        self.state.lock().exec_overrides.insert(
            program.to_string(),
            ExecOutput {
                output: output.to_string(),
                exit_code,
            },
        );
    }

    pub fn fail_create(&self, details: &str) {
        self.state.lock().create_error = Some(details.to_string());
    }

    pub fn fail_start(&self, details: &str) {
        self.state.lock().start_error = Some(details.to_string());
    }

    pub fn fail_stop(&self, details: &str) {
        self.state.lock().stop_error = Some(details.to_string());
    }

    pub fn fail_remove(&self, details: &str) {
        self.state.lock().remove_error = Some(details.to_string());
    }

    // ──────────────────── observations ────────────────────

    #[must_use]
    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.state.lock().calls.clone()
    }

    /// Exec calls whose argv starts with `program`.
    #[must_use]
    pub fn exec_count(&self, program: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, RuntimeCall::Exec { argv, .. } if argv.first().is_some_and(|p| p == program)))
            .count()
    }

    #[must_use]
    pub fn stop_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, RuntimeCall::Stop(n) if n == name))
            .count()
    }

    #[must_use]
    pub fn file_size(&self, name_or_id: &str, path: &str) -> Option<u64> {
        self.state
            .lock()
            .find(name_or_id)
            .and_then(|c| c.files.get(path).copied())
    }

    #[must_use]
    pub fn exists(&self, name_or_id: &str) -> bool {
        self.state.lock().find(name_or_id).is_some()
    }

    #[must_use]
    pub fn is_running(&self, name_or_id: &str) -> bool {
        self.state
            .lock()
            .find(name_or_id)
            .is_some_and(|c| c.running)
    }

    #[must_use]
    pub fn labels(&self, name_or_id: &str) -> BTreeMap<String, String> {
        self.state
            .lock()
            .find(name_or_id)
            .map(|c| c.labels.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn quota(&self, name_or_id: &str) -> Option<u64> {
        self.state.lock().find(name_or_id).and_then(|c| c.quota_bytes)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

impl ContainerRuntime for MockRuntime {
    fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.calls.push(RuntimeCall::Create(spec.name.clone()));
        if let Some(details) = state.create_error.clone() {
            return Err(CbhError::Create {
                name: spec.name.clone(),
                details,
            });
        }
        if state.containers.contains_key(&spec.name) {
            return Err(CbhError::Create {
                name: spec.name.clone(),
                details: format!(
                    "Conflict. The container name \"/{}\" is already in use",
                    spec.name
                ),
            });
        }
        let quota = match spec.storage_opts.get("size") {
            Some(raw) => Some(raw.parse::<StorageSize>()?.bytes()),
            None => None,
        };
        let id = state.insert(&spec.name, false, spec.labels.clone());
        if let Some(c) = state.find_mut(&id) {
            c.quota_bytes = quota;
        }
        Ok(id)
    }

    fn start(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.calls.push(RuntimeCall::Start(name.to_string()));
        if let Some(details) = state.start_error.clone() {
            return Err(CbhError::Start {
                name: name.to_string(),
                details,
            });
        }
        let container = state.find_mut(name).ok_or_else(|| CbhError::NotFound {
            name: name.to_string(),
        })?;
        container.running = true;
        Ok(())
    }

    fn stop(&self, name: &str, _timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.calls.push(RuntimeCall::Stop(name.to_string()));
        if let Some(details) = state.stop_error.clone() {
            return Err(CbhError::Stop {
                name: name.to_string(),
                details,
            });
        }
        let container = state.find_mut(name).ok_or_else(|| CbhError::NotFound {
            name: name.to_string(),
        })?;
        container.running = false;
        Ok(())
    }

    fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.calls.push(RuntimeCall::Remove(name.to_string()));
        if let Some(details) = state.remove_error.clone() {
            return Err(CbhError::Remove {
                name: name.to_string(),
                details,
            });
        }
        let (key, running) = match state.find(name) {
            Some(c) => (c.name.clone(), c.running),
            None => {
                return Err(CbhError::NotFound {
                    name: name.to_string(),
                });
            }
        };
        if running && !force {
            return Err(CbhError::Remove {
                name: name.to_string(),
                details: "cannot remove a running container; stop it first or force".to_string(),
            });
        }
        state.containers.remove(&key);
        Ok(())
    }

    fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.calls.push(RuntimeCall::Inspect(name.to_string()));
        let container = state.find(name).ok_or_else(|| CbhError::NotFound {
            name: name.to_string(),
        })?;
        Ok(ContainerInfo {
            id: container.id.clone(),
            name: container.name.clone(),
            running: container.running,
            labels: container.labels.clone(),
        })
    }

    fn exec(&self, container_id: &str, argv: &[String], cancel: &CancelToken) -> Result<ExecOutput> {
        let mut state = self.state.lock();
        state.ensure_open()?;
        state.calls.push(RuntimeCall::Exec {
            container: container_id.to_string(),
            argv: argv.to_vec(),
        });
        if cancel.is_cancelled() {
            return Err(CbhError::Cancelled {
                details: "exec interrupted".to_string(),
            });
        }

        let program = argv.first().cloned().unwrap_or_default();
        let overridden = state.exec_overrides.get(&program).cloned();

        let container = state
            .find_mut(container_id)
            .ok_or_else(|| CbhError::ExecAttach {
                container: container_id.to_string(),
                details: format!("Error response from daemon: No such container: {container_id}"),
            })?;
        if !container.running {
            return Err(CbhError::ExecAttach {
                container: container_id.to_string(),
                details: format!(
                    "Error response from daemon: container {} is not running",
                    container.id
                ),
            });
        }

        if let Some(output) = overridden {
            return Ok(output);
        }
        Ok(simulate(container, argv))
    }

    fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

fn ok(output: impl Into<String>) -> ExecOutput {
    ExecOutput {
        output: output.into(),
        exit_code: 0,
    }
}

fn fail(exit_code: i32, output: impl Into<String>) -> ExecOutput {
    ExecOutput {
        output: output.into(),
        exit_code,
    }
}

fn simulate(container: &mut MockContainer, argv: &[String]) -> ExecOutput {
    let args: Vec<&str> = argv.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["fallocate", "-l", len, path] => {
            let Ok(bytes) = len.parse::<u64>() else {
                return fail(1, format!("fallocate: invalid length value specified: '{len}'"));
            };
            let existing = container.files.get(*path).copied().unwrap_or(0);
            if let Some(quota) = container.quota_bytes
                && container.used_bytes() - existing + bytes > quota
            {
                return fail(1, "fallocate: fallocate failed: No space left on device\n");
            }
            container.files.insert((*path).to_string(), bytes);
            ok("")
        }
        ["rm", "-f", path] => {
            container.files.remove(*path);
            ok("")
        }
        ["stat", "-c", "%s", path] => match container.files.get(*path) {
            Some(size) => ok(format!("{size}\n")),
            None => fail(
                1,
                format!("stat: cannot statx '{path}': No such file or directory\n"),
            ),
        },
        ["test", "-e", path] => {
            if container.files.contains_key(*path) {
                ok("")
            } else {
                fail(1, "")
            }
        }
        ["df", "--block-size=1G", "/"] => {
            let total = container.quota_bytes.unwrap_or(HOST_DISK_BYTES);
            let used = container.used_bytes();
            let total_gb = total.div_ceil(GB);
            let used_gb = used.div_ceil(GB);
            let avail_gb = total_gb.saturating_sub(used_gb);
            let pct = if total == 0 {
                0
            } else {
                (used.saturating_mul(100)).div_ceil(total)
            };
            ok(format!(
                "Filesystem     1G-blocks  Used Available Use% Mounted on\n\
                 overlay        {total_gb:>9} {used_gb:>5} {avail_gb:>9} {pct:>3}% /\n"
            ))
        }
        [program, ..] => fail(
            127,
            format!(
                "OCI runtime exec failed: exec failed: unable to start container process: exec: \"{program}\": executable file not found in $PATH\n"
            ),
        ),
        [] => fail(126, "no command specified\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn df_reports_used_gigabytes_rounded_up() {
        let runtime = MockRuntime::new();
        let id = runtime.add_running("test");
        runtime.set_user_data(&id, 19 * GB);
        runtime.put_file(&id, "/ballast", 4_500_000_000);

        let out = runtime
            .exec(&id, &argv(&["df", "--block-size=1G", "/"]), &CancelToken::new())
            .unwrap();
        let row: Vec<&str> = out.output.lines().nth(1).unwrap().split_whitespace().collect();
        assert_eq!(row[2], "24");
    }

    #[test]
    fn fallocate_respects_quota() {
        let runtime = MockRuntime::new();
        let spec = ContainerSpec {
            name: "q".to_string(),
            image: "ubuntu:latest".to_string(),
            command: argv(&["sleep", "3600"]),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            storage_opts: BTreeMap::from([("size".to_string(), "1.0GB".to_string())]),
            open_stdin: false,
            tty: false,
        };
        let id = runtime.create(&spec).unwrap();
        runtime.start("q").unwrap();

        let out = runtime
            .exec(
                &id,
                &argv(&["fallocate", "-l", "2000000000", "/ballast"]),
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(out.exit_code, 1);
        assert!(out.output.contains("No space left"));
        assert_eq!(runtime.file_size(&id, "/ballast"), None);
    }

    #[test]
    fn duplicate_create_conflicts() {
        let runtime = MockRuntime::new();
        runtime.add_stopped("test");
        let spec = ContainerSpec {
            name: "test".to_string(),
            image: "ubuntu:latest".to_string(),
            command: Vec::new(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
            storage_opts: BTreeMap::new(),
            open_stdin: false,
            tty: false,
        };
        let err = runtime.create(&spec).unwrap_err();
        assert!(err.to_string().contains("already in use"));
    }

    #[test]
    fn unknown_program_exits_127() {
        let runtime = MockRuntime::new();
        let id = runtime.add_running("test");
        let out = runtime
            .exec(&id, &argv(&["bogus"]), &CancelToken::new())
            .unwrap();
        assert_eq!(out.exit_code, 127);
    }

    #[test]
    fn remove_running_requires_force() {
        let runtime = MockRuntime::new();
        runtime.add_running("test");
        assert!(runtime.remove("test", false).is_err());
        runtime.remove("test", true).unwrap();
        assert!(!runtime.exists("test"));
        assert!(matches!(
            runtime.remove("test", true),
            Err(CbhError::NotFound { .. })
        ));
    }
}
