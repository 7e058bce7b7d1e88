//! `docker` command-line client as a [`ContainerRuntime`].
//!
//! Every call is one blocking invocation of the client binary, polled so a
//! [`CancelToken`] can interrupt it. Connection
//! settings (`DOCKER_HOST`, contexts, TLS) come from the ambient environment,
//! the same way the client itself resolves them. Any binary that speaks the
//! same subcommands (`podman`) works.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::io::{ErrorKind, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::core::config::RuntimeConfig;
use crate::core::errors::{CbhError, Result};
use crate::runtime::{CancelToken, ContainerInfo, ContainerRuntime, ContainerSpec, ExecOutput};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runtime backed by the `docker` CLI.
#[derive(Debug)]
pub struct DockerCli {
    binary: String,
    exec_timeout: Option<Duration>,
    /// Interrupts lifecycle subcommands; exec takes its own token.
    cancel: CancelToken,
    closed: AtomicBool,
}

/// Exit code and drained output of one client invocation.
#[derive(Debug)]
struct Finished {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl DockerCli {
    /// Build a client without contacting the daemon.
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            exec_timeout: config.exec_timeout(),
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Let `cancel` interrupt create, start, stop, rm and inspect.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build a client and verify the daemon answers.
    pub fn connect(config: &RuntimeConfig) -> Result<Self> {
        Self::connect_with_cancel(config, CancelToken::new())
    }

    /// [`DockerCli::connect`], interruptible through `cancel` from the first call on.
    pub fn connect_with_cancel(config: &RuntimeConfig, cancel: CancelToken) -> Result<Self> {
        let cli = Self::new(config).with_cancel(cancel);
        let finished = cli.run(&[
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ])?;
        if finished.exit_code != 0 {
            return Err(CbhError::Connection {
                details: finished.stderr.trim().to_string(),
            });
        }
        Ok(cli)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CbhError::Connection {
                details: "runtime client already closed".to_string(),
            });
        }
        Ok(())
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).stdin(Stdio::null());
        cmd
    }

    fn run(&self, args: &[String]) -> Result<Finished> {
        self.ensure_open()?;
        self.spawn_and_wait(args, &self.cancel, None)
    }

    fn spawn_and_wait(
        &self,
        args: &[String],
        cancel: &CancelToken,
        timeout: Option<Duration>,
    ) -> Result<Finished> {
        let mut child = self
            .command(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| spawn_error(&self.binary, &source))?;

        // Drain both pipes concurrently so a chatty command cannot block on a full pipe.
        let stdout = child.stdout.take().map(drain_in_background);
        let stderr = child.stderr.take().map(drain_in_background);

        let what = args.first().map_or("command", String::as_str);
        let exit_code = self.wait_with_cancel(&mut child, cancel, timeout, what)?;
        Ok(Finished {
            exit_code,
            stdout: stdout.map(join_drained).unwrap_or_default(),
            stderr: stderr.map(join_drained).unwrap_or_default(),
        })
    }

    /// Run a lifecycle subcommand and map a failure through `on_error`.
    fn run_checked(
        &self,
        args: &[String],
        name: &str,
        on_error: impl FnOnce(String) -> CbhError,
    ) -> Result<String> {
        let finished = self.run(args)?;
        if finished.exit_code == 0 {
            return Ok(finished.stdout.trim().to_string());
        }
        Err(classify_failure(name, finished.stderr.trim(), on_error))
    }

    fn wait_with_cancel(
        &self,
        child: &mut Child,
        cancel: &CancelToken,
        timeout: Option<Duration>,
        what: &str,
    ) -> Result<i32> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|source| spawn_error(&self.binary, &source))?
            {
                return Ok(status.code().unwrap_or(-1));
            }

            let timed_out = deadline.is_some_and(|at| Instant::now() >= at);
            if cancel.is_cancelled() || timed_out {
                // Killing the client detaches; the daemon-side operation may outlive it.
                let _ = child.kill();
                let _ = child.wait();
                let details = if timed_out {
                    format!(
                        "{what} exceeded {}s deadline",
                        timeout.unwrap_or_default().as_secs()
                    )
                } else {
                    format!("{what} interrupted")
                };
                return Err(CbhError::Cancelled { details });
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl ContainerRuntime for DockerCli {
    fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.run_checked(&create_args(spec), &spec.name, |details| CbhError::Create {
            name: spec.name.clone(),
            details,
        })?;
        // Pull progress can precede the id on stdout.
        Ok(id.lines().last().unwrap_or_default().trim().to_string())
    }

    fn start(&self, name: &str) -> Result<()> {
        self.run_checked(&["start".to_string(), name.to_string()], name, |details| {
            CbhError::Start {
                name: name.to_string(),
                details,
            }
        })
        .map(drop)
    }

    fn stop(&self, name: &str, timeout: Option<Duration>) -> Result<()> {
        self.run_checked(&stop_args(name, timeout), name, |details| CbhError::Stop {
            name: name.to_string(),
            details,
        })
        .map(drop)
    }

    fn remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());
        self.run_checked(&args, name, |details| CbhError::Remove {
            name: name.to_string(),
            details,
        })
        .map(drop)
    }

    fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        let args = [
            "inspect".to_string(),
            "--type".to_string(),
            "container".to_string(),
            name.to_string(),
        ];
        let raw = self.run_checked(&args, name, |details| CbhError::Inspect {
            name: name.to_string(),
            details,
        })?;
        parse_inspect(name, &raw)
    }

    fn exec(&self, container_id: &str, argv: &[String], cancel: &CancelToken) -> Result<ExecOutput> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(CbhError::Cancelled {
                details: "cancelled before exec".to_string(),
            });
        }

        let mut args = vec!["exec".to_string(), container_id.to_string()];
        args.extend(argv.iter().cloned());

        let Finished {
            exit_code,
            stdout,
            stderr,
        } = self.spawn_and_wait(&args, cancel, self.exec_timeout)?;

        if exit_code != 0
            && let Some(err) = classify_exec_failure(container_id, &stderr)
        {
            return Err(err);
        }

        Ok(ExecOutput {
            output: format!("{stdout}{stderr}"),
            exit_code,
        })
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

// ──────────────────── argument builders ────────────────────

fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), spec.name.clone()];
    for (key, value) in &spec.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.storage_opts {
        args.push("--storage-opt".to_string());
        args.push(format!("{key}={value}"));
    }
    if spec.open_stdin {
        args.push("--interactive".to_string());
    }
    if spec.tty {
        args.push("--tty".to_string());
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

fn stop_args(name: &str, timeout: Option<Duration>) -> Vec<String> {
    let mut args = vec!["stop".to_string()];
    if let Some(timeout) = timeout {
        args.push("--time".to_string());
        args.push(timeout.as_secs().to_string());
    }
    args.push(name.to_string());
    args
}

// ──────────────────── output handling ────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRecord {
    id: String,
    #[serde(default)]
    name: String,
    state: InspectState,
    config: InspectConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

fn parse_inspect(name: &str, raw: &str) -> Result<ContainerInfo> {
    let records: Vec<InspectRecord> = serde_json::from_str(raw)?;
    let record = records.into_iter().next().ok_or_else(|| CbhError::NotFound {
        name: name.to_string(),
    })?;
    Ok(ContainerInfo {
        id: record.id,
        name: record.name.trim_start_matches('/').to_string(),
        running: record.state.running,
        labels: record.config.labels.unwrap_or_default(),
    })
}

fn classify_failure(
    name: &str,
    stderr: &str,
    on_error: impl FnOnce(String) -> CbhError,
) -> CbhError {
    if stderr.contains("No such container") || stderr.contains("no such container") {
        return CbhError::NotFound {
            name: name.to_string(),
        };
    }
    if is_connection_failure(stderr) {
        return CbhError::Connection {
            details: stderr.to_string(),
        };
    }
    on_error(stderr.to_string())
}

/// Failures reported by the client or daemon rather than by the command itself.
fn classify_exec_failure(container: &str, stderr: &str) -> Option<CbhError> {
    if is_connection_failure(stderr) {
        return Some(CbhError::Connection {
            details: stderr.trim().to_string(),
        });
    }
    let trimmed = stderr.trim_start();
    if trimmed.starts_with("Error response from daemon") || trimmed.starts_with("Error: No such container") {
        return Some(CbhError::ExecAttach {
            container: container.to_string(),
            details: stderr.trim().to_string(),
        });
    }
    None
}

fn is_connection_failure(stderr: &str) -> bool {
    stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("Is the docker daemon running")
        || stderr.contains("error during connect")
}

fn spawn_error(binary: &str, source: &std::io::Error) -> CbhError {
    let details = if source.kind() == ErrorKind::NotFound {
        format!("runtime binary {binary:?} not found")
    } else {
        format!("failed to run {binary:?}: {source}")
    };
    CbhError::Connection { details }
}

fn drain_in_background<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn join_drained(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "test".to_string(),
            image: "ubuntu:latest".to_string(),
            command: vec!["sleep".to_string(), "3600".to_string()],
            env: BTreeMap::new(),
            labels: BTreeMap::from([("threshold".to_string(), "25GB".to_string())]),
            storage_opts: BTreeMap::new(),
            open_stdin: true,
            tty: true,
        }
    }

    fn cli_with_binary(binary: &str) -> DockerCli {
        DockerCli::new(&RuntimeConfig {
            binary: binary.to_string(),
            exec_timeout_secs: 0,
        })
    }

    #[test]
    fn create_args_place_image_before_command() {
        let args = create_args(&spec());
        assert_eq!(
            args,
            vec![
                "create",
                "--name",
                "test",
                "--label",
                "threshold=25GB",
                "--interactive",
                "--tty",
                "ubuntu:latest",
                "sleep",
                "3600",
            ]
        );
    }

    #[test]
    fn create_args_include_storage_opt_when_set() {
        let mut spec = spec();
        spec.storage_opts
            .insert("size".to_string(), "25GB".to_string());
        let args = create_args(&spec);
        let pos = args.iter().position(|a| a == "--storage-opt").unwrap();
        assert_eq!(args[pos + 1], "size=25GB");
        assert!(pos < args.iter().position(|a| a == "ubuntu:latest").unwrap());
    }

    #[test]
    fn stop_args_with_and_without_timeout() {
        assert_eq!(stop_args("test", None), vec!["stop", "test"]);
        assert_eq!(
            stop_args("test", Some(Duration::from_secs(7))),
            vec!["stop", "--time", "7", "test"]
        );
    }

    #[test]
    fn parse_inspect_extracts_labels_and_state() {
        let raw = r#"[{
            "Id": "4f1c0ffee",
            "Name": "/test",
            "State": {"Status": "running", "Running": true},
            "Config": {"Image": "ubuntu:latest", "Labels": {"threshold": "25GB"}}
        }]"#;
        let info = parse_inspect("test", raw).unwrap();
        assert_eq!(info.id, "4f1c0ffee");
        assert_eq!(info.name, "test");
        assert!(info.running);
        assert_eq!(info.label("threshold"), Some("25GB"));
    }

    #[test]
    fn parse_inspect_tolerates_null_labels() {
        let raw = r#"[{"Id": "abc", "Name": "/plain", "State": {"Running": false}, "Config": {"Labels": null}}]"#;
        let info = parse_inspect("plain", raw).unwrap();
        assert!(info.labels.is_empty());
        assert!(!info.running);
    }

    #[test]
    fn parse_inspect_empty_array_is_not_found() {
        let err = parse_inspect("ghost", "[]").unwrap_err();
        assert!(matches!(err, CbhError::NotFound { .. }));
    }

    #[test]
    fn missing_container_maps_to_not_found() {
        let err = classify_failure(
            "test",
            "Error response from daemon: No such container: test",
            |details| CbhError::Remove {
                name: "test".to_string(),
                details,
            },
        );
        assert!(matches!(err, CbhError::NotFound { .. }));
    }

    #[test]
    fn daemon_down_maps_to_connection() {
        let err = classify_failure(
            "test",
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
            |details| CbhError::Start {
                name: "test".to_string(),
                details,
            },
        );
        assert_eq!(err.code(), "CBH-2001");
    }

    #[test]
    fn other_failures_use_operation_error() {
        let err = classify_failure("test", "Conflict. The container name is in use", |details| {
            CbhError::Create {
                name: "test".to_string(),
                details,
            }
        });
        assert!(matches!(err, CbhError::Create { .. }));
    }

    #[test]
    fn exec_on_stopped_container_is_attach_failure() {
        let err = classify_exec_failure(
            "abc",
            "Error response from daemon: container abc is not running\n",
        )
        .unwrap();
        assert!(matches!(err, CbhError::ExecAttach { .. }));
        assert!(classify_exec_failure("abc", "rm: cannot remove '/ballast'").is_none());
    }

    #[test]
    fn missing_binary_is_connection_error() {
        let cli = cli_with_binary("/nonexistent/cbh-runtime-binary");
        let err = cli.start("test").unwrap_err();
        assert_eq!(err.code(), "CBH-2001");
        let err = cli
            .exec("abc", &["true".to_string()], &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.code(), "CBH-2001");
    }

    #[test]
    fn closed_client_rejects_calls() {
        let cli = cli_with_binary("/nonexistent/cbh-runtime-binary");
        cli.close().unwrap();
        let err = cli.inspect("test").unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn cancelled_token_short_circuits_exec() {
        let cli = cli_with_binary("/nonexistent/cbh-runtime-binary");
        let token = CancelToken::new();
        token.cancel();
        let err = cli.exec("abc", &["true".to_string()], &token).unwrap_err();
        assert!(matches!(err, CbhError::Cancelled { .. }));
    }

    /// A client stand-in that ignores its arguments and hangs.
    #[cfg(unix)]
    fn hanging_client(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("hanging-docker");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn cancelled_token_interrupts_lifecycle_calls() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::new();
        token.cancel();
        let cli = cli_with_binary(&hanging_client(dir.path())).with_cancel(token);

        let started = Instant::now();
        let err = cli.stop("test", Some(Duration::from_secs(60))).unwrap_err();
        assert!(matches!(err, CbhError::Cancelled { .. }), "{err}");
        assert!(err.to_string().contains("stop interrupted"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn signal_during_create_interrupts_client() {
        let dir = tempfile::tempdir().unwrap();
        let token = CancelToken::new();
        let cli = cli_with_binary(&hanging_client(dir.path())).with_cancel(token.clone());

        let started = Instant::now();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            token.cancel();
        });
        let err = cli.create(&spec()).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, CbhError::Cancelled { .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn exec_captures_client_output_and_exit_code() {
        // `echo` stands in for the client: it prints its argv and exits 0.
        let cli = cli_with_binary("echo");
        let out = cli
            .exec(
                "abc",
                &["stat".to_string(), "-c".to_string(), "%s".to_string()],
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.output.trim(), "exec abc stat -c %s");
    }
}
