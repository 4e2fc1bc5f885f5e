//! Thin async wrapper over the `docker` command line
//!
//! Every call runs as a child process with a bounded deadline and observes
//! the caller's cancellation token. Output is returned trimmed; a non-zero
//! exit becomes `InfrastructureUnavailable` carrying docker's stderr.

use crate::cancel::{run_cancellable, CancellationToken};
use crate::error::{HarnessError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Label attached to every container and network a session creates
pub const SESSION_LABEL: &str = "reporter-harness.session";

/// Captured output of a successful docker invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// One `-p` mapping. A `None` host port asks docker for an ephemeral one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: Option<u16>,
}

impl PortBinding {
    pub fn fixed(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port: Some(host_port),
        }
    }

    pub fn ephemeral(container_port: u16) -> Self {
        Self {
            container_port,
            host_port: None,
        }
    }

    fn publish_arg(&self) -> String {
        match self.host_port {
            Some(host) => format!("127.0.0.1:{}:{}", host, self.container_port),
            None => format!("127.0.0.1::{}", self.container_port),
        }
    }
}

/// Everything needed for `docker run -d`
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub alias: String,
    pub env: Vec<(String, String)>,
    pub ports: Vec<PortBinding>,
    pub labels: BTreeMap<String, String>,
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>, network: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            alias: name.clone(),
            name,
            image: image.into(),
            network: network.into(),
            env: Vec::new(),
            ports: Vec::new(),
            labels: BTreeMap::new(),
            command: Vec::new(),
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn port(mut self, binding: PortBinding) -> Self {
        self.ports.push(binding);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = args.into_iter().map(Into::into).collect();
        self
    }

    /// Arguments for `docker run`, in order
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--network".to_string(),
            self.network.clone(),
            "--network-alias".to_string(),
            self.alias.clone(),
        ];
        for (key, value) in &self.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for binding in &self.ports {
            args.push("-p".to_string());
            args.push(binding.publish_arg());
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Handle to the docker CLI
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
    command_timeout: Duration,
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            command_timeout,
        }
    }

    /// Run `docker <args>` and return its output on success
    pub async fn run<S: AsRef<str>>(&self, args: &[S], cancel: &CancellationToken) -> Result<CommandOutput> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        let verb = args.first().copied().unwrap_or_default().to_string();
        tracing::debug!(args = ?args, "docker");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let timeout = self.command_timeout;
        let output = run_cancellable(cancel, async {
            tokio::time::timeout(timeout, cmd.output())
                .await
                .map_err(|_| HarnessError::timeout(format!("docker {}", verb), timeout))?
                .map_err(|e| {
                    HarnessError::InfrastructureUnavailable(format!(
                        "Failed to execute {}: {}",
                        self.binary.display(),
                        e
                    ))
                })
        })
        .await?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if !output.status.success() {
            return Err(HarnessError::InfrastructureUnavailable(format!(
                "docker {} failed: {}",
                verb, stderr
            )));
        }

        Ok(CommandOutput { stdout, stderr })
    }

    /// Server version; doubles as a daemon reachability check
    pub async fn version(&self, cancel: &CancellationToken) -> Result<String> {
        let out = self
            .run(&["version", "--format", "{{.Server.Version}}"], cancel)
            .await?;
        Ok(out.stdout)
    }

    /// `version`, with an absent binary or unreachable daemon reported as
    /// an unmet precondition rather than an infrastructure fault
    pub async fn ensure_daemon(&self, cancel: &CancellationToken) -> Result<String> {
        match self.version(cancel).await {
            Ok(version) => Ok(version),
            Err(HarnessError::Cancelled) => Err(HarnessError::Cancelled),
            Err(e) => Err(HarnessError::PreconditionUnmet(format!("Docker daemon not reachable: {}", e))),
        }
    }

    pub async fn network_create(
        &self,
        name: &str,
        labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut args = vec![
            "network".to_string(),
            "create".to_string(),
            "--driver".to_string(),
            "bridge".to_string(),
        ];
        for (key, value) in labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(name.to_string());
        self.run(&args, cancel).await?;
        Ok(())
    }

    pub async fn network_remove(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        match self.run(&["network", "rm", name], cancel).await {
            Err(HarnessError::InfrastructureUnavailable(msg)) if is_missing(&msg) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// `docker run -d`, returning the container id
    pub async fn run_container(&self, spec: &ContainerSpec, cancel: &CancellationToken) -> Result<String> {
        let out = self.run(&spec.run_args(), cancel).await?;
        out.stdout
            .lines()
            .last()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                HarnessError::InfrastructureUnavailable(format!(
                    "docker run for {} returned no container id",
                    spec.name
                ))
            })
    }

    pub async fn stop(&self, id: &str, grace_secs: u32, cancel: &CancellationToken) -> Result<()> {
        self.run(&["stop", "-t", &grace_secs.to_string(), id], cancel)
            .await?;
        Ok(())
    }

    pub async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        self.run(&["start", id], cancel).await?;
        Ok(())
    }

    /// Force-remove a container together with its anonymous volumes
    pub async fn remove(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        match self.run(&["rm", "-f", "-v", id], cancel).await {
            Err(HarnessError::InfrastructureUnavailable(msg)) if is_missing(&msg) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Host port published for `container_port/tcp`
    pub async fn port(&self, id: &str, container_port: u16, cancel: &CancellationToken) -> Result<u16> {
        let out = self
            .run(&["port", id, &format!("{}/tcp", container_port)], cancel)
            .await?;
        parse_port_output(&out.stdout).ok_or_else(|| {
            HarnessError::InfrastructureUnavailable(format!(
                "No host port published for {}/tcp on {}",
                container_port, id
            ))
        })
    }

    /// Container logs (both streams), optionally only those after `since`
    pub async fn logs_since(
        &self,
        id: &str,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut args = vec!["logs".to_string()];
        if let Some(since) = since {
            args.push("--since".to_string());
            args.push(since.to_rfc3339_opts(SecondsFormat::Nanos, true));
        }
        args.push(id.to_string());
        let out = self.run(&args, cancel).await?;
        Ok(format!("{}\n{}", out.stdout, out.stderr))
    }

    pub async fn exec(&self, id: &str, command: &[&str], cancel: &CancellationToken) -> Result<CommandOutput> {
        let mut args = vec!["exec", id];
        args.extend_from_slice(command);
        self.run(&args, cancel).await
    }

    /// Value of `.State.Status` (`running`, `exited`, ...)
    pub async fn state(&self, id: &str, cancel: &CancellationToken) -> Result<String> {
        let out = self
            .run(&["inspect", "-f", "{{.State.Status}}", id], cancel)
            .await?;
        Ok(out.stdout)
    }

    /// Ids of every container, running or not, carrying `key=value`
    pub async fn containers_with_label(
        &self,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let filter = format!("label={}={}", key, value);
        let out = self
            .run(&["ps", "-a", "-q", "--filter", &filter], cancel)
            .await?;
        Ok(split_ids(&out.stdout))
    }

    /// Names of every network carrying `key=value`
    pub async fn networks_with_label(
        &self,
        key: &str,
        value: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let out = self.run(&network_ls_args(key, value), cancel).await?;
        Ok(split_ids(&out.stdout))
    }
}

// `-q` would override `--format` and yield ids
fn network_ls_args(key: &str, value: &str) -> Vec<String> {
    vec![
        "network".to_string(),
        "ls".to_string(),
        "--format".to_string(),
        "{{.Name}}".to_string(),
        "--filter".to_string(),
        format!("label={}={}", key, value),
    ]
}

/// Parse `docker port` output such as `0.0.0.0:49153\n[::]:49153`
pub fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn split_ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

fn is_missing(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such") || lower.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_output() {
        assert_eq!(parse_port_output("127.0.0.1:49153"), Some(49153));
        assert_eq!(parse_port_output("0.0.0.0:32768\n[::]:32768\n"), Some(32768));
        assert_eq!(parse_port_output(""), None);
        assert_eq!(parse_port_output("garbage"), None);
    }

    #[test]
    fn test_run_args_layout() {
        let spec = ContainerSpec::new("rh-abc-cache", "valkey/valkey:8-alpine", "rh-net")
            .alias("cache")
            .label(SESSION_LABEL, "abc")
            .env("A", "1")
            .port(PortBinding::fixed(6379, 36379))
            .port(PortBinding::ephemeral(8474))
            .command(["valkey-server", "--requirepass", "pw"]);

        let args = spec.run_args();
        assert_eq!(&args[..2], &["run", "-d"]);
        assert!(args.windows(2).any(|w| w == ["--network-alias", "cache"]));
        assert!(args.windows(2).any(|w| w == ["--label", "reporter-harness.session=abc"]));
        assert!(args.windows(2).any(|w| w == ["-p", "127.0.0.1:36379:6379"]));
        assert!(args.windows(2).any(|w| w == ["-p", "127.0.0.1::8474"]));

        let image_at = args.iter().position(|a| a == "valkey/valkey:8-alpine").unwrap();
        assert_eq!(&args[image_at + 1..], &["valkey-server", "--requirepass", "pw"]);
    }

    #[test]
    fn test_missing_resource_detection() {
        assert!(is_missing("Error: No such container: abc"));
        assert!(is_missing("network rh-x not found"));
        assert!(!is_missing("permission denied"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_infrastructure_error() {
        let docker = DockerCli::new("/nonexistent/docker-binary", Duration::from_secs(5));
        let err = docker
            .version(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::InfrastructureUnavailable(_)));
    }

    #[tokio::test]
    async fn test_missing_daemon_is_precondition() {
        let docker = DockerCli::new("/nonexistent/docker-binary", Duration::from_secs(5));
        let err = docker
            .ensure_daemon(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::PreconditionUnmet(_)));
    }

    #[test]
    fn test_network_listing_prints_names() {
        let args = network_ls_args(SESSION_LABEL, "abc");
        assert!(!args.iter().any(|a| a == "-q"));
        assert!(args.windows(2).any(|w| w == ["--format", "{{.Name}}"]));
        assert!(args.windows(2).any(|w| w == ["--filter", "label=reporter-harness.session=abc"]));
    }
}
