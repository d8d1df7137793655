use crate::backend::{ContainerState, ImageQuery, StackRuntime, StackSpec};
use crate::command::{run_with_timeout, CommandOutcome};
use crate::RuntimeError;
use std::process::{Command, Output, Stdio};
use std::time::Duration;
use tracing::debug;

const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Drives the `docker compose` CLI plugin.
pub struct ComposeBackend {
    docker: String,
}

impl Default for ComposeBackend {
    fn default() -> Self {
        Self {
            docker: "docker".to_owned(),
        }
    }
}

impl ComposeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn with_client(docker: impl Into<String>) -> Self {
        Self {
            docker: docker.into(),
        }
    }

    fn compose(&self, spec: &StackSpec) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.arg("compose")
            .arg("--project-directory")
            .arg(&spec.project_dir)
            .arg("-f")
            .arg(&spec.stack_file);
        if let Some(env_file) = &spec.env_file {
            cmd.arg("--env-file").arg(env_file);
        }
        cmd.current_dir(&spec.project_dir);
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    fn checked(&self, mut cmd: Command, what: &str) -> Result<Output, RuntimeError> {
        debug!("running {} {what}", self.docker);
        let output = cmd
            .output()
            .map_err(|e| RuntimeError::ExecFailed(format!("{} {what}: {e}", self.docker)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RuntimeError::ExecFailed(format!(
                "{} {what} failed: {}",
                self.docker,
                stderr.trim()
            )));
        }
        Ok(output)
    }
}

impl StackRuntime for ComposeBackend {
    fn name(&self) -> &'static str {
        "compose"
    }

    fn available(&self) -> bool {
        Command::new(&self.docker)
            .args(["compose", "version"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    fn validate(&self, spec: &StackSpec) -> Result<(), RuntimeError> {
        let mut cmd = self.compose(spec);
        cmd.args(["config", "--quiet"]);
        let output = cmd.output()?;
        if output.status.success() {
            return Ok(());
        }
        Err(RuntimeError::StackInvalid(
            String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        ))
    }

    fn images(&self, spec: &StackSpec) -> Result<Vec<String>, RuntimeError> {
        let mut cmd = self.compose(spec);
        cmd.args(["config", "--images"]);
        let output = self.checked(cmd, "compose config --images")?;
        Ok(parse_image_list(&String::from_utf8_lossy(&output.stdout)))
    }

    fn query_image(&self, image: &str, timeout: Duration) -> ImageQuery {
        let mut cmd = Command::new(&self.docker);
        cmd.args(["manifest", "inspect", image]);
        match run_with_timeout(&mut cmd, timeout, None) {
            Ok(CommandOutcome::TimedOut { .. }) => ImageQuery::TimedOut,
            Ok(out) if out.success() => ImageQuery::Found,
            Ok(out) => ImageQuery::Failed {
                detail: out.diagnostic(),
            },
            Err(e) => ImageQuery::Failed {
                detail: format!("failed to run {} manifest inspect: {e}", self.docker),
            },
        }
    }

    fn down(&self, spec: &StackSpec, remove_volumes: bool) -> Result<(), RuntimeError> {
        let mut cmd = self.compose(spec);
        cmd.args(["down", "--remove-orphans"]);
        if remove_volumes {
            cmd.arg("-v");
        }
        self.checked(cmd, "compose down").map(drop)
    }

    fn prune_networks(&self) -> Result<(), RuntimeError> {
        let mut cmd = Command::new(&self.docker);
        cmd.args(["network", "prune", "-f"]);
        self.checked(cmd, "network prune").map(drop)
    }

    fn up(&self, spec: &StackSpec, detach: bool) -> Result<(), RuntimeError> {
        let mut cmd = self.compose(spec);
        cmd.arg("up");
        if detach {
            cmd.arg("-d");
            return self.checked(cmd, "compose up -d").map(drop);
        }
        // Foreground: the operator's terminal is attached to the stack.
        let status = cmd
            .status()
            .map_err(|e| RuntimeError::ExecFailed(format!("{} compose up: {e}", self.docker)))?;
        if status.success() {
            Ok(())
        } else {
            Err(RuntimeError::ExecFailed(format!(
                "{} compose up exited with {status}",
                self.docker
            )))
        }
    }

    fn containers(&self, spec: &StackSpec) -> Result<Vec<ContainerState>, RuntimeError> {
        let mut cmd = self.compose(spec);
        cmd.args(["ps", "--all", "--quiet"]);
        let output = self.checked(cmd, "compose ps")?;
        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let format = format!(
            "{{{{.Name}}}}|{{{{.State.Status}}}}|{{{{if .State.Health}}}}{{{{.State.Health.Status}}}}{{{{end}}}}|{{{{index .Config.Labels \"{SERVICE_LABEL}\"}}}}|{{{{.State.ExitCode}}}}"
        );
        let mut cmd = Command::new(&self.docker);
        cmd.args(["inspect", "--format", &format]).args(&ids);
        let output = self.checked(cmd, "inspect")?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(parse_inspect_line)
            .collect())
    }

    fn logs(&self, spec: &StackSpec, tail: usize) -> Result<String, RuntimeError> {
        let mut cmd = self.compose(spec);
        cmd.args(["logs", "--no-color", "--tail", &tail.to_string()]);
        let output = self.checked(cmd, "compose logs")?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

fn parse_image_list(stdout: &str) -> Vec<String> {
    let mut images: Vec<String> = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !images.iter().any(|i| i == line) {
            images.push(line.to_owned());
        }
    }
    images
}

fn parse_inspect_line(line: &str) -> Option<ContainerState> {
    let mut parts = line.trim().splitn(5, '|');
    let name = parts.next()?.trim_start_matches('/').to_owned();
    if name.is_empty() {
        return None;
    }
    let status = parts.next()?.to_owned();
    let health = parts
        .next()
        .filter(|h| !h.is_empty())
        .map(str::to_owned);
    let service = parts
        .next()
        .filter(|s| !s.is_empty() && *s != "<no value>")
        .map_or_else(|| name.clone(), str::to_owned);
    let exit_code = match status.as_str() {
        "exited" | "dead" => parts.next().and_then(|c| c.trim().parse().ok()),
        _ => None,
    };
    Some(ContainerState {
        name,
        service,
        status,
        health,
        exit_code,
    })
}
