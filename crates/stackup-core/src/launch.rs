use crate::CoreError;
use serde::Serialize;
use stackup_runtime::{ContainerState, StackRuntime, StackSpec};
use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const FAILURE_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    /// Start detached and return.
    Detached,
    /// Block on the runtime until the stack exits.
    Foreground,
    /// Start detached, then poll container health until a verdict.
    Health,
}

impl LaunchMode {
    pub fn detaches(self) -> bool {
        !matches!(self, Self::Foreground)
    }
}

impl FromStr for LaunchMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detached" | "detach" => Ok(Self::Detached),
            "foreground" | "fg" => Ok(Self::Foreground),
            "health" | "wait" | "abort-on-failure" | "abort" => Ok(Self::Health),
            other => Err(CoreError::Config(format!(
                "unknown launch mode '{other}' (expected detached, foreground or health)"
            ))),
        }
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Detached => "detached",
            Self::Foreground => "foreground",
            Self::Health => "health",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchOutcome {
    pub mode: LaunchMode,
    pub containers: Vec<ContainerState>,
    pub polls: u32,
}

/// Health verdict over one snapshot of the stack's containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ready,
    Pending(Vec<String>),
    Failed(Vec<String>),
}

/// A container that exited with code 0 is a finished one-shot job and counts
/// as ready; any other exit is a failure.
pub fn evaluate(containers: &[ContainerState]) -> Verdict {
    let mut pending = Vec::new();
    let mut failed = Vec::new();

    for c in containers {
        let label = format!("{} ({})", c.service, c.health.as_deref().unwrap_or(&c.status));
        match (c.status.as_str(), c.health.as_deref()) {
            ("exited", _) if c.exit_code == Some(0) => {}
            ("exited" | "dead", _) | (_, Some("unhealthy")) => failed.push(label),
            (_, Some("healthy")) | ("running", None) => {}
            _ => pending.push(label),
        }
    }

    if !failed.is_empty() {
        Verdict::Failed(failed)
    } else if !pending.is_empty() {
        Verdict::Pending(pending)
    } else {
        Verdict::Ready
    }
}

/// Start the stack in `mode`. Foreground mode returns once the stack exits.
pub fn start(runtime: &dyn StackRuntime, spec: &StackSpec, mode: LaunchMode) -> Result<(), CoreError> {
    info!("starting stack ({mode})");
    runtime
        .up(spec, mode.detaches())
        .map_err(|e| CoreError::Launch(e.to_string()))
}

/// Poll container health every `interval` until every container is ready,
/// one fails, or `timeout` elapses.
pub fn poll_health(
    runtime: &dyn StackRuntime,
    spec: &StackSpec,
    interval: Duration,
    timeout: Duration,
) -> Result<LaunchOutcome, CoreError> {
    let deadline = Instant::now() + timeout;
    let mut polls = 0u32;

    loop {
        polls += 1;
        let containers = runtime
            .containers(spec)
            .map_err(|e| CoreError::Launch(format!("cannot read container state: {e}")))?;

        if containers.is_empty() {
            warn!("stack reports no containers; nothing to wait for");
            return Ok(LaunchOutcome {
                mode: LaunchMode::Health,
                containers,
                polls,
            });
        }

        match evaluate(&containers) {
            Verdict::Ready => {
                info!("all {} containers ready after {polls} polls", containers.len());
                return Ok(LaunchOutcome {
                    mode: LaunchMode::Health,
                    containers,
                    polls,
                });
            }
            Verdict::Failed(names) => {
                dump_logs(runtime, spec);
                return Err(CoreError::Launch(format!(
                    "containers failed: {}",
                    names.join(", ")
                )));
            }
            Verdict::Pending(names) => {
                let now = Instant::now();
                if now >= deadline {
                    dump_logs(runtime, spec);
                    return Err(CoreError::Launch(format!(
                        "timed out after {}s waiting for: {}",
                        timeout.as_secs(),
                        names.join(", ")
                    )));
                }
                debug!("waiting for {}", names.join(", "));
                thread::sleep(interval.min(deadline - now));
            }
        }
    }
}

fn dump_logs(runtime: &dyn StackRuntime, spec: &StackSpec) {
    match runtime.logs(spec, FAILURE_LOG_LINES) {
        Ok(logs) if !logs.trim().is_empty() => {
            warn!("last {FAILURE_LOG_LINES} log lines:\n{}", logs.trim_end());
        }
        Ok(_) => {}
        Err(e) => warn!("could not collect stack logs: {e}"),
    }
}
