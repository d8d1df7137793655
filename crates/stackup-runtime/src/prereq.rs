use std::fmt;
use std::process::{Command, Stdio};

/// A missing prerequisite with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

/// Check what the `compose` backend needs.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_compose_prereqs() -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !succeeds("docker", &["--version"]) {
        missing.push(MissingPrereq {
            name: "docker",
            purpose: "container runtime client",
            install_hint: "https://docs.docker.com/engine/install/",
        });
        return missing;
    }

    if !succeeds("docker", &["compose", "version"]) {
        missing.push(MissingPrereq {
            name: "docker compose",
            purpose: "multi-service stack definitions",
            install_hint: "apt install docker-compose-plugin | dnf install docker-compose-plugin",
        });
    }

    if !succeeds("docker", &["info"]) {
        missing.push(MissingPrereq {
            name: "docker daemon",
            purpose: "running containers (daemon unreachable or permission denied)",
            install_hint: "systemctl start docker, or add your user to the docker group",
        });
    }

    if !succeeds("sh", &["-c", "true"]) {
        missing.push(MissingPrereq {
            name: "sh",
            purpose: "command substitution and hook scripts",
            install_hint: "a POSIX shell at /bin/sh",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nstackup needs these tools to validate and launch stacks.");
    msg
}
