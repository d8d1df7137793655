use crate::CoreError;
use serde::Serialize;
use stackup_runtime::{is_hostdir_key, StackRuntime, StackSpec};
use stackup_schema::Environment;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetAction {
    RemoveContainers,
    RemoveNamedVolumes,
    RemoveNetworks,
    RemoveHostdirs,
    RemovePersistedEnvironment,
}

impl ResetAction {
    fn from_name(name: &str) -> Option<Vec<Self>> {
        Some(match name {
            "containers" | "remove-containers" => vec![Self::RemoveContainers],
            "named-volumes" | "volumes" | "remove-named-volumes" => vec![Self::RemoveNamedVolumes],
            "networks" | "remove-networks" => vec![Self::RemoveNetworks],
            "hostdirs" | "remove-hostdirs" => vec![Self::RemoveHostdirs],
            "env-file" | "env-active" | "remove-persisted-environment" => {
                vec![Self::RemovePersistedEnvironment]
            }
            "all" => vec![
                Self::RemoveContainers,
                Self::RemoveNamedVolumes,
                Self::RemoveHostdirs,
            ],
            "none" => Vec::new(),
            _ => return None,
        })
    }

    /// Parse action lists such as `"containers,hostdirs"` or `"all env-file"`.
    /// Unknown names are returned separately. The result is sorted and unique.
    pub fn parse_list<S: AsRef<str>>(sources: &[S]) -> (Vec<Self>, Vec<String>) {
        let mut actions = Vec::new();
        let mut unknown = Vec::new();
        for source in sources {
            for name in source
                .as_ref()
                .split(|c: char| c == ',' || c.is_whitespace())
                .map(str::trim)
                .filter(|n| !n.is_empty())
            {
                match Self::from_name(&name.to_ascii_lowercase()) {
                    Some(found) => actions.extend(found),
                    None => unknown.push(name.to_owned()),
                }
            }
        }
        actions.sort_unstable();
        actions.dedup();
        (actions, unknown)
    }
}

impl fmt::Display for ResetAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RemoveContainers => "remove-containers",
            Self::RemoveNamedVolumes => "remove-named-volumes",
            Self::RemoveNetworks => "remove-networks",
            Self::RemoveHostdirs => "remove-hostdirs",
            Self::RemovePersistedEnvironment => "remove-persisted-environment",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub performed: Vec<ResetAction>,
    pub removed_dirs: Vec<PathBuf>,
    pub warnings: Vec<String>,
    /// The env file was deleted; the pipeline must start over.
    pub restart: bool,
}

impl ResetOutcome {
    fn warn(&mut self, msg: String) {
        warn!("{msg}");
        self.warnings.push(msg);
    }
}

/// Carry out `actions`. Runtime teardown failures are warnings; failing to
/// delete the env file is fatal.
pub fn perform(
    actions: &[ResetAction],
    runtime: &dyn StackRuntime,
    spec: &StackSpec,
    env: &Environment,
    env_file: &Path,
) -> Result<ResetOutcome, CoreError> {
    let mut out = ResetOutcome::default();

    let volumes = actions.contains(&ResetAction::RemoveNamedVolumes);
    if actions.contains(&ResetAction::RemoveContainers) || volumes {
        info!("removing containers{}", if volumes { " and named volumes" } else { "" });
        if let Err(e) = runtime.down(spec, volumes) {
            out.warn(format!("stack teardown failed: {e}"));
        }
        if actions.contains(&ResetAction::RemoveContainers) {
            out.performed.push(ResetAction::RemoveContainers);
        }
        if volumes {
            out.performed.push(ResetAction::RemoveNamedVolumes);
        }
    }

    if actions.contains(&ResetAction::RemoveNetworks) {
        info!("pruning unused networks");
        if let Err(e) = runtime.prune_networks() {
            out.warn(format!("network prune failed: {e}"));
        }
        out.performed.push(ResetAction::RemoveNetworks);
    }

    if actions.contains(&ResetAction::RemoveHostdirs) {
        for entry in env.iter().filter(|e| is_hostdir_key(&e.key) && !e.value.is_empty()) {
            let path = resolve(&spec.project_dir, &entry.value);
            if path.parent().is_none() {
                out.warn(format!("{}: refusing to remove {}", entry.key, path.display()));
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!("removed {}", path.display());
                    out.removed_dirs.push(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => out.warn(format!("cannot remove {}: {e}", path.display())),
            }
        }
        out.performed.push(ResetAction::RemoveHostdirs);
    }

    if actions.contains(&ResetAction::RemovePersistedEnvironment) {
        match std::fs::remove_file(env_file) {
            Ok(()) => info!("removed {}; restarting from the manifest", env_file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CoreError::Io(e)),
        }
        out.performed.push(ResetAction::RemovePersistedEnvironment);
        out.restart = true;
    }

    Ok(out)
}

pub(crate) fn resolve(base: &Path, value: &str) -> PathBuf {
    let p = Path::new(value);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
