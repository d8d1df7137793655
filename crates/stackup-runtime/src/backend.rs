use crate::RuntimeError;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Everything a backend needs to address one stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSpec {
    pub project_dir: PathBuf,
    pub stack_file: PathBuf,
    /// Env file handed to the runtime for interpolation, if one was written.
    pub env_file: Option<PathBuf>,
    /// Variables overlaid on the process environment of runtime invocations.
    pub env: Vec<(String, String)>,
}

/// Outcome of asking a registry whether an image manifest exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageQuery {
    Found,
    Failed { detail: String },
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerState {
    pub name: String,
    pub service: String,
    /// Runtime state, e.g. `running`, `exited`, `dead`.
    pub status: String,
    /// Health status when the container defines a health check.
    pub health: Option<String>,
    /// Exit code of a stopped container.
    pub exit_code: Option<i32>,
}

pub trait StackRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Check that the stack definition is valid after interpolation.
    fn validate(&self, spec: &StackSpec) -> Result<(), RuntimeError>;

    /// Distinct image references used by the resolved stack definition.
    fn images(&self, spec: &StackSpec) -> Result<Vec<String>, RuntimeError>;

    fn query_image(&self, image: &str, timeout: Duration) -> ImageQuery;

    fn down(&self, spec: &StackSpec, remove_volumes: bool) -> Result<(), RuntimeError>;

    fn prune_networks(&self) -> Result<(), RuntimeError>;

    /// Start the stack. With `detach = false` this blocks until the stack exits.
    fn up(&self, spec: &StackSpec, detach: bool) -> Result<(), RuntimeError>;

    fn containers(&self, spec: &StackSpec) -> Result<Vec<ContainerState>, RuntimeError>;

    fn logs(&self, spec: &StackSpec, tail: usize) -> Result<String, RuntimeError>;
}

pub fn select_backend(name: &str) -> Result<Box<dyn StackRuntime>, RuntimeError> {
    match name {
        "compose" => Ok(Box::new(crate::compose::ComposeBackend::new())),
        "mock" => Ok(Box::new(crate::mock::MockBackend::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
