use crate::backend::{ContainerState, ImageQuery, StackRuntime, StackSpec};
use crate::RuntimeError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// In-memory runtime for tests and dry runs.
///
/// Images default to the `image:` lines of the stack file and are all found.
/// After `up`, containers report the configured snapshots in order (the last
/// one repeats), or a single healthy `app` container.
pub struct MockBackend {
    images: Option<Vec<String>>,
    image_results: HashMap<String, ImageQuery>,
    image_delay: Option<Duration>,
    snapshots: Mutex<VecDeque<Vec<ContainerState>>>,
    invalid_stack: Option<String>,
    up_error: Option<String>,
    running: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            images: None,
            image_results: HashMap::new(),
            image_delay: None,
            snapshots: Mutex::new(VecDeque::new()),
            invalid_stack: None,
            up_error: None,
            running: Mutex::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images = Some(images.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_image_result(mut self, image: impl Into<String>, result: ImageQuery) -> Self {
        self.image_results.insert(image.into(), result);
        self
    }

    /// Make every image query sleep first, to exercise probe timeouts.
    #[must_use]
    pub fn with_image_delay(mut self, delay: Duration) -> Self {
        self.image_delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_container_snapshots(mut self, snapshots: Vec<Vec<ContainerState>>) -> Self {
        self.snapshots = Mutex::new(snapshots.into());
        self
    }

    #[must_use]
    pub fn with_invalid_stack(mut self, message: impl Into<String>) -> Self {
        self.invalid_stack = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_failing_up(mut self, message: impl Into<String>) -> Self {
        self.up_error = Some(message.into());
        self
    }

    /// Operations performed so far, e.g. `up -d`, `down -v`, `query postgres:16`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn record(&self, call: impl Into<String>) -> Result<(), RuntimeError> {
        self.calls
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?
            .push(call.into());
        Ok(())
    }

    fn set_running(&self, value: bool) -> Result<(), RuntimeError> {
        *self
            .running
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))? = value;
        Ok(())
    }
}

pub fn container(service: &str, status: &str, health: Option<&str>) -> ContainerState {
    ContainerState {
        name: format!("mock-{service}-1"),
        service: service.to_owned(),
        status: status.to_owned(),
        health: health.map(str::to_owned),
        exit_code: None,
    }
}

/// A stopped container that exited with `code`.
pub fn exited(service: &str, code: i32) -> ContainerState {
    ContainerState {
        exit_code: Some(code),
        ..container(service, "exited", None)
    }
}

impl StackRuntime for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn validate(&self, spec: &StackSpec) -> Result<(), RuntimeError> {
        self.record("validate")?;
        if let Some(msg) = &self.invalid_stack {
            return Err(RuntimeError::StackInvalid(msg.clone()));
        }
        if !spec.stack_file.is_file() {
            return Err(RuntimeError::StackInvalid(format!(
                "stack file not found: {}",
                spec.stack_file.display()
            )));
        }
        Ok(())
    }

    fn images(&self, spec: &StackSpec) -> Result<Vec<String>, RuntimeError> {
        self.record("images")?;
        if let Some(images) = &self.images {
            return Ok(images.clone());
        }
        let text = std::fs::read_to_string(&spec.stack_file)?;
        let mut images: Vec<String> = Vec::new();
        for line in text.lines() {
            let Some(rest) = line.trim_start().strip_prefix("image:") else {
                continue;
            };
            let image = rest.trim().trim_matches(|c| c == '"' || c == '\'').to_owned();
            if !image.is_empty() && !images.contains(&image) {
                images.push(image);
            }
        }
        Ok(images)
    }

    fn query_image(&self, image: &str, timeout: Duration) -> ImageQuery {
        let _ = self.record(format!("query {image}"));
        if let Some(delay) = self.image_delay {
            if delay >= timeout {
                std::thread::sleep(timeout);
                return ImageQuery::TimedOut;
            }
            std::thread::sleep(delay);
        }
        self.image_results
            .get(image)
            .cloned()
            .unwrap_or(ImageQuery::Found)
    }

    fn down(&self, _spec: &StackSpec, remove_volumes: bool) -> Result<(), RuntimeError> {
        self.record(if remove_volumes { "down -v" } else { "down" })?;
        self.set_running(false)
    }

    fn prune_networks(&self) -> Result<(), RuntimeError> {
        self.record("prune-networks")
    }

    fn up(&self, _spec: &StackSpec, detach: bool) -> Result<(), RuntimeError> {
        self.record(if detach { "up -d" } else { "up" })?;
        if let Some(msg) = &self.up_error {
            return Err(RuntimeError::ExecFailed(msg.clone()));
        }
        self.set_running(true)
    }

    fn containers(&self, _spec: &StackSpec) -> Result<Vec<ContainerState>, RuntimeError> {
        self.record("containers")?;
        let running = *self
            .running
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;
        if !running {
            return Ok(Vec::new());
        }
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))?;
        let snapshot = if snapshots.len() > 1 {
            snapshots.pop_front()
        } else {
            snapshots.front().cloned()
        };
        Ok(snapshot.unwrap_or_else(|| vec![container("app", "running", Some("healthy"))]))
    }

    fn logs(&self, _spec: &StackSpec, tail: usize) -> Result<String, RuntimeError> {
        self.record(format!("logs {tail}"))?;
        Ok("mock-app-1  | ready\n".to_owned())
    }
}
