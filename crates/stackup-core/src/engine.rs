use crate::concurrency::StackLock;
use crate::expand::expand_environment;
use crate::hooks::{run_hook, HookReport, HookSlot};
use crate::launch::{self, LaunchMode, LaunchOutcome};
use crate::lifecycle::{validate_transition, PipelineState};
use crate::probe::{probe_images, ProbeOptions, ProbeReport};
use crate::references::{reconcile, ReconcileReport};
use crate::reset::{self, ResetAction, ResetOutcome};
use crate::secrets::{carry_over, synthesize, NoPrompt, Prompter};
use crate::settings::{Overrides, Settings};
use crate::CoreError;
use serde::Serialize;
use stackup_runtime::{
    current_gid, current_uid, is_hostdir_key, reconcile_dir, select_backend, DirReport,
    HostDirSpec, RuntimeError, StackRuntime, StackSpec,
};
use stackup_schema::{
    parse_manifest_file, render_env_file, write_env_file, Environment, ManifestLine,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a run should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Plan {
    /// Every stage through launch.
    Up,
    /// Synthesize, expand and write the output env file.
    Env,
    /// Validate references and probe images without touching anything.
    Check,
}

/// Notified on every pipeline transition, e.g. to drive a progress spinner.
pub trait StageObserver {
    fn stage(&mut self, state: PipelineState);

    /// Called right before a foreground launch takes over the terminal.
    fn before_foreground(&mut self) {}
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan: Plan,
    pub final_state: PipelineState,
    pub started_at: String,
    pub finished_at: String,
    pub env_file: PathBuf,
    pub env_file_written: bool,
    pub generated: Vec<String>,
    pub prompted: Vec<String>,
    pub inherited: Vec<String>,
    pub deferred: Vec<String>,
    pub expanded: Vec<String>,
    pub restarts: u32,
    pub reset: Option<ResetOutcome>,
    pub dirs: Vec<DirReport>,
    pub hooks: Vec<HookReport>,
    pub references: Option<ReconcileReport>,
    pub probe: Option<ProbeReport>,
    pub launch: Option<LaunchOutcome>,
    pub warnings: Vec<String>,
}

impl RunReport {
    fn new(plan: Plan, env_file: PathBuf) -> Self {
        Self {
            plan,
            final_state: PipelineState::Init,
            started_at: chrono::Utc::now().to_rfc3339(),
            finished_at: String::new(),
            env_file,
            env_file_written: false,
            generated: Vec::new(),
            prompted: Vec::new(),
            inherited: Vec::new(),
            deferred: Vec::new(),
            expanded: Vec::new(),
            restarts: 0,
            reset: None,
            dirs: Vec::new(),
            hooks: Vec::new(),
            references: None,
            probe: None,
            launch: None,
            warnings: Vec::new(),
        }
    }

    /// Forget per-pass results before a restart; keep counters and warnings.
    fn clear_pass(&mut self) {
        self.generated.clear();
        self.prompted.clear();
        self.inherited.clear();
        self.deferred.clear();
        self.expanded.clear();
    }
}

/// Drives one invocation through the pipeline:
/// load, expand, reset, directories, hooks, references, images, launch.
pub struct Engine {
    stack_dir: PathBuf,
    overrides: Overrides,
    runtime: Option<Arc<dyn StackRuntime>>,
    process_env: BTreeMap<String, String>,
    prompter: Box<dyn Prompter>,
    observer: Option<Box<dyn StageObserver>>,
    state: PipelineState,
}

/// Output-file state carried between stages.
struct Loaded {
    lines: Vec<ManifestLine>,
    env: Environment,
    /// What the output file holds (or will hold once written).
    persisted: Environment,
    settings: Settings,
}

impl Engine {
    pub fn new(stack_dir: impl Into<PathBuf>) -> Self {
        Self {
            stack_dir: stack_dir.into(),
            overrides: Overrides::default(),
            runtime: None,
            process_env: std::env::vars().collect(),
            prompter: Box::new(NoPrompt),
            observer: None,
            state: PipelineState::Init,
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Use `runtime` instead of the backend named in the settings.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Arc<dyn StackRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    #[must_use]
    pub fn with_process_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.process_env = env;
        self
    }

    #[must_use]
    pub fn with_prompter(mut self, prompter: Box<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Box<dyn StageObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Settings as they resolve before the manifest is read.
    pub fn settings(&self) -> Result<Settings, CoreError> {
        self.resolve_settings(None)
    }

    fn resolve_settings(&self, env: Option<&Environment>) -> Result<Settings, CoreError> {
        Settings::resolve_with(&self.stack_dir, env, &self.overrides, &|name| {
            self.process_env.get(name).cloned()
        })
    }

    fn advance(&mut self, to: PipelineState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        debug!("pipeline: {} -> {to}", self.state);
        self.state = to;
        if let Some(o) = self.observer.as_mut() {
            o.stage(to);
        }
        Ok(())
    }

    fn select_runtime(&self, backend: &str) -> Result<Arc<dyn StackRuntime>, CoreError> {
        if let Some(rt) = &self.runtime {
            return Ok(Arc::clone(rt));
        }
        Ok(Arc::from(select_backend(backend)?))
    }

    pub fn run(&mut self, plan: Plan) -> Result<RunReport, CoreError> {
        self.state = PipelineState::Init;
        let initial = self.resolve_settings(None)?;
        let mut report = RunReport::new(plan, initial.env_file.clone());

        let result = self.run_pipeline(plan, &initial, &mut report);
        report.finished_at = chrono::Utc::now().to_rfc3339();
        match result {
            Ok(()) => {
                report.final_state = self.state;
                info!("{plan:?} finished with {} warnings", report.warnings.len());
                Ok(report)
            }
            Err(e) => {
                debug!("pipeline failed in {}: {e}", self.state);
                if !self.state.is_terminal() {
                    self.advance(PipelineState::Failed)?;
                }
                Err(e)
            }
        }
    }

    fn run_pipeline(
        &mut self,
        plan: Plan,
        initial: &Settings,
        report: &mut RunReport,
    ) -> Result<(), CoreError> {
        let _lock = match plan {
            Plan::Check => None,
            Plan::Up | Plan::Env => Some(StackLock::acquire_or_fail(&initial.lock_path())?),
        };
        let runtime = self.select_runtime(&initial.backend)?;
        if plan != Plan::Env && !runtime.available() {
            return Err(RuntimeError::BackendUnavailable(runtime.name().to_owned()).into());
        }

        let mut reset_done = false;
        let mut loaded = loop {
            let mut loaded = self.load(initial, report)?;
            self.expand(plan, &mut loaded, report)?;

            if plan != Plan::Up {
                break loaded;
            }
            self.advance(PipelineState::Reset)?;
            if reset_done || loaded.settings.reset_actions.is_empty() {
                break loaded;
            }
            reset_done = true;
            let (actions, unknown) = ResetAction::parse_list(&loaded.settings.reset_actions);
            for name in unknown {
                let msg = format!("unknown reset action '{name}' ignored");
                warn!("{msg}");
                report.warnings.push(msg);
            }
            if actions.is_empty() {
                break loaded;
            }
            info!("resetting: {}", join(&actions));
            let spec = stack_spec(&loaded.settings, &loaded.env, report.env_file_written);
            let outcome = reset::perform(
                &actions,
                runtime.as_ref(),
                &spec,
                &loaded.env,
                &loaded.settings.env_file,
            )?;
            report.warnings.extend(outcome.warnings.iter().cloned());
            let restart = outcome.restart;
            report.reset = Some(outcome);
            if !restart {
                break loaded;
            }
            report.restarts += 1;
            report.env_file_written = false;
            report.clear_pass();
            self.advance(PipelineState::Init)?;
        };

        match plan {
            Plan::Env => return self.advance(PipelineState::Done),
            Plan::Check => {}
            Plan::Up => {
                self.reconcile_dirs(&loaded, report)?;
                self.advance(PipelineState::RunHook)?;
                if let Some(hook) = loaded.settings.pre_launch_hook.clone() {
                    self.run_slot_hook(HookSlot::PreLaunch, &hook, &mut loaded, report)?;
                }
            }
        }

        let spec = stack_spec(&loaded.settings, &loaded.env, report.env_file_written);
        self.validate_references(runtime.as_ref(), &spec, &loaded, report)?;

        if loaded.settings.image_check {
            self.advance(PipelineState::ProbeImages)?;
            let images = runtime.images(&spec)?;
            let opts = ProbeOptions {
                workers: loaded.settings.probe_workers,
                probe_timeout: loaded.settings.probe_timeout,
                join_timeout: loaded.settings.join_timeout,
                continue_on_error: loaded.settings.continue_on_image_error,
                check_updates: loaded.settings.check_updates,
            };
            let probe = probe_images(runtime.as_ref(), &images, &opts);
            report.warnings.extend(probe.warnings.iter().cloned());
            report.probe = Some(probe.clone());
            probe.into_result()?;
        } else {
            info!("image check disabled");
        }

        if plan == Plan::Check {
            return self.advance(PipelineState::Done);
        }

        self.launch(runtime.as_ref(), &spec, &mut loaded, report)?;
        self.advance(PipelineState::Done)
    }

    /// Load or generate: read the manifest, seed from the previous output,
    /// synthesize secrets.
    fn load(&mut self, initial: &Settings, report: &mut RunReport) -> Result<Loaded, CoreError> {
        self.advance(PipelineState::LoadOrGenerateEnv)?;

        let manifest_path = if !initial.manifest.exists() && initial.env_file.exists() {
            warn!(
                "{} not found; using {} as the manifest",
                initial.manifest.display(),
                initial.env_file.display()
            );
            initial.env_file.clone()
        } else {
            initial.manifest.clone()
        };
        info!("loading {}", manifest_path.display());
        let mut lines = parse_manifest_file(&manifest_path)?;

        let previous_lines = if initial.env_file.exists() && initial.env_file != manifest_path {
            parse_manifest_file(&initial.env_file)?
        } else {
            Vec::new()
        };
        for key in carry_over(&mut lines, &previous_lines) {
            debug!("{key} kept from {}", initial.env_file.display());
        }
        let previous: HashMap<String, String> = previous_lines
            .iter()
            .filter_map(ManifestLine::assignment)
            .map(|a| (a.key.clone(), a.value()))
            .collect();

        let synth = synthesize(
            &lines,
            &previous,
            &self.process_env,
            self.prompter.as_mut(),
            initial.interactive,
        )?;
        report.generated.extend(synth.generated);
        report.prompted.extend(synth.prompted);
        report.inherited.extend(synth.inherited);
        report.deferred.extend(synth.deferred);
        report.warnings.extend(synth.warnings);

        let settings = self.resolve_settings(Some(&synth.env))?;
        Ok(Loaded {
            lines,
            persisted: synth.env.clone(),
            env: synth.env,
            settings,
        })
    }

    /// Expand values, then write the output file unless this is a check.
    fn expand(&mut self, plan: Plan, loaded: &mut Loaded, report: &mut RunReport) -> Result<(), CoreError> {
        self.advance(PipelineState::Expand)?;
        if loaded.settings.expansion_enabled {
            let expansion = expand_environment(
                &mut loaded.env,
                &self.process_env,
                &loaded.settings.stack_dir,
                loaded.settings.command_timeout,
            );
            report.expanded.extend(expansion.expanded);
            report.warnings.extend(expansion.warnings);
        } else {
            debug!("expansion disabled");
        }
        loaded.persisted = loaded.env.clone();

        if plan != Plan::Check {
            let written = write_env_file(
                &loaded.settings.env_file,
                &render_env_file(&loaded.lines, &loaded.persisted),
            )?;
            if written {
                info!("wrote {}", loaded.settings.env_file.display());
            }
            report.env_file_written = true;
        }
        Ok(())
    }

    fn reconcile_dirs(&mut self, loaded: &Loaded, report: &mut RunReport) -> Result<(), CoreError> {
        self.advance(PipelineState::ReconcileDirs)?;
        let uid = loaded.settings.owner_uid.unwrap_or_else(current_uid);
        let gid = loaded.settings.owner_gid.unwrap_or_else(current_gid);

        for entry in loaded.env.iter().filter(|e| is_hostdir_key(&e.key) && !e.value.is_empty()) {
            let path = reset::resolve(&loaded.settings.stack_dir, &entry.value);
            let spec = HostDirSpec::new(entry.key.as_str(), path, uid, gid);
            let dir = reconcile_dir(&spec).map_err(|e| match e {
                RuntimeError::HostDir { path, reason } => {
                    CoreError::DirectoryReconciliation { path, reason }
                }
                other => CoreError::Runtime(other),
            })?;
            report.warnings.extend(dir.warnings.iter().cloned());
            report.dirs.push(dir);
        }
        Ok(())
    }

    fn run_slot_hook(
        &mut self,
        slot: HookSlot,
        hook: &Path,
        loaded: &mut Loaded,
        report: &mut RunReport,
    ) -> Result<(), CoreError> {
        let config = serde_json::to_value(&loaded.settings)
            .map_err(|e| CoreError::Config(format!("cannot encode settings for hook: {e}")))?;
        let mut hr = run_hook(
            slot,
            hook,
            &loaded.env,
            &config,
            &loaded.settings.stack_dir,
            loaded.settings.hook_timeout,
        )?;
        hr.apply(&mut loaded.env);
        if hr.persist_env(&mut loaded.lines, &mut loaded.persisted) {
            write_env_file(
                &loaded.settings.env_file,
                &render_env_file(&loaded.lines, &loaded.persisted),
            )?;
            info!("persisted hook values to {}", loaded.settings.env_file.display());
        }
        hr.persist_toml(&loaded.settings.hook_state_path())?;
        report.warnings.extend(hr.warnings.iter().cloned());
        report.hooks.push(hr);
        Ok(())
    }

    fn validate_references(
        &mut self,
        runtime: &dyn StackRuntime,
        spec: &StackSpec,
        loaded: &Loaded,
        report: &mut RunReport,
    ) -> Result<(), CoreError> {
        self.advance(PipelineState::ValidateReferences)?;
        runtime.validate(spec).map_err(|e| match e {
            RuntimeError::StackInvalid(msg) => CoreError::InvalidStack(msg),
            other => CoreError::Runtime(other),
        })?;

        let text = std::fs::read_to_string(&loaded.settings.stack_file)?;
        let refs = stackup_schema::ReferenceSet::parse(&text);
        let rec = reconcile(&loaded.env, &refs);
        report.warnings.extend(rec.warnings());
        report.references = Some(rec.clone());
        rec.into_result()?;
        Ok(())
    }

    fn launch(
        &mut self,
        runtime: &dyn StackRuntime,
        spec: &StackSpec,
        loaded: &mut Loaded,
        report: &mut RunReport,
    ) -> Result<(), CoreError> {
        let mode = loaded.settings.launch_mode;
        self.advance(PipelineState::Launch)?;
        if mode == LaunchMode::Foreground {
            if let Some(o) = self.observer.as_mut() {
                o.before_foreground();
            }
        }
        launch::start(runtime, spec, mode)?;

        let outcome = if mode == LaunchMode::Health {
            self.advance(PipelineState::PollHealth)?;
            launch::poll_health(
                runtime,
                spec,
                loaded.settings.health_interval,
                loaded.settings.health_timeout,
            )?
        } else {
            LaunchOutcome {
                mode,
                containers: Vec::new(),
                polls: 0,
            }
        };
        report.launch = Some(outcome);

        self.advance(PipelineState::PostLaunchHook)?;
        if let Some(hook) = loaded.settings.post_launch_hook.clone() {
            self.run_slot_hook(HookSlot::PostLaunch, &hook, loaded, report)?;
        }
        Ok(())
    }
}

fn stack_spec(settings: &Settings, env: &Environment, env_file_written: bool) -> StackSpec {
    StackSpec {
        project_dir: settings.stack_dir.clone(),
        stack_file: settings.stack_file.clone(),
        env_file: env_file_written.then(|| settings.env_file.clone()),
        env: env
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect(),
    }
}

fn join(actions: &[ResetAction]) -> String {
    actions
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use stackup_runtime::mock::MockBackend;
    use std::sync::Mutex;

    struct Recorder(Arc<Mutex<Vec<PipelineState>>>);

    impl StageObserver for Recorder {
        fn stage(&mut self, state: PipelineState) {
            self.0.lock().unwrap().push(state);
        }
    }

    fn stack_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env.sample"), "# db\nDB_PASSWORD=\nDB_NAME=app\n").unwrap();
        std::fs::write(
            dir.path().join("docker-compose.yml"),
            "services:\n  db:\n    image: postgres:16\n    environment:\n      - POSTGRES_PASSWORD=${DB_PASSWORD}\n      - POSTGRES_DB=${DB_NAME}\n",
        )
        .unwrap();
        dir
    }

    fn engine(dir: &Path, mock: Arc<MockBackend>) -> Engine {
        Engine::new(dir)
            .with_runtime(mock)
            .with_process_env(BTreeMap::new())
    }

    #[test]
    fn up_walks_every_stage() {
        let dir = stack_dir();
        let states = Arc::new(Mutex::new(Vec::new()));
        let mock = Arc::new(MockBackend::new());
        let mut e = engine(dir.path(), Arc::clone(&mock))
            .with_observer(Box::new(Recorder(Arc::clone(&states))));

        let report = e.run(Plan::Up).unwrap();
        assert_eq!(report.final_state, PipelineState::Done);
        assert_eq!(report.generated, vec!["DB_PASSWORD"]);
        assert!(report.env_file_written);

        use PipelineState::{
            Done, Expand, Launch, LoadOrGenerateEnv, PollHealth, PostLaunchHook, ProbeImages,
            ReconcileDirs, Reset, RunHook, ValidateReferences,
        };
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                LoadOrGenerateEnv,
                Expand,
                Reset,
                ReconcileDirs,
                RunHook,
                ValidateReferences,
                ProbeImages,
                Launch,
                PollHealth,
                PostLaunchHook,
                Done,
            ]
        );
        assert!(mock.calls().contains(&"up -d".to_owned()));
    }

    #[test]
    fn check_has_no_side_effects() {
        let dir = stack_dir();
        let mock = Arc::new(MockBackend::new());
        let report = engine(dir.path(), Arc::clone(&mock)).run(Plan::Check).unwrap();
        assert!(!report.env_file_written);
        assert!(!dir.path().join(".env.active").exists());
        assert!(!mock.calls().iter().any(|c| c.starts_with("up") || c.starts_with("down")));
        assert!(report.probe.is_some());
    }

    #[test]
    fn failure_moves_to_failed() {
        let dir = stack_dir();
        let mock = Arc::new(MockBackend::new().with_invalid_stack("services.db: bad"));
        let mut e = engine(dir.path(), mock);
        let err = e.run(Plan::Up).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStack(_)));
        assert_eq!(e.state(), PipelineState::Failed);
    }

    #[test]
    fn env_plan_stops_after_writing() {
        let dir = stack_dir();
        let mock = Arc::new(MockBackend::new());
        let report = engine(dir.path(), Arc::clone(&mock)).run(Plan::Env).unwrap();
        assert!(dir.path().join(".env.active").exists());
        assert!(report.launch.is_none());
        assert!(mock.calls().is_empty());
    }
}
