pub mod check;
pub mod completions;
pub mod doctor;
pub mod env;
pub mod init;
pub mod man_pages;
pub mod secrets;
pub mod up;

use dialoguer::Password;
use indicatif::{ProgressBar, ProgressStyle};
use stackup_core::{
    CoreError, Engine, Overrides, PipelineState, Plan, Prompter, RunReport, StageObserver,
};
use stackup_schema::SecretDescriptor;
use std::io::IsTerminal;
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;

/// Message and exit code of a failed command.
#[derive(Debug)]
pub struct Failure {
    pub code: u8,
    pub message: String,
}

impl From<CoreError> for Failure {
    fn from(e: CoreError) -> Self {
        Self {
            code: e.kind().exit_code(),
            message: e.to_string(),
        }
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self {
            code: EXIT_FAILURE,
            message,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Output {
    fn shows_progress(self) -> bool {
        !self.json && !self.quiet
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Colour a container or health status.
pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "healthy" => Style::new().green().apply_to(state).to_string(),
        "running" => Style::new().cyan().bold().apply_to(state).to_string(),
        "starting" | "created" | "restarting" => Style::new().yellow().apply_to(state).to_string(),
        "unhealthy" | "exited" | "dead" => Style::new().red().bold().apply_to(state).to_string(),
        "paused" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

fn stage_label(state: PipelineState) -> &'static str {
    match state {
        PipelineState::Init => "starting",
        PipelineState::LoadOrGenerateEnv => "loading environment",
        PipelineState::Expand => "expanding values",
        PipelineState::Reset => "resetting",
        PipelineState::ReconcileDirs => "preparing host directories",
        PipelineState::RunHook => "running pre-launch hook",
        PipelineState::ValidateReferences => "validating stack references",
        PipelineState::ProbeImages => "checking images",
        PipelineState::Launch => "launching stack",
        PipelineState::PollHealth => "waiting for containers to become healthy",
        PipelineState::PostLaunchHook => "running post-launch hook",
        PipelineState::Done => "done",
        PipelineState::Failed => "failed",
    }
}

/// Follows pipeline stages with a spinner message.
struct SpinnerObserver {
    pb: ProgressBar,
    released: bool,
}

impl StageObserver for SpinnerObserver {
    fn stage(&mut self, state: PipelineState) {
        if !self.released {
            self.pb.set_message(format!("{}...", stage_label(state)));
        }
    }

    fn before_foreground(&mut self) {
        self.released = true;
        self.pb.finish_and_clear();
    }
}

/// Asks for external tokens on the terminal, pausing the spinner meanwhile.
struct TerminalPrompter {
    pb: Option<ProgressBar>,
}

impl Prompter for TerminalPrompter {
    fn prompt(&mut self, key: &str, descriptor: &SecretDescriptor) -> Result<String, String> {
        let ask = || {
            Password::new()
                .with_prompt(format!("{key} ({descriptor})"))
                .allow_empty_password(true)
                .interact()
                .map_err(|e| format!("prompt failed: {e}"))
        };
        match &self.pb {
            Some(pb) => pb.suspend(ask),
            None => ask(),
        }
    }
}

fn is_interactive(non_interactive: bool) -> bool {
    !non_interactive && std::io::stdin().is_terminal() && std::io::stderr().is_terminal()
}

/// Fail early when the compose backend's tools are missing.
/// `STACKUP_SKIP_PREREQS=1` skips the check.
pub fn ensure_prereqs(engine: &Engine) -> Result<(), Failure> {
    if std::env::var("STACKUP_SKIP_PREREQS").as_deref() == Ok("1") {
        return Ok(());
    }
    if engine.settings()?.backend != stackup_core::settings::DEFAULT_BACKEND {
        return Ok(());
    }
    let missing = stackup_runtime::check_compose_prereqs();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(stackup_runtime::format_missing(&missing).into())
    }
}

/// Run `plan` with progress reporting and terminal prompting wired in.
pub fn run_plan(
    dir: &Path,
    mut overrides: Overrides,
    plan: Plan,
    out: Output,
) -> Result<RunReport, Failure> {
    let interactive = is_interactive(overrides.non_interactive);
    overrides.non_interactive = !interactive;

    let mut engine = Engine::new(dir).with_overrides(overrides);
    if plan != Plan::Env {
        ensure_prereqs(&engine)?;
    }

    let verb = match plan {
        Plan::Up => "up",
        Plan::Env => "env",
        Plan::Check => "check",
    };
    let pb = out.shows_progress().then(|| spinner(&format!("{verb}...")));
    if let Some(pb) = &pb {
        engine = engine.with_observer(Box::new(SpinnerObserver {
            pb: pb.clone(),
            released: false,
        }));
    }
    if interactive {
        engine = engine.with_prompter(Box::new(TerminalPrompter { pb: pb.clone() }));
    }

    let result = engine.run(plan);
    if let Some(pb) = &pb {
        match &result {
            Ok(_) => spin_ok(pb, &format!("{verb} finished")),
            Err(e) => spin_fail(pb, &format!("{verb} failed ({})", e.kind().name())),
        }
    }
    result.map_err(Failure::from)
}

fn list(label: &str, items: &[String]) {
    if !items.is_empty() {
        println!("{label}: {}", items.join(", "));
    }
}

/// Human-readable summary of a run.
pub fn print_report(report: &RunReport, out: Output) -> Result<(), String> {
    if out.json {
        println!("{}", json_pretty(report)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    if report.env_file_written {
        println!("env file: {}", report.env_file.display());
    }
    list("generated", &report.generated);
    list("prompted", &report.prompted);
    list("inherited", &report.inherited);
    list("deferred", &report.deferred);
    if out.verbose {
        list("expanded", &report.expanded);
    }
    if let Some(reset) = &report.reset {
        let performed: Vec<String> = reset.performed.iter().map(ToString::to_string).collect();
        list("reset", &performed);
    }
    for dir in &report.dirs {
        println!("directory: {} ({:?})", dir.path.display(), dir.outcome);
    }
    for hook in &report.hooks {
        println!(
            "{} hook {}: {} applied, {} persisted",
            hook.slot,
            hook.hook.display(),
            hook.applied.len(),
            hook.persisted.len()
        );
    }
    if let Some(refs) = &report.references {
        if !refs.unused.is_empty() && out.verbose {
            list("unused", &refs.unused);
        }
    }
    if let Some(probe) = &report.probe {
        println!(
            "images: {} available, {} missing",
            probe.available().count(),
            probe.missing().len()
        );
        if out.verbose {
            for (image, detail) in probe.diagnostics() {
                println!("  {image}: {detail}");
            }
        }
        list("updates", &probe.updates);
    }
    if let Some(launch) = &report.launch {
        println!("launch: {}", launch.mode);
        for c in &launch.containers {
            let status = c.health.as_deref().unwrap_or(&c.status);
            println!("  {} ({}) {}", c.name, c.service, colorize_state(status));
        }
    }
    if !report.warnings.is_empty() {
        println!("warnings: {}", report.warnings.len());
        if out.verbose {
            for w in &report.warnings {
                println!("  {w}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_pretty_serializes_object() {
        let val = serde_json::json!({"key": "value"});
        let result = json_pretty(&val).unwrap();
        assert!(result.contains("\"key\""));
        assert!(result.contains("\"value\""));
    }

    #[test]
    fn colorize_known_states() {
        for state in ["healthy", "running", "starting", "unhealthy", "exited", "paused"] {
            assert!(colorize_state(state).contains(state));
        }
    }

    #[test]
    fn colorize_state_unknown() {
        assert_eq!(colorize_state("unknown"), "unknown");
    }

    #[test]
    fn core_errors_keep_their_exit_code() {
        let f = Failure::from(CoreError::Launch("boom".to_owned()));
        assert_eq!(f.code, 8);
        assert!(f.message.contains("boom"));
        let f = Failure::from("plain".to_owned());
        assert_eq!(f.code, EXIT_FAILURE);
    }

    #[test]
    fn every_stage_has_a_label() {
        assert_eq!(stage_label(PipelineState::ProbeImages), "checking images");
        assert_eq!(stage_label(PipelineState::Done), "done");
    }

    #[test]
    fn spinner_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_ok(&pb, "done");
    }

    #[test]
    fn spinner_fail_creates_progress_bar() {
        let pb = spinner("testing...");
        spin_fail(&pb, "failed");
    }
}
