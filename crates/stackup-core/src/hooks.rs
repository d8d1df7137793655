//! Pre- and post-launch extension hooks.
//!
//! A hook is a single file, executed directly when it has an execute bit and
//! through `sh` otherwise. Its calling convention is declared in a
//! `stackup-hook:` header comment:
//!
//! - `function`: reads `{"config": {...}, "env": {...}}` as JSON on stdin and
//!   prints a JSON object on stdout.
//! - `run(env)` / `run`: prints `HOOK_EXPORT_VAR:KEY=VALUE` lines. Only
//!   `run(env)` sees the Environment in its process environment.

use crate::CoreError;
use serde::{Deserialize, Serialize};
use stackup_runtime::run_with_timeout;
use stackup_schema::{is_valid_key, Assignment, Environment, ManifestLine, Origin};
use std::collections::BTreeMap;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

const HEADER_MARKER: &str = "stackup-hook:";
const HEADER_SCAN_LINES: usize = 20;
const EXPORT_PREFIX: &str = "HOOK_EXPORT_VAR:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookSlot {
    PreLaunch,
    PostLaunch,
}

impl fmt::Display for HookSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreLaunch => "pre-launch",
            Self::PostLaunch => "post-launch",
        })
    }
}

/// Calling convention, chosen from the declared ones in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Invocation {
    Function,
    Run { inject_env: bool },
}

impl Invocation {
    /// Read the header of `source`. No header means `function`.
    pub fn detect(source: &str) -> Result<Self, String> {
        let Some(declared) = source
            .lines()
            .take(HEADER_SCAN_LINES)
            .find_map(|l| l.split_once(HEADER_MARKER).map(|(_, rest)| rest))
        else {
            return Ok(Self::Function);
        };

        let mut found = Vec::new();
        for name in declared.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name {
                "function" => found.push(Self::Function),
                "run(env)" => found.push(Self::Run { inject_env: true }),
                "run" | "run()" => found.push(Self::Run { inject_env: false }),
                other => warn!("ignoring unknown hook convention '{other}'"),
            }
        }
        found
            .into_iter()
            .min_by_key(|i| match i {
                Self::Function => 0,
                Self::Run { inject_env: true } => 1,
                Self::Run { inject_env: false } => 2,
            })
            .ok_or_else(|| format!("header '{HEADER_MARKER}{declared}' names no known convention"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persist {
    Env,
    Toml,
    #[default]
    None,
}

/// One value returned by a hook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookValue {
    pub key: String,
    #[serde(skip)]
    pub value: String,
    pub persist: Persist,
    pub apply_to_runtime: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HookReport {
    pub slot: HookSlot,
    pub hook: PathBuf,
    pub invocation: Invocation,
    pub values: Vec<HookValue>,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub persisted: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ValueDescriptor {
    value: serde_json::Value,
    #[serde(default)]
    persist: Persist,
    #[serde(default = "default_apply")]
    apply_to_runtime: bool,
}

fn default_apply() -> bool {
    true
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HookState {
    #[serde(default)]
    values: BTreeMap<String, String>,
}

fn scalar(v: &serde_json::Value) -> Option<String> {
    use serde_json::Value;
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn parse_function_output(stdout: &str) -> Result<Vec<HookValue>, String> {
    let parsed: serde_json::Value = serde_json::from_str(stdout.trim())
        .map_err(|e| format!("output is not JSON: {e}"))?;
    let serde_json::Value::Object(map) = parsed else {
        return Err("output must be a JSON object".to_owned());
    };

    let mut values = Vec::with_capacity(map.len());
    for (key, raw) in map {
        if !is_valid_key(&key) {
            return Err(format!("invalid variable name '{key}'"));
        }
        let value = if let Some(v) = scalar(&raw) {
            HookValue {
                key,
                value: v,
                persist: Persist::None,
                apply_to_runtime: true,
            }
        } else {
            let d: ValueDescriptor = serde_json::from_value(raw)
                .map_err(|e| format!("{key}: malformed value descriptor: {e}"))?;
            let v = scalar(&d.value)
                .ok_or_else(|| format!("{key}: descriptor value must be a scalar"))?;
            HookValue {
                key,
                value: v,
                persist: d.persist,
                apply_to_runtime: d.apply_to_runtime,
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn parse_export_lines(stdout: &str) -> Result<Vec<HookValue>, String> {
    let mut values = Vec::new();
    for line in stdout.lines() {
        let Some(export) = line.trim_start().strip_prefix(EXPORT_PREFIX) else {
            debug!("hook: {line}");
            continue;
        };
        let (key, value) = export
            .split_once('=')
            .ok_or_else(|| format!("malformed export line '{EXPORT_PREFIX}{export}'"))?;
        let key = key.trim();
        if !is_valid_key(key) {
            return Err(format!("invalid variable name '{key}'"));
        }
        values.push(HookValue {
            key: key.to_owned(),
            value: value.to_owned(),
            persist: Persist::None,
            apply_to_runtime: true,
        });
    }
    Ok(values)
}

/// Run the hook at `hook` and collect the values it returns.
pub fn run_hook(
    slot: HookSlot,
    hook: &Path,
    env: &Environment,
    config: &serde_json::Value,
    stack_dir: &Path,
    timeout: Duration,
) -> Result<HookReport, CoreError> {
    let fail = |reason: String| CoreError::HookExecution {
        hook: hook.to_path_buf(),
        reason,
    };

    let source = std::fs::read(hook).map_err(|e| fail(format!("cannot read hook: {e}")))?;
    let invocation = Invocation::detect(&String::from_utf8_lossy(&source)).map_err(fail)?;
    info!("running {slot} hook {} ({invocation:?})", hook.display());

    let executable = std::fs::metadata(hook)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    let mut cmd = if executable {
        Command::new(hook)
    } else {
        let mut c = Command::new("sh");
        c.arg(hook);
        c
    };
    cmd.current_dir(stack_dir)
        .env("STACKUP_HOOK_SLOT", slot.to_string())
        .env("STACKUP_STACK_DIR", stack_dir);

    let snapshot = env.snapshot();
    let stdin = match invocation {
        Invocation::Function => {
            let payload = serde_json::json!({ "config": config, "env": snapshot });
            Some(payload.to_string().into_bytes())
        }
        Invocation::Run { inject_env } => {
            if inject_env {
                cmd.envs(&snapshot);
            }
            None
        }
    };

    let outcome = run_with_timeout(&mut cmd, timeout, stdin.as_deref())
        .map_err(|e| fail(format!("cannot start hook: {e}")))?;
    for line in outcome.stderr().lines() {
        debug!("hook stderr: {line}");
    }
    if outcome.timed_out() {
        return Err(fail(format!("timed out after {}s", timeout.as_secs())));
    }
    if !outcome.success() {
        return Err(fail(outcome.diagnostic()));
    }

    let values = match invocation {
        Invocation::Function => parse_function_output(outcome.stdout()),
        Invocation::Run { .. } => parse_export_lines(outcome.stdout()),
    }
    .map_err(|reason| fail(format!("malformed result: {reason}")))?;

    for v in &values {
        debug!("{}=[REDACTED] returned by hook", v.key);
    }

    Ok(HookReport {
        slot,
        hook: hook.to_path_buf(),
        invocation,
        values,
        applied: Vec::new(),
        skipped: Vec::new(),
        persisted: Vec::new(),
        warnings: Vec::new(),
    })
}

impl HookReport {
    /// Fold `apply_to_runtime` values into the live Environment. Non-empty
    /// generated, prompted or inherited values are kept.
    pub fn apply(&mut self, env: &mut Environment) {
        for v in self.values.iter().filter(|v| v.apply_to_runtime) {
            if let Some(current) = env.entry(&v.key) {
                if current.origin.is_protected() && !current.value.is_empty() {
                    if current.value != v.value {
                        let msg = format!(
                            "hook value for {} ignored; keeping the {} value",
                            v.key, current.origin
                        );
                        warn!("{msg}");
                        self.warnings.push(msg);
                        self.skipped.push(v.key.clone());
                    }
                    continue;
                }
            }
            env.insert(v.key.as_str(), v.value.as_str(), Origin::HookInjected);
            self.applied.push(v.key.clone());
        }
    }

    /// Values marked `persist = "env"`, recorded into the on-disk view of the
    /// output file. Keys unknown to `lines` are appended. Non-empty generated,
    /// prompted or inherited values on disk are kept, as in [`Self::apply`].
    pub fn persist_env(&mut self, lines: &mut Vec<ManifestLine>, persisted: &mut Environment) -> bool {
        let mut changed = false;
        for v in self.values.iter().filter(|v| v.persist == Persist::Env) {
            if let Some(current) = persisted.entry(&v.key) {
                if current.origin.is_protected() && !current.value.is_empty() {
                    if current.value != v.value {
                        let msg = format!(
                            "hook value for {} not persisted; keeping the {} value",
                            v.key, current.origin
                        );
                        warn!("{msg}");
                        self.warnings.push(msg);
                        if !self.skipped.contains(&v.key) {
                            self.skipped.push(v.key.clone());
                        }
                    }
                    continue;
                }
            }
            if !lines.iter().any(|l| l.key() == Some(v.key.as_str())) {
                lines.push(ManifestLine::Assignment(Assignment::new(v.key.as_str(), "")));
            }
            if persisted.get(&v.key) != Some(v.value.as_str()) {
                persisted.insert(v.key.as_str(), v.value.as_str(), Origin::HookInjected);
                changed = true;
            }
            self.persisted.push(v.key.clone());
        }
        changed
    }

    /// Values marked `persist = "toml"`, merged into the `[values]` table of
    /// the hook state file.
    pub fn persist_toml(&mut self, state_path: &Path) -> Result<(), CoreError> {
        let to_store: Vec<&HookValue> = self
            .values
            .iter()
            .filter(|v| v.persist == Persist::Toml)
            .collect();
        if to_store.is_empty() {
            return Ok(());
        }

        let mut state: HookState = match std::fs::read_to_string(state_path) {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| CoreError::Config(format!("{}: {e}", state_path.display())))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HookState::default(),
            Err(e) => return Err(CoreError::Io(e)),
        };
        for v in &to_store {
            state.values.insert(v.key.clone(), v.value.clone());
            self.persisted.push(v.key.clone());
        }

        if let Some(parent) = state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string(&state)
            .map_err(|e| CoreError::Config(format!("cannot encode hook state: {e}")))?;
        stackup_schema::write_env_file(state_path, &text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Hooks are written without an execute bit and run through `sh`.
    fn write_hook(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    fn run(hook: &Path, env: &Environment, dir: &Path) -> Result<HookReport, CoreError> {
        run_hook(
            HookSlot::PreLaunch,
            hook,
            env,
            &serde_json::json!({ "backend": "mock" }),
            dir,
            Duration::from_secs(10),
        )
    }

    #[test]
    fn detects_conventions_in_priority_order() {
        assert_eq!(Invocation::detect("echo hi\n").unwrap(), Invocation::Function);
        assert_eq!(
            Invocation::detect("#!/bin/sh\n# stackup-hook: run, run(env)\n").unwrap(),
            Invocation::Run { inject_env: true }
        );
        assert_eq!(
            Invocation::detect("# stackup-hook: run, function\n").unwrap(),
            Invocation::Function
        );
        assert!(Invocation::detect("# stackup-hook: teleport\n").is_err());
    }

    #[test]
    fn header_beyond_scan_window_is_ignored() {
        let mut src = "#\n".repeat(HEADER_SCAN_LINES);
        src.push_str("# stackup-hook: run\n");
        assert_eq!(Invocation::detect(&src).unwrap(), Invocation::Function);
    }

    #[test]
    fn function_hook_reads_env_and_returns_values() {
        let dir = tempfile::tempdir().unwrap();
        let hook = write_hook(
            dir.path(),
            "pre.sh",
            "#!/bin/sh\n# stackup-hook: function\ninput=$(cat)\ncase \"$input\" in *'\"DOMAIN\":\"example.org\"'*) ;; *) exit 9 ;; esac\n\
             printf '%s' '{\"CI_TOKEN_DEFERRED\": \"abc\", \"PORT\": 8080, \"NOTE\": {\"value\": \"x\", \"persist\": \"toml\", \"apply_to_runtime\": false}}'\n"
        );
        let mut env = Environment::new();
        env.insert("DOMAIN", "example.org", Origin::Declared);
        env.insert("CI_TOKEN_DEFERRED", "", Origin::Declared);

        let mut report = run(&hook, &env, dir.path()).unwrap();
        assert_eq!(report.invocation, Invocation::Function);
        assert_eq!(report.values.len(), 3);

        report.apply(&mut env);
        assert_eq!(env.get("CI_TOKEN_DEFERRED"), Some("abc"));
        assert_eq!(env.get("PORT"), Some("8080"));
        assert_eq!(env.origin("PORT"), Some(Origin::HookInjected));
        assert!(!env.contains_key("NOTE"));

        let state = dir.path().join(".stackup/hook-state.toml");
        report.persist_toml(&state).unwrap();
        let text = std::fs::read_to_string(&state).unwrap();
        assert!(text.contains("[values]"));
        assert!(text.contains("NOTE = \"x\""));
    }

    #[test]
    fn run_hook_exports_and_sees_env_only_when_declared() {
        let dir = tempfile::tempdir().unwrap();
        let body = "# stackup-hook: run(env)\necho \"noise\"\necho \"HOOK_EXPORT_VAR:SEEN=${DOMAIN:-none}\"\necho \"HOOK_EXPORT_VAR:SLOT=$STACKUP_HOOK_SLOT\"\n";
        let hook = write_hook(dir.path(), "with_env.sh", body);
        let mut env = Environment::new();
        env.insert("DOMAIN", "example.org", Origin::Declared);

        let report = run(&hook, &env, dir.path()).unwrap();
        let got: Vec<(&str, &str)> = report
            .values
            .iter()
            .map(|v| (v.key.as_str(), v.value.as_str()))
            .collect();
        assert_eq!(got, vec![("SEEN", "example.org"), ("SLOT", "pre-launch")]);

        let hook = write_hook(dir.path(), "no_env.sh", &body.replace("run(env)", "run"));
        let report = run(&hook, &env, dir.path()).unwrap();
        assert_eq!(report.values[0].value, "none");
    }

    #[test]
    fn protected_values_are_not_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let hook = write_hook(
            dir.path(),
            "h.sh",
            "# stackup-hook: run\necho HOOK_EXPORT_VAR:DB_PASSWORD=hook\n"
        );
        let mut env = Environment::new();
        env.insert("DB_PASSWORD", "generated", Origin::Generated);

        let mut report = run(&hook, &env, dir.path()).unwrap();
        report.apply(&mut env);
        assert_eq!(env.get("DB_PASSWORD"), Some("generated"));
        assert_eq!(report.skipped, vec!["DB_PASSWORD"]);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn failures_are_hook_errors() {
        let dir = tempfile::tempdir().unwrap();
        let env = Environment::new();

        let failing = write_hook(dir.path(), "fail.sh", "echo boom >&2\nexit 4\n");
        let err = run(&failing, &env, dir.path()).unwrap_err();
        assert!(matches!(err, CoreError::HookExecution { ref reason, .. } if reason.contains("boom")));

        let bad_json = write_hook(dir.path(), "bad.sh", "cat >/dev/null\necho '[1,2]'\n");
        let err = run(&bad_json, &env, dir.path()).unwrap_err();
        assert!(err.to_string().contains("malformed result"));

        let bad_export = write_hook(dir.path(), "bad2.sh", "# stackup-hook: run\necho HOOK_EXPORT_VAR:NOEQUALS\n");
        assert!(run(&bad_export, &env, dir.path()).is_err());

        let err = run(&dir.path().join("missing.sh"), &env, dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing.sh"));
    }

    #[test]
    fn hook_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let hook = write_hook(dir.path(), "slow.sh", "# stackup-hook: run\nsleep 5\n");
        let err = run_hook(
            HookSlot::PostLaunch,
            &hook,
            &Environment::new(),
            &serde_json::Value::Null,
            dir.path(),
            Duration::from_millis(200),
        )
        .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn persist_env_updates_and_appends() {
        let mut lines = stackup_schema::parse_manifest_str("A=1\n").unwrap();
        let mut persisted = Environment::new();
        persisted.insert("A", "1", Origin::Declared);
        let mut report = HookReport {
            slot: HookSlot::PreLaunch,
            hook: PathBuf::from("h"),
            invocation: Invocation::Function,
            values: vec![
                HookValue {
                    key: "A".to_owned(),
                    value: "2".to_owned(),
                    persist: Persist::Env,
                    apply_to_runtime: true,
                },
                HookValue {
                    key: "NEW".to_owned(),
                    value: "n".to_owned(),
                    persist: Persist::Env,
                    apply_to_runtime: false,
                },
            ],
            applied: Vec::new(),
            skipped: Vec::new(),
            persisted: Vec::new(),
            warnings: Vec::new(),
        };
        assert!(report.persist_env(&mut lines, &mut persisted));
        let rendered = stackup_schema::render_env_file(&lines, &persisted);
        assert_eq!(rendered, "A=2\nNEW=n\n");
        assert!(!report.persist_env(&mut lines, &mut persisted));
    }

    #[test]
    fn persist_env_keeps_generated_secret() {
        let mut lines = stackup_schema::parse_manifest_str("DB_PASSWORD=\n").unwrap();
        let mut persisted = Environment::new();
        persisted.insert("DB_PASSWORD", "gen", Origin::Generated);
        let mut runtime = persisted.clone();
        let mut report = HookReport {
            slot: HookSlot::PreLaunch,
            hook: PathBuf::from("h"),
            invocation: Invocation::Function,
            values: vec![HookValue {
                key: "DB_PASSWORD".to_owned(),
                value: "x".to_owned(),
                persist: Persist::Env,
                apply_to_runtime: true,
            }],
            applied: Vec::new(),
            skipped: Vec::new(),
            persisted: Vec::new(),
            warnings: Vec::new(),
        };

        report.apply(&mut runtime);
        assert!(!report.persist_env(&mut lines, &mut persisted));
        assert_eq!(runtime.get("DB_PASSWORD"), Some("gen"));
        assert_eq!(persisted.get("DB_PASSWORD"), Some("gen"));
        assert_eq!(
            stackup_schema::render_env_file(&lines, &persisted),
            "DB_PASSWORD=gen\n"
        );
        assert_eq!(report.skipped, vec!["DB_PASSWORD"]);
        assert!(report.persisted.is_empty());
        assert_eq!(report.warnings.len(), 2);
    }
}
