//! Layered run settings.
//!
//! Later layers win: built-in defaults, `stackup.toml`, `STACKUP_*` control
//! variables in the Environment, the process environment, command-line flags.

use crate::launch::LaunchMode;
use crate::CoreError;
use serde::{Deserialize, Serialize};
use stackup_schema::Environment;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "stackup.toml";
pub const STATE_DIR: &str = ".stackup";
pub const CONTROL_PREFIX: &str = "STACKUP_";

pub const DEFAULT_MANIFEST: &str = ".env.sample";
pub const DEFAULT_ENV_FILE: &str = ".env.active";
pub const DEFAULT_STACK_FILE: &str = "docker-compose.yml";
pub const DEFAULT_BACKEND: &str = "compose";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    backend: Option<String>,
    #[serde(default)]
    files: FilesSection,
    #[serde(default)]
    launch: LaunchSection,
    #[serde(default)]
    images: ImagesSection,
    #[serde(default)]
    hooks: HooksSection,
    #[serde(default)]
    reset: ResetSection,
    #[serde(default)]
    expansion: ExpansionSection,
    #[serde(default)]
    hostdirs: HostdirsSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilesSection {
    manifest: Option<PathBuf>,
    env_file: Option<PathBuf>,
    stack_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LaunchSection {
    mode: Option<String>,
    health_interval_secs: Option<u64>,
    health_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImagesSection {
    check: Option<bool>,
    continue_on_error: Option<bool>,
    probe_timeout_secs: Option<u64>,
    join_timeout_secs: Option<u64>,
    workers: Option<usize>,
    check_updates: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HooksSection {
    pre_launch: Option<PathBuf>,
    post_launch: Option<PathBuf>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ResetSection {
    actions: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExpansionSection {
    enabled: Option<bool>,
    command_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HostdirsSection {
    uid: Option<u32>,
    gid: Option<u32>,
}

/// Command-line layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub manifest: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    pub stack_file: Option<PathBuf>,
    pub backend: Option<String>,
    pub launch_mode: Option<LaunchMode>,
    pub reset: Option<Vec<String>>,
    pub non_interactive: bool,
    pub continue_on_image_error: bool,
    pub skip_image_check: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub stack_dir: PathBuf,
    pub manifest: PathBuf,
    pub env_file: PathBuf,
    pub stack_file: PathBuf,
    pub backend: String,
    pub launch_mode: LaunchMode,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub image_check: bool,
    pub continue_on_image_error: bool,
    pub probe_timeout: Duration,
    pub join_timeout: Duration,
    pub probe_workers: usize,
    pub check_updates: bool,
    pub pre_launch_hook: Option<PathBuf>,
    pub post_launch_hook: Option<PathBuf>,
    pub hook_timeout: Duration,
    pub reset_actions: Vec<String>,
    pub expansion_enabled: bool,
    pub command_timeout: Duration,
    pub owner_uid: Option<u32>,
    pub owner_gid: Option<u32>,
    pub interactive: bool,
}

impl Settings {
    pub fn defaults(stack_dir: &Path) -> Self {
        Self {
            stack_dir: stack_dir.to_path_buf(),
            manifest: stack_dir.join(DEFAULT_MANIFEST),
            env_file: stack_dir.join(DEFAULT_ENV_FILE),
            stack_file: stack_dir.join(DEFAULT_STACK_FILE),
            backend: DEFAULT_BACKEND.to_owned(),
            launch_mode: LaunchMode::Health,
            health_interval: Duration::from_secs(5),
            health_timeout: Duration::from_secs(300),
            image_check: true,
            continue_on_image_error: false,
            probe_timeout: Duration::from_secs(30),
            join_timeout: Duration::from_secs(60),
            probe_workers: 8,
            check_updates: false,
            pre_launch_hook: None,
            post_launch_hook: None,
            hook_timeout: Duration::from_secs(300),
            reset_actions: Vec::new(),
            expansion_enabled: true,
            command_timeout: Duration::from_secs(30),
            owner_uid: None,
            owner_gid: None,
            interactive: true,
        }
    }

    /// Resolve settings from every layer. `process_env` looks up variables of
    /// the invoking process.
    pub fn resolve_with(
        stack_dir: &Path,
        env: Option<&Environment>,
        overrides: &Overrides,
        process_env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, CoreError> {
        let mut s = Self::defaults(stack_dir);
        s.apply_file(&load_file_config(stack_dir)?)?;
        if let Some(env) = env {
            s.apply_env_controls(env)?;
        }
        if let Some(v) = process_env("STACKUP_CONTINUE_ON_IMAGE_CHECK_ERROR") {
            if !v.trim().is_empty() {
                s.continue_on_image_error =
                    parse_bool("STACKUP_CONTINUE_ON_IMAGE_CHECK_ERROR", &v)?;
            }
        }
        s.apply_overrides(overrides);
        Ok(s)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.stack_dir.join(STATE_DIR).join("lock")
    }

    pub fn hook_state_path(&self) -> PathBuf {
        self.stack_dir.join(STATE_DIR).join("hook-state.toml")
    }

    fn in_stack_dir(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.stack_dir.join(path)
        }
    }

    fn apply_file(&mut self, cfg: &FileConfig) -> Result<(), CoreError> {
        if let Some(b) = &cfg.backend {
            self.backend.clone_from(b);
        }
        if let Some(p) = &cfg.files.manifest {
            self.manifest = self.in_stack_dir(p);
        }
        if let Some(p) = &cfg.files.env_file {
            self.env_file = self.in_stack_dir(p);
        }
        if let Some(p) = &cfg.files.stack_file {
            self.stack_file = self.in_stack_dir(p);
        }
        if let Some(m) = &cfg.launch.mode {
            self.launch_mode = m.parse()?;
        }
        if let Some(n) = cfg.launch.health_interval_secs {
            self.health_interval = Duration::from_secs(n);
        }
        if let Some(n) = cfg.launch.health_timeout_secs {
            self.health_timeout = Duration::from_secs(n);
        }
        if let Some(b) = cfg.images.check {
            self.image_check = b;
        }
        if let Some(b) = cfg.images.continue_on_error {
            self.continue_on_image_error = b;
        }
        if let Some(n) = cfg.images.probe_timeout_secs {
            self.probe_timeout = Duration::from_secs(n);
        }
        if let Some(n) = cfg.images.join_timeout_secs {
            self.join_timeout = Duration::from_secs(n);
        }
        if let Some(n) = cfg.images.workers {
            if n == 0 {
                return Err(CoreError::Config(
                    "images.workers must be at least 1".to_owned(),
                ));
            }
            self.probe_workers = n;
        }
        if let Some(b) = cfg.images.check_updates {
            self.check_updates = b;
        }
        if let Some(p) = &cfg.hooks.pre_launch {
            self.pre_launch_hook = Some(self.in_stack_dir(p));
        }
        if let Some(p) = &cfg.hooks.post_launch {
            self.post_launch_hook = Some(self.in_stack_dir(p));
        }
        if let Some(n) = cfg.hooks.timeout_secs {
            self.hook_timeout = Duration::from_secs(n);
        }
        if let Some(a) = &cfg.reset.actions {
            self.reset_actions.clone_from(a);
        }
        if let Some(b) = cfg.expansion.enabled {
            self.expansion_enabled = b;
        }
        if let Some(n) = cfg.expansion.command_timeout_secs {
            self.command_timeout = Duration::from_secs(n);
        }
        if cfg.hostdirs.uid.is_some() {
            self.owner_uid = cfg.hostdirs.uid;
        }
        if cfg.hostdirs.gid.is_some() {
            self.owner_gid = cfg.hostdirs.gid;
        }
        Ok(())
    }

    /// Apply `STACKUP_*` control variables and the `UID`/`GID` owner keys.
    /// Empty values leave the setting alone.
    fn apply_env_controls(&mut self, env: &Environment) -> Result<(), CoreError> {
        let get = |name: &str| env.get(name).map(str::trim).filter(|v| !v.is_empty());

        if let Some(v) = get("STACKUP_LAUNCH_MODE") {
            self.launch_mode = v.parse()?;
        }
        if let Some(v) = get("STACKUP_RESET_BEFORE_START") {
            self.reset_actions = vec![v.to_owned()];
        }
        if let Some(v) = get("STACKUP_HOOK_PRE_LAUNCH") {
            self.pre_launch_hook = Some(self.in_stack_dir(Path::new(v)));
        }
        if let Some(v) = get("STACKUP_HOOK_POST_LAUNCH") {
            self.post_launch_hook = Some(self.in_stack_dir(Path::new(v)));
        }
        if let Some(v) = get("STACKUP_IMAGE_CHECK_ENABLED") {
            self.image_check = parse_bool("STACKUP_IMAGE_CHECK_ENABLED", v)?;
        }
        if let Some(v) = get("STACKUP_CONTINUE_ON_IMAGE_CHECK_ERROR") {
            self.continue_on_image_error = parse_bool("STACKUP_CONTINUE_ON_IMAGE_CHECK_ERROR", v)?;
        }
        if let Some(v) = get("STACKUP_HEALTH_TIMEOUT") {
            self.health_timeout = parse_secs("STACKUP_HEALTH_TIMEOUT", v)?;
        }
        if let Some(v) = get("STACKUP_HEALTH_INTERVAL") {
            self.health_interval = parse_secs("STACKUP_HEALTH_INTERVAL", v)?;
        }
        if let Some(v) = get("STACKUP_ENABLE_EXPANSION") {
            self.expansion_enabled = parse_bool("STACKUP_ENABLE_EXPANSION", v)?;
        }
        if let Some(v) = get("STACKUP_CHECK_IMAGE_UPDATES") {
            self.check_updates = parse_bool("STACKUP_CHECK_IMAGE_UPDATES", v)?;
        }
        if let Some(v) = get("UID") {
            self.owner_uid = Some(parse_id("UID", v)?);
        }
        if let Some(v) = get("GID") {
            self.owner_gid = Some(parse_id("GID", v)?);
        }
        Ok(())
    }

    fn apply_overrides(&mut self, o: &Overrides) {
        if let Some(p) = &o.manifest {
            self.manifest = self.in_stack_dir(p);
        }
        if let Some(p) = &o.env_file {
            self.env_file = self.in_stack_dir(p);
        }
        if let Some(p) = &o.stack_file {
            self.stack_file = self.in_stack_dir(p);
        }
        if let Some(b) = &o.backend {
            self.backend.clone_from(b);
        }
        if let Some(m) = o.launch_mode {
            self.launch_mode = m;
        }
        if let Some(r) = &o.reset {
            self.reset_actions.clone_from(r);
        }
        if o.non_interactive {
            self.interactive = false;
        }
        if o.continue_on_image_error {
            self.continue_on_image_error = true;
        }
        if o.skip_image_check {
            self.image_check = false;
        }
    }
}

fn load_file_config(stack_dir: &Path) -> Result<FileConfig, CoreError> {
    let path = stack_dir.join(CONFIG_FILE);
    match std::fs::read_to_string(&path) {
        Ok(text) => toml::from_str(&text)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FileConfig::default()),
        Err(e) => Err(CoreError::Io(e)),
    }
}

pub fn parse_bool(name: &str, value: &str) -> Result<bool, CoreError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CoreError::Config(format!(
            "{name}: expected a boolean (1/0, true/false, yes/no, on/off), got '{other}'"
        ))),
    }
}

fn parse_secs(name: &str, value: &str) -> Result<Duration, CoreError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| CoreError::Config(format!("{name}: expected whole seconds, got '{value}'")))
}

fn parse_id(name: &str, value: &str) -> Result<u32, CoreError> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| CoreError::Config(format!("{name}: expected a numeric id, got '{value}'")))
}
