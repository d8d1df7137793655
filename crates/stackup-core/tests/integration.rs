use stackup_core::{
    CoreError, Engine, ErrorKind, Overrides, PipelineState, Plan, RunReport, StackLock,
};
use stackup_runtime::mock::{container, MockBackend};
use stackup_runtime::ImageQuery;
use stackup_schema::{parse_manifest_file, read_env_values, Charset};
use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

const COMPOSE: &str = "services:
  db:
    image: postgres:16
    environment:
      - POSTGRES_PASSWORD=${DB_PASSWORD}
      - API_TOKEN=${API_TOKEN_ALNUM16_INTERNAL}
";

fn stack(manifest: &str, compose: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(".env.sample"), manifest).unwrap();
    fs::write(dir.path().join("docker-compose.yml"), compose).unwrap();
    dir
}

fn engine(dir: &Path, mock: MockBackend) -> Engine {
    engine_with_env(dir, mock, BTreeMap::new())
}

fn engine_with_env(dir: &Path, mock: MockBackend, process_env: BTreeMap<String, String>) -> Engine {
    Engine::new(dir)
        .with_runtime(Arc::new(mock))
        .with_process_env(process_env)
        .with_overrides(Overrides {
            non_interactive: true,
            ..Overrides::default()
        })
}

fn up(dir: &Path) -> RunReport {
    engine(dir, MockBackend::new()).run(Plan::Up).unwrap()
}

fn active(dir: &Path) -> String {
    fs::read_to_string(dir.join(".env.active")).unwrap()
}

// End to end: generated secrets have the declared shape and survive a re-run.
#[test]
fn generated_secrets_are_stable_across_runs() {
    let dir = stack(
        "# database\nDB_PASSWORD=\n\nAPI_TOKEN_ALNUM16_INTERNAL=\n",
        COMPOSE,
    );

    let first = up(dir.path());
    assert_eq!(first.generated, vec!["DB_PASSWORD", "API_TOKEN_ALNUM16_INTERNAL"]);
    let values = read_env_values(dir.path().join(".env.active")).unwrap();
    let password = values["DB_PASSWORD"].clone();
    let token = values["API_TOKEN_ALNUM16_INTERNAL"].clone();
    assert_eq!(password.len(), 20);
    assert_eq!(token.len(), 16);
    assert!(Charset::Alnum.matches(&token));

    let before = active(dir.path());
    let second = up(dir.path());
    assert!(second.generated.is_empty());
    assert_eq!(active(dir.path()), before, "re-run must not change the output file");
    let values = read_env_values(dir.path().join(".env.active")).unwrap();
    assert_eq!(values["DB_PASSWORD"], password);
    assert_eq!(values["API_TOKEN_ALNUM16_INTERNAL"], token);
}

// Round trip: comments, blanks and key order follow the manifest.
#[test]
fn output_file_keeps_manifest_layout() {
    let manifest = "# header\n\nDB_PASSWORD=   # generated\nDB_NAME=app\n  # indented comment\nAPI_TOKEN_ALNUM16_INTERNAL=\n";
    let dir = stack(manifest, COMPOSE);
    up(dir.path());

    let out = active(dir.path());
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 6);
    assert_eq!(lines[0], "# header");
    assert_eq!(lines[1], "");
    assert!(lines[2].starts_with("DB_PASSWORD="));
    assert!(lines[2].ends_with("# generated"));
    assert_eq!(lines[3], "DB_NAME=app");
    assert_eq!(lines[4], "  # indented comment");
    assert!(lines[5].starts_with("API_TOKEN_ALNUM16_INTERNAL="));
}

#[test]
fn deferred_keys_stay_empty_without_a_hook() {
    let dir = stack("DB_PASSWORD=\nCI_TOKEN_DEFERRED=\n", COMPOSE.replace("API_TOKEN_ALNUM16_INTERNAL", "CI_TOKEN_DEFERRED").as_str());
    let report = up(dir.path());
    assert_eq!(report.deferred, vec!["CI_TOKEN_DEFERRED"]);
    assert!(active(dir.path()).contains("CI_TOKEN_DEFERRED=\n"));
}

#[test]
fn undefined_active_reference_is_fatal() {
    let dir = stack(
        "DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n",
        &format!("{COMPOSE}      - MISSING=${{NOT_DEFINED}}\n"),
    );
    let err = engine(dir.path(), MockBackend::new()).run(Plan::Up).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Reference);
    assert!(err.to_string().contains("NOT_DEFINED"));
}

#[test]
fn commented_reference_only_warns() {
    let dir = stack(
        "DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n",
        &format!("{COMPOSE}      # - DEBUG=${{DEBUG_LEVEL}}\n"),
    );
    let report = up(dir.path());
    let refs = report.references.unwrap();
    assert_eq!(refs.commented_undefined, vec!["DEBUG_LEVEL"]);
    assert!(report.warnings.iter().any(|w| w.contains("DEBUG_LEVEL")));
}

#[test]
fn rate_limited_probe_does_not_block_launch() {
    let dir = stack("DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n", COMPOSE);
    let mock = MockBackend::new().with_image_result(
        "postgres:16",
        ImageQuery::Failed {
            detail: "toomanyrequests: Rate exceeded".to_owned(),
        },
    );
    let report = engine(dir.path(), mock).run(Plan::Up).unwrap();
    assert!(report.probe.unwrap().missing().is_empty());
    assert!(report.launch.is_some());
}

#[test]
fn local_access_denied_needs_continue_flag() {
    let compose = "services:\n  app:\n    image: myapp:local\n";
    let denied = || {
        MockBackend::new().with_image_result(
            "myapp:local",
            ImageQuery::Failed {
                detail: "pull access denied for myapp".to_owned(),
            },
        )
    };

    let dir = stack("APP_NAME=x\n", compose);
    let err = engine(dir.path(), denied()).run(Plan::Up).unwrap_err();
    assert!(matches!(err, CoreError::ImageAvailability { ref missing } if missing == &["myapp:local".to_owned()]));
    assert_eq!(err.kind().exit_code(), 5);

    let mut process_env = BTreeMap::new();
    process_env.insert("STACKUP_CONTINUE_ON_IMAGE_CHECK_ERROR".to_owned(), "1".to_owned());
    let report = engine_with_env(dir.path(), denied(), process_env).run(Plan::Up).unwrap();
    assert!(report.probe.unwrap().missing().is_empty());
}

#[test]
fn host_directories_converge() {
    let dir = stack(
        "DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\nDB_DATA_HOSTDIR=data/db\n",
        &format!("{COMPOSE}    volumes:\n      - ${{DB_DATA_HOSTDIR}}:/var/lib/postgresql/data\n"),
    );
    let data = dir.path().join("data/db");
    fs::create_dir_all(&data).unwrap();
    fs::set_permissions(&data, fs::Permissions::from_mode(0o700)).unwrap();

    up(dir.path());
    let report = up(dir.path());
    assert_eq!(report.dirs.len(), 1);
    let mode = fs::metadata(&data).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o770);
}

#[test]
fn env_file_reset_restarts_once() {
    let dir = stack(
        "STACKUP_RESET_BEFORE_START=env-file\nDB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n",
        COMPOSE,
    );
    let first = up(dir.path());
    assert_eq!(first.restarts, 1);
    let pw1 = read_env_values(dir.path().join(".env.active")).unwrap()["DB_PASSWORD"].clone();

    let second = up(dir.path());
    assert_eq!(second.restarts, 1);
    assert_eq!(second.final_state, PipelineState::Done);
    let pw2 = read_env_values(dir.path().join(".env.active")).unwrap()["DB_PASSWORD"].clone();
    assert_ne!(pw1, pw2, "a fresh environment regenerates secrets");
}

#[test]
fn container_reset_tears_down_before_launch() {
    let dir = stack("DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n", COMPOSE);
    let mock = Arc::new(MockBackend::new());
    let report = Engine::new(dir.path())
        .with_runtime(mock.clone())
        .with_process_env(BTreeMap::new())
        .with_overrides(Overrides {
            reset: Some(vec!["containers,networks".to_owned()]),
            non_interactive: true,
            ..Overrides::default()
        })
        .run(Plan::Up)
        .unwrap();
    assert_eq!(report.restarts, 0);
    let calls = mock.calls();
    let down = calls.iter().position(|c| c == "down").unwrap();
    let up = calls.iter().position(|c| c == "up -d").unwrap();
    assert!(down < up);
    assert!(calls.contains(&"prune-networks".to_owned()));
}

#[test]
fn pre_launch_hook_fills_deferred_token() {
    let compose = COMPOSE.replace("API_TOKEN_ALNUM16_INTERNAL", "CI_TOKEN_DEFERRED");
    let dir = stack(
        "STACKUP_HOOK_PRE_LAUNCH=hooks/pre.sh\nDB_PASSWORD=\nCI_TOKEN_DEFERRED=\n",
        &compose,
    );
    fs::create_dir(dir.path().join("hooks")).unwrap();
    fs::write(
        dir.path().join("hooks/pre.sh"),
        "# stackup-hook: function\ncat >/dev/null\nprintf '%s' '{\"CI_TOKEN_DEFERRED\": {\"value\": \"from-hook\", \"persist\": \"env\"}, \"SEEN_BY_HOOK\": {\"value\": \"1\", \"persist\": \"toml\", \"apply_to_runtime\": false}}'\n",
    )
    .unwrap();

    let report = up(dir.path());
    assert_eq!(report.hooks.len(), 1);
    assert_eq!(report.hooks[0].applied, vec!["CI_TOKEN_DEFERRED"]);
    assert!(active(dir.path()).contains("CI_TOKEN_DEFERRED=from-hook\n"));
    let state = fs::read_to_string(dir.path().join(".stackup/hook-state.toml")).unwrap();
    assert!(state.contains("SEEN_BY_HOOK = \"1\""));

    let again = up(dir.path());
    assert!(again.hooks[0].warnings.is_empty());
    assert!(active(dir.path()).contains("CI_TOKEN_DEFERRED=from-hook\n"));
}

#[test]
fn failing_hook_stops_before_launch() {
    let dir = stack(
        "STACKUP_HOOK_PRE_LAUNCH=pre.sh\nDB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n",
        COMPOSE,
    );
    fs::write(dir.path().join("pre.sh"), "# stackup-hook: run\nexit 1\n").unwrap();
    let mock = Arc::new(MockBackend::new());
    let err = Engine::new(dir.path())
        .with_runtime(mock.clone())
        .with_process_env(BTreeMap::new())
        .run(Plan::Up)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HookExecution);
    assert!(!mock.calls().iter().any(|c| c.starts_with("up")));
}

#[test]
fn unhealthy_stack_is_a_launch_error() {
    let dir = stack("DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n", COMPOSE);
    let mock = MockBackend::new()
        .with_container_snapshots(vec![vec![container("db", "running", Some("unhealthy"))]]);
    let err = engine(dir.path(), mock).run(Plan::Up).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert_eq!(err.kind().exit_code(), 8);
}

#[test]
fn detached_mode_does_not_poll() {
    let dir = stack(
        "STACKUP_LAUNCH_MODE=detached\nDB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n",
        COMPOSE,
    );
    let mock = Arc::new(MockBackend::new());
    let report = Engine::new(dir.path())
        .with_runtime(mock.clone())
        .with_process_env(BTreeMap::new())
        .run(Plan::Up)
        .unwrap();
    assert_eq!(report.launch.unwrap().polls, 0);
    assert!(!mock.calls().contains(&"containers".to_owned()));
}

#[test]
fn concurrent_run_is_rejected() {
    let dir = stack("DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n", COMPOSE);
    let _held = StackLock::acquire(&dir.path().join(".stackup/lock")).unwrap();
    let err = engine(dir.path(), MockBackend::new()).run(Plan::Up).unwrap_err();
    assert!(matches!(err, CoreError::Locked(_)));
}

#[test]
fn external_token_from_process_env() {
    let dir = stack(
        "DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\nREGISTRY_TOKEN_EXTERNAL=\n",
        COMPOSE,
    );
    let err = engine(dir.path(), MockBackend::new()).run(Plan::Env).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SecretProvisioning);
    assert!(!dir.path().join(".env.active").exists(), "no partial output on failure");

    let mut process_env = BTreeMap::new();
    process_env.insert("REGISTRY_TOKEN_EXTERNAL".to_owned(), "tok".to_owned());
    engine_with_env(dir.path(), MockBackend::new(), process_env)
        .run(Plan::Env)
        .unwrap();
    assert!(active(dir.path()).contains("REGISTRY_TOKEN_EXTERNAL=tok\n"));
}

#[test]
fn output_file_stands_in_for_missing_manifest() {
    let dir = stack("DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\n", COMPOSE);
    up(dir.path());
    let before = active(dir.path());
    fs::remove_file(dir.path().join(".env.sample")).unwrap();

    up(dir.path());
    assert_eq!(active(dir.path()), before);
}

#[test]
fn missing_manifest_is_a_manifest_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = engine(dir.path(), MockBackend::new()).run(Plan::Env).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Manifest);
}

#[test]
fn expansion_runs_before_the_file_is_written() {
    let dir = stack(
        "DB_PASSWORD=\nAPI_TOKEN_ALNUM16_INTERNAL=\nDB_HOST=db\nDB_URL=postgres://${DB_HOST}:5432/$(echo app)\n",
        COMPOSE,
    );
    engine(dir.path(), MockBackend::new()).run(Plan::Env).unwrap();
    let lines = parse_manifest_file(dir.path().join(".env.active")).unwrap();
    let url = lines
        .iter()
        .filter_map(|l| l.assignment())
        .find(|a| a.key == "DB_URL")
        .unwrap()
        .value();
    assert_eq!(url, "postgres://db:5432/app");
}
