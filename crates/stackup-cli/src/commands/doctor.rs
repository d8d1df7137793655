use super::{json_pretty, EXIT_FAILURE, EXIT_SUCCESS};
use stackup_core::{describe_secrets, Engine, Settings, StackLock};
use stackup_schema::parse_manifest_file;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub fn run(dir: &Path, json_output: bool) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    match Engine::new(dir).settings() {
        Ok(settings) => {
            checks.push(Check::pass("settings", "Settings resolved"));
            if settings.backend == stackup_core::settings::DEFAULT_BACKEND {
                check_prereqs(&mut checks, &mut all_pass);
            } else {
                checks.push(Check::info(
                    "runtime_prereqs",
                    &format!("Backend '{}' has no host prerequisites", settings.backend),
                ));
            }
            check_files(&settings, &mut checks, &mut all_pass);
            check_lock(&settings, &mut checks, &mut all_pass);
        }
        Err(e) => {
            all_pass = false;
            checks.push(Check::fail("settings", &format!("Settings invalid: {e}")));
        }
    }
    check_disk_space(dir, &mut checks);

    print_results(&checks, all_pass, json_output)
}

fn check_prereqs(checks: &mut Vec<Check>, all_pass: &mut bool) {
    let missing = stackup_runtime::check_compose_prereqs();
    if missing.is_empty() {
        checks.push(Check::pass(
            "runtime_prereqs",
            "Runtime prerequisites satisfied",
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "runtime_prereqs",
            &format!(
                "Missing prerequisites: {}",
                stackup_runtime::format_missing(&missing)
            ),
        ));
    }
}

fn check_files(settings: &Settings, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let manifest = if settings.manifest.exists() {
        checks.push(Check::pass(
            "manifest",
            &format!("Manifest {} found", settings.manifest.display()),
        ));
        Some(&settings.manifest)
    } else if settings.env_file.exists() {
        checks.push(Check::warn(
            "manifest",
            &format!(
                "Manifest {} missing; {} will be used instead",
                settings.manifest.display(),
                settings.env_file.display()
            ),
        ));
        Some(&settings.env_file)
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "manifest",
            &format!("Manifest {} not found", settings.manifest.display()),
        ));
        None
    };

    if let Some(path) = manifest {
        let parsed = parse_manifest_file(path)
            .map_err(|e| e.to_string())
            .and_then(|lines| describe_secrets(&lines).map_err(|e| e.to_string()));
        match parsed {
            Ok(secrets) => checks.push(Check::pass(
                "manifest_valid",
                &format!("Manifest parses ({} secret descriptors)", secrets.len()),
            )),
            Err(e) => {
                *all_pass = false;
                checks.push(Check::fail("manifest_valid", &e));
            }
        }
    }

    if settings.stack_file.is_file() {
        checks.push(Check::pass(
            "stack_file",
            &format!("Stack file {} found", settings.stack_file.display()),
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "stack_file",
            &format!("Stack file {} not found", settings.stack_file.display()),
        ));
    }

    if settings.env_file.exists() {
        checks.push(Check::info(
            "env_file",
            &format!("Output env file {} present", settings.env_file.display()),
        ));
    } else {
        checks.push(Check::info(
            "env_file",
            "Output env file not written yet (created on first run)",
        ));
    }
}

fn check_lock(settings: &Settings, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let path = settings.lock_path();
    if !path.exists() {
        checks.push(Check::info("stack_lock", "Stack lock not created yet"));
        return;
    }
    match StackLock::try_acquire(&path) {
        Ok(Some(_)) => checks.push(Check::pass("stack_lock", "Stack lock is free")),
        Ok(None) => checks.push(Check::warn(
            "stack_lock",
            "Stack lock is held by another process",
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "stack_lock",
                &format!("Cannot check stack lock: {e}"),
            ));
        }
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&json)?);
    } else {
        println!("stackup doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: String,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &str, status: &'static str, message: &str) -> Self {
        Self {
            name: name.to_owned(),
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}

/// Free space on the filesystem holding `path`, in MiB.
fn available_mib(path: &Path) -> Option<u64> {
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;

    // SAFETY: zeroed statvfs is a valid initial state for the struct.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and stat is a valid out pointer; the
    // struct is only read when the call succeeds.
    #[allow(unsafe_code, clippy::undocumented_unsafe_blocks)]
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if ret != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    Some((stat.f_bavail as u64 * stat.f_frsize as u64) / (1024 * 1024))
}

/// Host directories and the env file live under the stack directory.
fn check_disk_space(dir: &Path, checks: &mut Vec<Check>) {
    let Some(mib) = available_mib(dir) else {
        return;
    };
    if mib < 100 {
        checks.push(Check::fail(
            "disk_space",
            &format!("Low disk space in stack directory: {mib} MB available"),
        ));
    } else if mib < 1024 {
        checks.push(Check::warn(
            "disk_space",
            &format!("Disk space: {mib} MB available for host directories"),
        ));
    } else {
        checks.push(Check::pass(
            "disk_space",
            &format!("Disk space: {} GB available", mib / 1024),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::defaults(dir.path());
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_files(&settings, &mut checks, &mut all_pass);
        assert!(!all_pass);
        let failed: Vec<&str> = checks
            .iter()
            .filter(|c| c.status == "fail")
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(failed, vec!["manifest", "stack_file"]);
    }

    #[test]
    fn bad_descriptor_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env.sample"), "DB_PASSWORD_ALNUM0=\n").unwrap();
        std::fs::write(dir.path().join("docker-compose.yml"), "services: {}\n").unwrap();
        let settings = Settings::defaults(dir.path());
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_files(&settings, &mut checks, &mut all_pass);
        assert!(!all_pass);
        assert!(checks.iter().any(|c| c.name == "manifest_valid" && c.status == "fail"));
    }

    #[test]
    fn free_lock_passes() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::defaults(dir.path());
        drop(StackLock::acquire(&settings.lock_path()).unwrap());
        let mut checks = Vec::new();
        let mut all_pass = true;
        check_lock(&settings, &mut checks, &mut all_pass);
        assert!(all_pass);
        assert_eq!(checks[0].status, "pass");
    }
}
