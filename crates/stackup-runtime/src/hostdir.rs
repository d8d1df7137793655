use crate::RuntimeError;
use serde::Serialize;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const HOSTDIR_MODE: u32 = 0o770;

/// Keys whose values name host directories: `*_HOSTDIR_*`, `*_HOSTDIR`, `*_HOSTDIRS`.
pub fn is_hostdir_key(key: &str) -> bool {
    key.contains("_HOSTDIR_") || key.ends_with("_HOSTDIR") || key.ends_with("_HOSTDIRS")
}

/// Desired state of one host directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostDirSpec {
    pub key: String,
    pub path: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

impl HostDirSpec {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>, uid: u32, gid: u32) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            uid,
            gid,
            mode: HOSTDIR_MODE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirOutcome {
    Created,
    Repaired,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirReport {
    pub path: PathBuf,
    pub outcome: DirOutcome,
    pub warnings: Vec<String>,
}

/// Bring `spec.path` to the desired owner and mode.
///
/// Ownership and mode repairs that fail are warnings; the call only fails when
/// the path cannot be created, is not a directory, or is not writable by this
/// process afterwards.
pub fn reconcile_dir(spec: &HostDirSpec) -> Result<DirReport, RuntimeError> {
    let path = spec.path.as_path();
    let fail = |reason: String| RuntimeError::HostDir {
        path: path.to_path_buf(),
        reason,
    };
    let mut warnings = Vec::new();

    let outcome = match fs::metadata(path) {
        Ok(meta) if !meta.is_dir() => {
            return Err(fail("exists but is not a directory".to_owned()));
        }
        Ok(meta) => {
            let mut repaired = false;
            if meta.uid() != spec.uid || meta.gid() != spec.gid {
                warnings.push(format!(
                    "{}: ownership is {}:{}, expected {}:{}",
                    path.display(),
                    meta.uid(),
                    meta.gid(),
                    spec.uid,
                    spec.gid
                ));
                match chown(path, spec.uid, spec.gid) {
                    Ok(()) => repaired = true,
                    Err(e) => warnings.push(format!("{}: could not set ownership: {e}", path.display())),
                }
            }
            let mode = meta.permissions().mode() & 0o777;
            if mode != spec.mode {
                warnings.push(format!(
                    "{}: mode is {mode:o}, expected {:o}",
                    path.display(),
                    spec.mode
                ));
                match fs::set_permissions(path, fs::Permissions::from_mode(spec.mode)) {
                    Ok(()) => repaired = true,
                    Err(e) => warnings.push(format!("{}: could not set mode: {e}", path.display())),
                }
            }
            if repaired {
                DirOutcome::Repaired
            } else {
                DirOutcome::Unchanged
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::create_dir_all(path).map_err(|e| fail(format!("cannot create: {e}")))?;
            if let Err(e) = chown(path, spec.uid, spec.gid) {
                warnings.push(format!("{}: could not set ownership: {e}", path.display()));
            }
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(spec.mode)) {
                warnings.push(format!("{}: could not set mode: {e}", path.display()));
            }
            DirOutcome::Created
        }
        Err(e) => return Err(fail(e.to_string())),
    };

    for w in &warnings {
        warn!("{w}");
    }

    if !is_writable(path) {
        return Err(fail("not writable by the current user".to_owned()));
    }

    match outcome {
        DirOutcome::Created | DirOutcome::Repaired => {
            info!("set up directory {} for {}", path.display(), spec.key);
        }
        DirOutcome::Unchanged => info!("directory {} for {}: check OK", path.display(), spec.key),
    }

    Ok(DirReport {
        path: path.to_path_buf(),
        outcome,
        warnings,
    })
}

fn chown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    std::os::unix::fs::chown(path, Some(uid), Some(gid))
}

/// Safe wrapper around libc::access(W_OK).
#[allow(unsafe_code)]
pub fn is_writable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

/// Safe wrapper around libc::getuid().
#[allow(unsafe_code)]
pub fn current_uid() -> u32 {
    // SAFETY: getuid() takes no arguments and cannot fail.
    unsafe { libc::getuid() }
}

/// Safe wrapper around libc::getgid().
#[allow(unsafe_code)]
pub fn current_gid() -> u32 {
    // SAFETY: getgid() takes no arguments and cannot fail.
    unsafe { libc::getgid() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn hostdir_key_patterns() {
        assert!(is_hostdir_key("DB_HOSTDIR"));
        assert!(is_hostdir_key("APP_HOSTDIRS"));
        assert!(is_hostdir_key("APP_HOSTDIR_DATA"));
        assert!(!is_hostdir_key("HOSTDIR"));
        assert!(!is_hostdir_key("DB_HOSTDIRECTORY"));
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data/db");
        let spec = HostDirSpec::new("DB_HOSTDIR", &target, current_uid(), current_gid());

        let report = reconcile_dir(&spec).unwrap();
        assert_eq!(report.outcome, DirOutcome::Created);
        assert!(target.is_dir());
        assert_eq!(mode_of(&target), HOSTDIR_MODE);
    }

    #[test]
    fn repairs_mode_and_converges() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data");
        fs::create_dir(&target).unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).unwrap();

        // As root we can also put the directory under the wrong owner first.
        if current_uid() == 0 {
            chown(&target, 4242, 4242).unwrap();
        }

        let spec = HostDirSpec::new("APP_HOSTDIR", &target, current_uid(), current_gid());
        let first = reconcile_dir(&spec).unwrap();
        assert_eq!(first.outcome, DirOutcome::Repaired);
        assert!(!first.warnings.is_empty());

        let second = reconcile_dir(&spec).unwrap();
        assert_eq!(second.outcome, DirOutcome::Unchanged);
        assert!(second.warnings.is_empty());

        let meta = fs::metadata(&target).unwrap();
        assert_eq!((meta.uid(), meta.gid()), (current_uid(), current_gid()));
        assert_eq!(mode_of(&target), HOSTDIR_MODE);
    }

    #[test]
    fn regular_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("file");
        fs::write(&target, "x").unwrap();
        let spec = HostDirSpec::new("X_HOSTDIR", &target, current_uid(), current_gid());
        assert!(matches!(
            reconcile_dir(&spec),
            Err(RuntimeError::HostDir { .. })
        ));
    }
}
