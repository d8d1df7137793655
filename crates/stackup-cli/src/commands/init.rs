use super::{json_pretty, Failure, Output, EXIT_SUCCESS};
use dialoguer::Confirm;
use stackup_core::settings::DEFAULT_MANIFEST;
use stackup_schema::{parse_manifest_str, write_env_file};
use std::io::{stderr, stdin, IsTerminal};
use std::path::{Path, PathBuf};

const SKELETON: &str = "\
# Environment manifest for stackup.
# Empty values are synthesized into the output env file; keys ending in
# _PASSWORD or _TOKEN_INTERNAL get generated secrets, _TOKEN_EXTERNAL keys are
# prompted for or read from the process environment.

# Launch controls
STACKUP_LAUNCH_MODE=health
STACKUP_RESET_BEFORE_START=none
STACKUP_IMAGE_CHECK_ENABLED=true
STACKUP_CONTINUE_ON_IMAGE_CHECK_ERROR=false
STACKUP_CHECK_IMAGE_UPDATES=false
STACKUP_HEALTH_TIMEOUT=300
STACKUP_HEALTH_INTERVAL=5

# Hooks run before and after launch (paths relative to this directory)
STACKUP_HOOK_PRE_LAUNCH=
STACKUP_HOOK_POST_LAUNCH=

# Expand $VAR, ${VAR:-default} and $(command) in values
STACKUP_ENABLE_EXPANSION=true

# TLS / public access
PUBLIC_FQDN=example.local
PUBLIC_TLS_KEY_PEM=/etc/letsencrypt/live/${PUBLIC_FQDN}/privkey.pem
PUBLIC_TLS_CRT_PEM=/etc/letsencrypt/live/${PUBLIC_FQDN}/fullchain.pem
";

fn ensure_can_write(dest: &Path, force: bool, is_tty: bool) -> Result<(), String> {
    if !dest.exists() || force {
        return Ok(());
    }
    let refusal = || format!("refusing to overwrite existing {} (pass --force)", dest.display());
    if !is_tty {
        return Err(refusal());
    }
    let overwrite = Confirm::new()
        .with_prompt(format!("overwrite {}?", dest.display()))
        .default(false)
        .interact()
        .map_err(|e| format!("prompt failed: {e}"))?;
    if overwrite {
        Ok(())
    } else {
        Err(refusal())
    }
}

pub fn run(dir: &Path, manifest: Option<&Path>, force: bool, out: &Output) -> Result<u8, Failure> {
    let dest: PathBuf = match manifest {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => dir.join(p),
        None => dir.join(DEFAULT_MANIFEST),
    };
    let is_tty = stdin().is_terminal() && stderr().is_terminal() && !out.json;
    ensure_can_write(&dest, force, is_tty)?;

    parse_manifest_str(SKELETON).map_err(|e| format!("skeleton manifest invalid: {e}"))?;
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("create {}: {e}", parent.display()))?;
    }
    write_env_file(&dest, SKELETON).map_err(|e| format!("write {}: {e}", dest.display()))?;

    if out.json {
        let payload = serde_json::json!({
            "status": "written",
            "path": dest,
        });
        println!("{}", json_pretty(&payload)?);
    } else if !out.quiet {
        println!("wrote {}", dest.display());
    }
    Ok(EXIT_SUCCESS)
}
