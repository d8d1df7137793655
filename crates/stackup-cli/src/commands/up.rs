use super::{print_report, run_plan, Failure, Output, EXIT_SUCCESS};
use stackup_core::{LaunchMode, Overrides, Plan};
use std::path::Path;

pub fn run(
    dir: &Path,
    mut overrides: Overrides,
    mode: Option<&str>,
    out: &Output,
) -> Result<u8, Failure> {
    if let Some(m) = mode {
        overrides.launch_mode = Some(m.parse::<LaunchMode>()?);
    }
    let report = run_plan(dir, overrides, Plan::Up, *out)?;
    print_report(&report, *out)?;
    Ok(EXIT_SUCCESS)
}
