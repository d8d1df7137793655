use super::{print_report, run_plan, Failure, Output, EXIT_SUCCESS};
use stackup_core::{Overrides, Plan};
use std::path::Path;

pub fn run(dir: &Path, overrides: Overrides, out: &Output) -> Result<u8, Failure> {
    let report = run_plan(dir, overrides, Plan::Env, *out)?;
    print_report(&report, *out)?;
    Ok(EXIT_SUCCESS)
}
