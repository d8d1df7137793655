use super::{print_report, run_plan, Failure, Output, EXIT_SUCCESS};
use stackup_core::{Overrides, Plan};
use std::path::Path;

pub fn run(dir: &Path, overrides: Overrides, out: &Output) -> Result<u8, Failure> {
    let report = run_plan(dir, overrides, Plan::Check, *out)?;
    print_report(&report, *out)?;
    if !out.json && !out.quiet {
        if let Some(refs) = &report.references {
            if !refs.commented_undefined.is_empty() {
                println!(
                    "referenced only in comments: {}",
                    refs.commented_undefined.join(", ")
                );
            }
            println!("unused variables: {}", refs.unused.len());
        }
    }
    Ok(EXIT_SUCCESS)
}
