use super::{json_pretty, Failure, Output, EXIT_SUCCESS};
use serde::Serialize;
use stackup_core::{describe_secrets, CoreError, Engine, Overrides, SecretDescriptorEntry};
use stackup_schema::{parse_manifest_file, read_env_values};
use std::collections::HashMap;
use std::path::Path;

#[derive(Serialize)]
struct SecretStatus {
    #[serde(flatten)]
    entry: SecretDescriptorEntry,
    /// `set`, `empty` or `absent` in the output env file.
    status: &'static str,
}

fn status_of(values: &HashMap<String, String>, key: &str) -> &'static str {
    match values.get(key) {
        Some(v) if !v.is_empty() => "set",
        Some(_) => "empty",
        None => "absent",
    }
}

pub fn run(dir: &Path, overrides: Overrides, out: &Output) -> Result<u8, Failure> {
    let settings = Engine::new(dir).with_overrides(overrides).settings()?;
    let manifest = if !settings.manifest.exists() && settings.env_file.exists() {
        &settings.env_file
    } else {
        &settings.manifest
    };
    let lines = parse_manifest_file(manifest).map_err(CoreError::from)?;
    let values = if settings.env_file.exists() {
        read_env_values(&settings.env_file).map_err(CoreError::from)?
    } else {
        HashMap::new()
    };

    let secrets: Vec<SecretStatus> = describe_secrets(&lines)?
        .into_iter()
        .map(|entry| SecretStatus {
            status: status_of(&values, &entry.key),
            entry,
        })
        .collect();

    if out.json {
        println!("{}", json_pretty(&secrets)?);
    } else if secrets.is_empty() {
        println!("no secret descriptors in {}", manifest.display());
    } else {
        let width = secrets.iter().map(|s| s.entry.key.len()).max().unwrap_or(0);
        for s in &secrets {
            println!(
                "{:<width$}  {}  [{}]",
                s.entry.key, s.entry.descriptor, s.status
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
