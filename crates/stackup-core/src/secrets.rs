use crate::CoreError;
use stackup_schema::{
    Assignment, Charset, Environment, ManifestLine, Origin, Provenance, SecretDescriptor,
};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

const MANUAL_MARKER: &str = "set password manually later";

/// Source of operator input for `_EXTERNAL` tokens.
pub trait Prompter {
    /// Ask for `key`. An `Err` carries the reason input could not be obtained.
    fn prompt(&mut self, key: &str, descriptor: &SecretDescriptor) -> Result<String, String>;
}

/// Prompter for runs without a terminal.
pub struct NoPrompt;

impl Prompter for NoPrompt {
    fn prompt(&mut self, _key: &str, _descriptor: &SecretDescriptor) -> Result<String, String> {
        Err("no interactive terminal available".to_owned())
    }
}

/// Result of one synthesis pass over the manifest.
#[derive(Debug, Default)]
pub struct Synthesis {
    pub env: Environment,
    pub generated: Vec<String>,
    pub prompted: Vec<String>,
    pub inherited: Vec<String>,
    pub deferred: Vec<String>,
    pub warnings: Vec<String>,
}

/// Random string of `length` symbols from `charset`, from the OS CSPRNG.
///
/// Bytes at or above the largest multiple of the alphabet size are discarded
/// so every symbol is equally likely.
pub fn generate_secret(charset: Charset, length: usize) -> Result<String, CoreError> {
    let alphabet = charset.alphabet();
    let n = alphabet.len();
    let limit = 256 - (256 % n);
    let mut out = String::with_capacity(length);
    let mut buf = [0u8; 64];

    while out.len() < length {
        getrandom::getrandom(&mut buf).map_err(|e| CoreError::SecretProvisioning {
            key: String::new(),
            reason: format!("OS random source failed: {e}"),
        })?;
        for &b in &buf {
            if usize::from(b) < limit {
                out.push(char::from(alphabet[usize::from(b) % n]));
                if out.len() == length {
                    break;
                }
            }
        }
    }
    Ok(out)
}

/// Secret descriptors declared by the manifest, in manifest order.
pub fn describe_secrets(lines: &[ManifestLine]) -> Result<Vec<SecretDescriptorEntry>, CoreError> {
    let mut out = Vec::new();
    for a in lines.iter().filter_map(ManifestLine::assignment) {
        if let Some(descriptor) = SecretDescriptor::parse(&a.key)? {
            out.push(SecretDescriptorEntry {
                key: a.key.clone(),
                descriptor,
            });
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SecretDescriptorEntry {
    pub key: String,
    #[serde(flatten)]
    pub descriptor: SecretDescriptor,
}

/// Append keys that exist only in the previous output (e.g. values persisted
/// by hooks) so they survive regeneration. Returns the appended keys.
pub fn carry_over(lines: &mut Vec<ManifestLine>, previous: &[ManifestLine]) -> Vec<String> {
    let mut appended = Vec::new();
    for a in previous.iter().filter_map(ManifestLine::assignment) {
        if !lines.iter().any(|l| l.key() == Some(a.key.as_str())) {
            lines.push(ManifestLine::Assignment(Assignment::new(a.key.clone(), "")));
            appended.push(a.key.clone());
        }
    }
    appended
}

fn is_placeholder(value: &str) -> bool {
    value.len() >= 2 && value.starts_with('<') && value.ends_with('>')
}

/// Build the Environment from manifest lines.
///
/// Empty values adopt the non-empty value recorded in `previous`; secrets
/// still empty afterwards are generated, prompted for, or left deferred.
pub fn synthesize(
    lines: &[ManifestLine],
    previous: &HashMap<String, String>,
    process_env: &BTreeMap<String, String>,
    prompter: &mut dyn Prompter,
    interactive: bool,
) -> Result<Synthesis, CoreError> {
    let mut out = Synthesis::default();

    for a in lines.iter().filter_map(ManifestLine::assignment) {
        let key = a.key.as_str();
        let descriptor = SecretDescriptor::parse(key)?;
        let mut value = a.value();

        if is_placeholder(&value)
            && descriptor
                .as_ref()
                .is_some_and(|d| d.provenance == Provenance::Generate)
        {
            debug!("{key}: treating placeholder as empty");
            value.clear();
        }

        if !value.is_empty() {
            if value.contains(MANUAL_MARKER) {
                let msg = format!("{key} still says '{MANUAL_MARKER}'; set it before relying on it");
                warn!("{msg}");
                out.warnings.push(msg);
            }
            out.env.insert(key, value, Origin::Declared);
            continue;
        }

        if let Some(prev) = previous
            .get(key)
            .filter(|v| !v.is_empty() && !is_placeholder(v))
        {
            debug!("{key}=[REDACTED] (inherited from previous output)");
            out.env.insert(key, prev.clone(), Origin::Inherited);
            out.inherited.push(key.to_owned());
            continue;
        }

        let Some(descriptor) = descriptor else {
            out.env.insert(key, "", Origin::Declared);
            continue;
        };

        match descriptor.provenance {
            Provenance::Generate => {
                let secret = generate_secret(descriptor.charset, descriptor.length).map_err(
                    |e| match e {
                        CoreError::SecretProvisioning { reason, .. } => {
                            CoreError::SecretProvisioning {
                                key: key.to_owned(),
                                reason,
                            }
                        }
                        other => other,
                    },
                )?;
                info!("generated {key} ({descriptor})");
                out.env.insert(key, secret, Origin::Generated);
                out.generated.push(key.to_owned());
            }
            Provenance::Prompt => {
                let (value, origin) =
                    obtain_external(key, &descriptor, process_env, prompter, interactive)?;
                out.env.insert(key, value, origin);
                match origin {
                    Origin::Prompted => out.prompted.push(key.to_owned()),
                    _ => out.inherited.push(key.to_owned()),
                }
            }
            Provenance::Deferred => {
                debug!("{key} deferred; left empty for a hook");
                out.env.insert(key, "", Origin::Declared);
                out.deferred.push(key.to_owned());
            }
        }
    }

    Ok(out)
}

fn obtain_external(
    key: &str,
    descriptor: &SecretDescriptor,
    process_env: &BTreeMap<String, String>,
    prompter: &mut dyn Prompter,
    interactive: bool,
) -> Result<(String, Origin), CoreError> {
    let fail = |reason: String| CoreError::SecretProvisioning {
        key: key.to_owned(),
        reason,
    };

    let mut why = "input is non-interactive".to_owned();
    if interactive {
        match prompter.prompt(key, descriptor) {
            Ok(value) if !value.is_empty() => {
                info!("{key}=[REDACTED] entered by operator");
                return Ok((value, Origin::Prompted));
            }
            Ok(_) => return Err(fail("no value entered".to_owned())),
            Err(reason) => {
                debug!("{key}: cannot prompt ({reason})");
                why = reason;
            }
        }
    }

    match process_env.get(key).filter(|v| !v.is_empty()) {
        Some(v) => {
            info!("{key}=[REDACTED] adopted from the process environment");
            Ok((v.clone(), Origin::Inherited))
        }
        None => Err(fail(format!(
            "external token is empty and not set in the process environment ({why})"
        ))),
    }
}
