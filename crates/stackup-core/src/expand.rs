//! `$(command)` and `$NAME` / `${NAME}` / `${NAME:-default}` expansion.
//!
//! Every lookup reads the Environment as it stood when the pass started, so a
//! value never sees another key's expanded result. Command output is inserted
//! literally and is not expanded again.

use stackup_runtime::run_with_timeout;
use stackup_schema::{Environment, Origin};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct ExpansionReport {
    pub expanded: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct Expander<'a> {
    snapshot: BTreeMap<String, String>,
    process_env: &'a BTreeMap<String, String>,
    stack_dir: &'a Path,
    command_timeout: Duration,
}

impl<'a> Expander<'a> {
    pub fn new(
        env: &Environment,
        process_env: &'a BTreeMap<String, String>,
        stack_dir: &'a Path,
        command_timeout: Duration,
    ) -> Self {
        Self {
            snapshot: env.snapshot(),
            process_env,
            stack_dir,
            command_timeout,
        }
    }

    fn lookup(&self, name: &str) -> Option<&str> {
        self.snapshot
            .get(name)
            .or_else(|| self.process_env.get(name))
            .map(String::as_str)
    }

    /// Expand one value. `key` only labels warnings.
    pub fn expand_value(&self, key: &str, value: &str, warnings: &mut Vec<String>) -> String {
        let mut out = String::with_capacity(value.len());
        let mut rest = value;

        while let Some(pos) = rest.find('$') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if tail.starts_with("$$") {
                out.push_str("$$");
                rest = &tail[2..];
            } else if let Some(body) = tail.strip_prefix("$(") {
                match matching_paren(body) {
                    Some(end) => {
                        out.push_str(&self.substitute_command(key, &body[..end], warnings));
                        rest = &body[end + 1..];
                    }
                    None => {
                        out.push_str(tail);
                        rest = "";
                    }
                }
            } else if let Some(body) = tail.strip_prefix("${") {
                match body.find('}') {
                    Some(end) => {
                        match self.braced(&body[..end]) {
                            Some(v) => out.push_str(&v),
                            None => out.push_str(&tail[..end + 3]),
                        }
                        rest = &body[end + 1..];
                    }
                    None => {
                        out.push_str(tail);
                        rest = "";
                    }
                }
            } else {
                let name_len = name_prefix_len(&tail[1..]);
                if name_len == 0 {
                    out.push('$');
                    rest = &tail[1..];
                } else {
                    let name = &tail[1..=name_len];
                    out.push_str(self.lookup(name).unwrap_or(""));
                    rest = &tail[name_len + 1..];
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// `NAME`, `NAME:-default` or `NAME-default`. `None` when the body is not
    /// a plain reference, so the text is kept as written.
    fn braced(&self, body: &str) -> Option<String> {
        let name_len = name_prefix_len(body);
        if name_len == 0 {
            return None;
        }
        let (name, modifier) = body.split_at(name_len);
        let current = self.lookup(name);

        if modifier.is_empty() {
            Some(current.unwrap_or("").to_owned())
        } else if let Some(default) = modifier.strip_prefix(":-") {
            Some(current.filter(|v| !v.is_empty()).unwrap_or(default).to_owned())
        } else if let Some(default) = modifier.strip_prefix('-') {
            Some(current.unwrap_or(default).to_owned())
        } else {
            None
        }
    }

    fn substitute_command(&self, key: &str, command: &str, warnings: &mut Vec<String>) -> String {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(self.stack_dir)
            .envs(&self.snapshot);

        let problem = match run_with_timeout(&mut cmd, self.command_timeout, None) {
            Ok(outcome) if outcome.success() => return outcome.stdout().trim().to_owned(),
            Ok(outcome) if outcome.timed_out() => {
                format!("timed out after {}s", self.command_timeout.as_secs())
            }
            Ok(outcome) => outcome.diagnostic(),
            Err(e) => e.to_string(),
        };
        let msg = format!("{key}: command substitution failed ({problem}); using an empty string");
        warn!("{msg}");
        warnings.push(msg);
        String::new()
    }
}

/// Expand every declared value in place. Literal secrets (generated,
/// prompted, inherited) are left alone.
pub fn expand_environment(
    env: &mut Environment,
    process_env: &BTreeMap<String, String>,
    stack_dir: &Path,
    command_timeout: Duration,
) -> ExpansionReport {
    let expander = Expander::new(env, process_env, stack_dir, command_timeout);
    let mut report = ExpansionReport::default();

    let candidates: Vec<(String, String)> = env
        .iter()
        .filter(|e| !e.origin.is_protected() && e.value.contains('$'))
        .map(|e| (e.key.clone(), e.value.clone()))
        .collect();

    for (key, value) in candidates {
        let expanded = expander.expand_value(&key, &value, &mut report.warnings);
        if expanded != value {
            debug!("expanded {key}");
            env.insert(key.as_str(), expanded, Origin::Expanded);
            report.expanded.push(key);
        }
    }
    report
}

fn name_prefix_len(s: &str) -> usize {
    let bytes = s.as_bytes();
    match bytes.first() {
        Some(b) if b.is_ascii_alphabetic() || *b == b'_' => {}
        _ => return 0,
    }
    bytes
        .iter()
        .take_while(|b| b.is_ascii_alphanumeric() || **b == b'_')
        .count()
}

/// Index of the `)` closing a `$(` whose body starts at `s`.
fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' if depth == 0 => return Some(i),
            ')' => depth -= 1,
            _ => {}
        }
    }
    None
}
