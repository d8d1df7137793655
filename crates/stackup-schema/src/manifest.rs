use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use thiserror::Error;

use crate::environment::Environment;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest file: {0}")]
    Io(#[from] std::io::Error),
    #[error("manifest file not found: {0}")]
    NotFound(String),
    #[error("line {line}: expected KEY=VALUE, a comment, or a blank line: '{content}'")]
    MalformedLine { line: usize, content: String },
    #[error("line {line}: invalid variable name '{key}'")]
    InvalidKey { line: usize, key: String },
    #[error("line {line}: duplicate variable '{key}' (first defined on line {first})")]
    DuplicateKey {
        line: usize,
        key: String,
        first: usize,
    },
    #[error("line {line}: unterminated quote in value of '{key}'")]
    UnterminatedQuote { line: usize, key: String },
    #[error("invalid secret descriptor '{key}': {reason}")]
    InvalidDescriptor { key: String, reason: String },
}

/// One line of an env manifest, kept in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLine {
    Blank(String),
    Comment(String),
    Assignment(Assignment),
}

/// A `KEY=VALUE [# comment]` line.
///
/// `raw_value` is the value exactly as written (quotes included);
/// `trailing_comment` is everything after the value, leading whitespace included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub key: String,
    pub raw_value: String,
    pub trailing_comment: String,
}

impl Assignment {
    pub fn new(key: impl Into<String>, raw_value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            raw_value: raw_value.into(),
            trailing_comment: String::new(),
        }
    }

    /// The value with surrounding quotes removed.
    pub fn value(&self) -> String {
        unquote(&self.raw_value)
    }

    /// Render this line with `value` substituted, keeping the original
    /// spelling when the value did not change.
    pub fn render_with(&self, value: &str) -> String {
        if value == self.value() {
            return format!("{}={}{}", self.key, self.raw_value, self.trailing_comment);
        }
        let rendered = quote_if_needed(value);
        // A comment glued to the old (empty) value would otherwise become part of the new one.
        let sep = if self.trailing_comment.starts_with('#') && !rendered.is_empty() {
            " "
        } else {
            ""
        };
        format!("{}={rendered}{sep}{}", self.key, self.trailing_comment)
    }
}

impl ManifestLine {
    pub fn assignment(&self) -> Option<&Assignment> {
        match self {
            Self::Assignment(a) => Some(a),
            Self::Blank(_) | Self::Comment(_) => None,
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.assignment().map(|a| a.key.as_str())
    }
}

pub fn parse_manifest_str(input: &str) -> Result<Vec<ManifestLine>, ManifestError> {
    let mut lines = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (idx, raw) in input.lines().enumerate() {
        let line_no = idx + 1;
        let line = parse_line(raw, line_no)?;
        if let ManifestLine::Assignment(a) = &line {
            if let Some(first) = seen.insert(a.key.clone(), line_no) {
                return Err(ManifestError::DuplicateKey {
                    line: line_no,
                    key: a.key.clone(),
                    first,
                });
            }
        }
        lines.push(line);
    }

    Ok(lines)
}

pub fn parse_manifest_file(path: impl AsRef<Path>) -> Result<Vec<ManifestLine>, ManifestError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ManifestError::NotFound(path.display().to_string())
        } else {
            ManifestError::Io(e)
        }
    })?;
    parse_manifest_str(&content)
}

/// Read the unquoted values of a previously written env file.
pub fn read_env_values(path: impl AsRef<Path>) -> Result<HashMap<String, String>, ManifestError> {
    let lines = parse_manifest_file(path)?;
    Ok(lines
        .iter()
        .filter_map(ManifestLine::assignment)
        .map(|a| (a.key.clone(), a.value()))
        .collect())
}

/// Render the output env file: every manifest line in order, with values
/// taken from `env` where present.
pub fn render_env_file(lines: &[ManifestLine], env: &Environment) -> String {
    let mut out = String::new();
    for line in lines {
        match line {
            ManifestLine::Blank(text) | ManifestLine::Comment(text) => out.push_str(text),
            ManifestLine::Assignment(a) => {
                let rendered = match env.get(&a.key) {
                    Some(value) => a.render_with(value),
                    None => a.render_with(&a.value()),
                };
                out.push_str(&rendered);
            }
        }
        out.push('\n');
    }
    out
}

/// Atomically replace `path` with `content`.
///
/// Returns `false` without touching the file when it already holds `content`.
/// The temp file is created with mode 0600 and keeps it after the rename.
pub fn write_env_file(path: impl AsRef<Path>, content: &str) -> Result<bool, std::io::Error> {
    let path = path.as_ref();
    if let Ok(existing) = fs::read_to_string(path) {
        if existing == content {
            return Ok(false);
        }
    }

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    // Fsync parent directory so the rename survives power loss.
    if let Ok(f) = fs::File::open(dir) {
        let _ = f.sync_all();
    }
    Ok(true)
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_line(raw: &str, line: usize) -> Result<ManifestLine, ManifestError> {
    let trimmed = raw.trim_start();
    if trimmed.is_empty() {
        return Ok(ManifestLine::Blank(raw.to_owned()));
    }
    if trimmed.starts_with('#') {
        return Ok(ManifestLine::Comment(raw.to_owned()));
    }

    let Some((key_part, rest)) = trimmed.split_once('=') else {
        return Err(ManifestError::MalformedLine {
            line,
            content: raw.to_owned(),
        });
    };
    let key = key_part.trim_end();
    if !is_valid_key(key) {
        return Err(ManifestError::InvalidKey {
            line,
            key: key.to_owned(),
        });
    }

    let (raw_value, trailing_comment) = split_value(rest).ok_or_else(|| {
        ManifestError::UnterminatedQuote {
            line,
            key: key.to_owned(),
        }
    })?;

    let after = trailing_comment.trim_start();
    if !after.is_empty() && !after.starts_with('#') {
        return Err(ManifestError::MalformedLine {
            line,
            content: raw.to_owned(),
        });
    }

    Ok(ManifestLine::Assignment(Assignment {
        key: key.to_owned(),
        raw_value,
        trailing_comment,
    }))
}

/// Split the text after `=` into `(raw_value, trailing)`.
///
/// Returns `None` for an unterminated quoted value.
fn split_value(rest: &str) -> Option<(String, String)> {
    let body = rest.trim_start();

    if let Some(quote) = body.chars().next().filter(|c| *c == '"' || *c == '\'') {
        let mut escaped = false;
        for (i, c) in body.char_indices().skip(1) {
            if quote == '"' {
                if escaped {
                    escaped = false;
                    continue;
                }
                if c == '\\' {
                    escaped = true;
                    continue;
                }
            }
            if c == quote {
                let end = i + c.len_utf8();
                return Some((body[..end].to_owned(), body[end..].to_owned()));
            }
        }
        return None;
    }

    // Unquoted: a `#` starts the comment at the value start or after
    // whitespace, but never inside `$( ... )`.
    let chars: Vec<(usize, char)> = body.char_indices().collect();
    let mut depth = 0usize;
    let mut prev_ws = true;
    let mut cut = body.len();
    let mut i = 0;
    while i < chars.len() {
        let (pos, c) = chars[i];
        if c == '$' && chars.get(i + 1).map(|(_, n)| *n) == Some('(') {
            depth += 1;
            prev_ws = false;
            i += 2;
            continue;
        }
        match c {
            '(' if depth > 0 => depth += 1,
            ')' if depth > 0 => depth -= 1,
            '#' if depth == 0 && prev_ws => {
                cut = pos;
                break;
            }
            _ => {}
        }
        prev_ws = c.is_whitespace();
        i += 1;
    }

    let value = body[..cut].trim_end();
    Some((value.to_owned(), body[value.len()..].to_owned()))
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return raw[1..raw.len() - 1].to_owned();
    }
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some(n @ ('"' | '\\')) => out.push(n),
                    Some(n) => {
                        out.push('\\');
                        out.push(n);
                    }
                    None => out.push('\\'),
                }
            } else {
                out.push(c);
            }
        }
        return out;
    }
    raw.to_owned()
}

fn quote_if_needed(value: &str) -> String {
    let needs_quotes = value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '\\'));
    if !needs_quotes {
        return value.to_owned();
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
