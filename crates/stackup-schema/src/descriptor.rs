//! Secret descriptors encoded in variable-name suffixes.
//!
//! ```text
//! BASE_PASSWORD[_ALNUMn|_HEXn][_DEFERRED]
//! BASE_TOKEN[_ALNUMn|_HEXn]_INTERNAL
//! BASE_TOKEN[_ALNUMn|_HEXn]_EXTERNAL
//! BASE_TOKEN[_ALNUMn|_HEXn][_INTERNAL|_EXTERNAL]_DEFERRED
//! ```
//!
//! `_DEFERED` is accepted as a spelling of `_DEFERRED`.

use serde::Serialize;
use std::fmt;

use crate::manifest::ManifestError;

pub const DEFAULT_SECRET_LENGTH: usize = 20;
pub const MAX_SECRET_LENGTH: usize = 4096;

const ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const HEX: &[u8] = b"0123456789abcdef";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    Password,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Charset {
    /// Default for undecorated keys: letters and digits.
    Mixed,
    Alnum,
    Hex,
}

impl Charset {
    pub fn alphabet(self) -> &'static [u8] {
        match self {
            Self::Mixed | Self::Alnum => ALNUM,
            Self::Hex => HEX,
        }
    }

    /// True when every character of `s` belongs to this charset.
    pub fn matches(self, s: &str) -> bool {
        let alphabet = self.alphabet();
        s.bytes().all(|b| alphabet.contains(&b))
    }
}

/// How a secret's value is obtained when the manifest leaves it empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Generate,
    Prompt,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecretDescriptor {
    pub base: String,
    pub family: Family,
    pub charset: Charset,
    pub length: usize,
    pub provenance: Provenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Internal,
    External,
}

enum CharsetSuffix<'a> {
    Absent,
    Parsed(&'a str, Charset, usize),
    Invalid(String),
}

impl SecretDescriptor {
    /// Classify `key`.
    ///
    /// `Ok(None)` means the key is a plain variable. An error is returned only
    /// when the key matches the grammar but carries an out-of-range length.
    pub fn parse(key: &str) -> Result<Option<Self>, ManifestError> {
        let mut rest = key;

        let deferred = if let Some(r) = rest
            .strip_suffix("_DEFERRED")
            .or_else(|| rest.strip_suffix("_DEFERED"))
        {
            rest = r;
            true
        } else {
            false
        };

        let scope = if let Some(r) = rest.strip_suffix("_INTERNAL") {
            rest = r;
            Some(Scope::Internal)
        } else if let Some(r) = rest.strip_suffix("_EXTERNAL") {
            rest = r;
            Some(Scope::External)
        } else {
            None
        };

        let (rest, charset, length, invalid) = match strip_charset(rest) {
            CharsetSuffix::Absent => (rest, Charset::Mixed, DEFAULT_SECRET_LENGTH, None),
            CharsetSuffix::Parsed(r, charset, n) => (r, charset, n, None),
            CharsetSuffix::Invalid(reason) => {
                // Only an error if the remainder is a real descriptor.
                let r = rest.rsplit_once('_').map_or(rest, |(head, _)| head);
                (r, Charset::Mixed, 0, Some(reason))
            }
        };

        let (base, family) = if let Some(base) = rest.strip_suffix("_TOKEN") {
            if scope.is_none() && !deferred {
                return Ok(None);
            }
            (base, Family::Token)
        } else if let Some(base) = rest.strip_suffix("_PASSWORD") {
            if scope.is_some() {
                return Ok(None);
            }
            (base, Family::Password)
        } else {
            return Ok(None);
        };

        if base.is_empty() {
            return Ok(None);
        }

        if let Some(reason) = invalid {
            return Err(ManifestError::InvalidDescriptor {
                key: key.to_owned(),
                reason,
            });
        }

        let provenance = if deferred {
            Provenance::Deferred
        } else if scope == Some(Scope::External) {
            Provenance::Prompt
        } else {
            Provenance::Generate
        };

        Ok(Some(Self {
            base: base.to_owned(),
            family,
            charset,
            length,
            provenance,
        }))
    }

    pub fn is_deferred(&self) -> bool {
        self.provenance == Provenance::Deferred
    }
}

impl fmt::Display for SecretDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let family = match self.family {
            Family::Password => "password",
            Family::Token => "token",
        };
        let charset = match self.charset {
            Charset::Mixed => "mixed",
            Charset::Alnum => "alnum",
            Charset::Hex => "hex",
        };
        let provenance = match self.provenance {
            Provenance::Generate => "generate",
            Provenance::Prompt => "prompt",
            Provenance::Deferred => "deferred",
        };
        write!(f, "{family} {charset}/{} {provenance}", self.length)
    }
}

fn strip_charset(rest: &str) -> CharsetSuffix<'_> {
    let Some((head, segment)) = rest.rsplit_once('_') else {
        return CharsetSuffix::Absent;
    };
    let (charset, digits) = if let Some(d) = segment.strip_prefix("ALNUM") {
        (Charset::Alnum, d)
    } else if let Some(d) = segment.strip_prefix("HEX") {
        (Charset::Hex, d)
    } else {
        return CharsetSuffix::Absent;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return CharsetSuffix::Absent;
    }
    match digits.parse::<usize>() {
        Ok(n) if (1..=MAX_SECRET_LENGTH).contains(&n) => CharsetSuffix::Parsed(head, charset, n),
        _ => CharsetSuffix::Invalid(format!(
            "length {digits} is outside 1..={MAX_SECRET_LENGTH}"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(key: &str) -> Option<SecretDescriptor> {
        SecretDescriptor::parse(key).unwrap()
    }

    #[test]
    fn plain_password_uses_defaults() {
        let d = parse("DB_PASSWORD").unwrap();
        assert_eq!(d.base, "DB");
        assert_eq!(d.family, Family::Password);
        assert_eq!(d.charset, Charset::Mixed);
        assert_eq!(d.length, DEFAULT_SECRET_LENGTH);
        assert_eq!(d.provenance, Provenance::Generate);
    }

    #[test]
    fn charset_and_length_suffixes() {
        let d = parse("API_TOKEN_ALNUM16_INTERNAL").unwrap();
        assert_eq!(d.base, "API");
        assert_eq!(d.family, Family::Token);
        assert_eq!((d.charset, d.length), (Charset::Alnum, 16));
        assert_eq!(d.provenance, Provenance::Generate);

        let d = parse("SESSION_PASSWORD_HEX64").unwrap();
        assert_eq!((d.charset, d.length), (Charset::Hex, 64));
    }

    #[test]
    fn external_tokens_prompt() {
        let d = parse("GITHUB_TOKEN_EXTERNAL").unwrap();
        assert_eq!(d.provenance, Provenance::Prompt);
    }

    #[test]
    fn deferred_in_both_spellings() {
        assert!(parse("SMTP_PASSWORD_DEFERRED").unwrap().is_deferred());
        assert!(parse("SMTP_PASSWORD_DEFERED").unwrap().is_deferred());
        assert!(parse("CI_TOKEN_DEFERRED").unwrap().is_deferred());
        assert!(parse("CI_TOKEN_HEX8_EXTERNAL_DEFERRED").unwrap().is_deferred());
    }

    #[test]
    fn plain_variables_are_not_descriptors() {
        for key in [
            "PORT",
            "PASSWORD",
            "_PASSWORD",
            "API_TOKEN",
            "X_PASSWORD_INTERNAL",
            "X_PASSWORD_DEFERRED_HEX8",
            "DATA_HOSTDIR",
            "FOO_HEX0",
            "FOO_ALNUM",
        ] {
            assert_eq!(parse(key), None, "{key}");
        }
    }

    #[test]
    fn charset_words_in_base_are_literal() {
        let d = parse("DB_HEX_PASSWORD").unwrap();
        assert_eq!(d.base, "DB_HEX");
        assert_eq!(d.charset, Charset::Mixed);
    }

    #[test]
    fn out_of_range_length_is_an_error() {
        for key in ["X_PASSWORD_HEX0", "X_TOKEN_ALNUM5000_INTERNAL"] {
            let err = SecretDescriptor::parse(key).unwrap_err();
            assert!(
                matches!(err, ManifestError::InvalidDescriptor { .. }),
                "{key}"
            );
        }
    }

    #[test]
    fn charset_membership() {
        assert!(Charset::Hex.matches("deadbeef09"));
        assert!(!Charset::Hex.matches("DEADBEEF"));
        assert!(Charset::Alnum.matches("abcXYZ019"));
        assert!(!Charset::Alnum.matches("abc-1"));
        assert!(!Charset::Mixed.matches("has space"));
        assert!(!Charset::Mixed.matches("quote\""));
    }
}
