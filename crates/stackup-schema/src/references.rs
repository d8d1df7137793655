use std::collections::BTreeSet;

/// Variables referenced as `${NAME}` or `${NAME<modifier>...}` in a stack file.
///
/// A reference on a line whose first non-blank characters are `#` or `//`
/// is recorded as commented and does not count as used.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceSet {
    pub active: BTreeSet<String>,
    pub commented: BTreeSet<String>,
}

impl ReferenceSet {
    pub fn parse(text: &str) -> Self {
        let mut set = Self::default();
        for line in text.lines() {
            let trimmed = line.trim_start();
            let commented = trimmed.starts_with('#') || trimmed.starts_with("//");
            for name in scan_line(line) {
                if commented {
                    set.commented.insert(name);
                } else {
                    set.active.insert(name);
                }
            }
        }
        // A name used on any live line is not "only commented".
        set.commented.retain(|n| !set.active.contains(n));
        set
    }

    pub fn contains(&self, name: &str) -> bool {
        self.active.contains(name)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

/// Names referenced on one line, in order of appearance.
pub fn scan_line(line: &str) -> Vec<String> {
    let bytes = line.as_bytes();
    let mut names = Vec::new();
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'$' {
            // `$$` escapes a literal dollar.
            i += 2;
            continue;
        }
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            let start = i + 2;
            let mut end = start;
            while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_') {
                end += 1;
            }
            let name = &line[start..end];
            let valid_start = name
                .bytes()
                .next()
                .is_some_and(|b| b.is_ascii_alphabetic() || b == b'_');
            let terminated = matches!(bytes.get(end), Some(b'}' | b':' | b'-' | b'?' | b'+'));
            if valid_start && terminated {
                names.push(name.to_owned());
            }
            i = end;
            continue;
        }
        i += 1;
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_plain_and_modified_references() {
        let names = scan_line("image: ${REGISTRY:-docker.io}/app:${TAG} ${A-x} ${B:?err} ${C+y}");
        assert_eq!(names, vec!["REGISTRY", "TAG", "A", "B", "C"]);
    }

    #[test]
    fn ignores_escaped_and_bare_dollars() {
        assert!(scan_line("cmd: echo $$HOME $${NOT} $PLAIN ${1BAD}").is_empty());
    }

    #[test]
    fn separates_commented_lines() {
        let text = "\
services:
  db:
    environment:
      POSTGRES_PASSWORD: ${DB_PASSWORD}
      # OLD: ${LEGACY_TOKEN}
      // ALSO: ${DB_PASSWORD}
";
        let refs = ReferenceSet::parse(text);
        assert!(refs.contains("DB_PASSWORD"));
        assert!(!refs.contains("LEGACY_TOKEN"));
        assert_eq!(
            refs.commented.iter().collect::<Vec<_>>(),
            vec!["LEGACY_TOKEN"]
        );
    }
}
