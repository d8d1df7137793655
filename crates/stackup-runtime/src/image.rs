use std::fmt;

const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "[::1]"];

/// A container image reference split into its parts.
///
/// Parsing is lenient: anything that is not a registry authority, tag or
/// digest ends up in `repository`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        let (name, digest) = match reference.split_once('@') {
            Some((n, d)) => (n, Some(d.to_owned())),
            None => (reference, None),
        };

        // A tag colon comes after the last slash; an earlier colon is a registry port.
        let last_slash = name.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => (
                &name[..last_slash + i],
                Some(name[last_slash + i + 1..].to_owned()),
            ),
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if is_registry_authority(first) => {
                (Some(first.to_owned()), rest.to_owned())
            }
            _ => (None, name.to_owned()),
        };

        Self {
            registry,
            repository,
            tag,
            digest,
        }
    }

    /// True for images outside any named registry: no registry authority, or
    /// an explicit local marker.
    pub fn is_local_namespace(&self) -> bool {
        self.registry.is_none() || self.has_local_marker()
    }

    /// A `:local` tag, a `local/` namespace, or a loopback registry authority.
    pub fn has_local_marker(&self) -> bool {
        if self.tag.as_deref() == Some("local") {
            return true;
        }
        if self.registry.is_none() && self.repository.starts_with("local/") {
            return true;
        }
        self.registry.as_deref().is_some_and(|r| {
            let host = strip_port(r);
            LOOPBACK_HOSTS.contains(&host)
        })
    }

    /// Leading numeric component of the tag, e.g. `17` for `17.2-alpine`.
    pub fn major_version(&self) -> Option<u64> {
        let tag = self.tag.as_deref()?;
        let digits: String = tag.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    }

    /// References for the next `count` major versions, for update advisories.
    pub fn next_major_refs(&self, count: u64) -> Vec<String> {
        if self.digest.is_some() || self.has_local_marker() {
            return Vec::new();
        }
        let Some(major) = self.major_version() else {
            return Vec::new();
        };
        (1..=count)
            .map(|step| {
                let next = Self {
                    tag: Some((major + step).to_string()),
                    ..self.clone()
                };
                next.to_string()
            })
            .collect()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn is_registry_authority(component: &str) -> bool {
    component.contains('.')
        || component.contains(':')
        || component.starts_with('[')
        || LOOPBACK_HOSTS.contains(&component)
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        // [::1]:5000
        return authority
            .find(']')
            .map_or(authority, |end| &authority[..=end]);
    }
    authority.split(':').next().unwrap_or(authority)
}
