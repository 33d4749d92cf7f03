//! Image references and their grammar.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TaskError;

/// Tag used when a reference omits one.
pub const DEFAULT_TAG: &str = "latest";

const MAX_REPOSITORY_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// An abstract image reference: repository plus tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository, optionally prefixed by a registry host (`host[:port]/`).
    pub repository: String,

    /// Tag within the repository.
    pub tag: String,
}

impl ImageRef {
    /// Create a new ImageRef. No validation happens here.
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }

    /// Parse `repository[:tag]`. The tag separator is the last `:` after the
    /// last `/`, so registry ports are not mistaken for tags.
    pub fn parse(s: &str) -> Result<Self, TaskError> {
        let last_slash = s.rfind('/').map(|i| i + 1).unwrap_or(0);
        let image = match s[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                Self::new(&s[..split], &s[split + 1..])
            }
            None => Self::new(s, DEFAULT_TAG),
        };
        image.validate()?;
        Ok(image)
    }

    /// Key used by the image store (`repository:tag`).
    pub fn cache_key(&self) -> String {
        self.to_string()
    }

    /// Check the repository and tag against the reference grammar.
    pub fn validate(&self) -> Result<(), TaskError> {
        let invalid = |reason: &str| TaskError::InvalidReference {
            reference: self.to_string(),
            reason: reason.to_string(),
        };

        if self.repository.is_empty() {
            return Err(invalid("repository is empty"));
        }
        if self.repository.len() > MAX_REPOSITORY_LEN {
            return Err(invalid("repository is too long"));
        }
        if !valid_tag(&self.tag) {
            return Err(invalid(
                "tag must match [A-Za-z0-9_][A-Za-z0-9_.-]{0,127}",
            ));
        }

        let mut components: Vec<&str> = self.repository.split('/').collect();
        if components.len() > 1 && looks_like_host(components[0]) {
            if !valid_host(components[0]) {
                return Err(invalid("registry host is malformed"));
            }
            components.remove(0);
        }
        if components.iter().any(|c| !valid_path_component(c)) {
            return Err(invalid(
                "repository components must be lowercase alphanumerics separated by '.', '_', '__' or '-'",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

fn valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    tag.len() <= MAX_TAG_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Same heuristic as docker: the first component is a host if it contains a
/// dot or port separator, or is `localhost`.
fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn valid_host(host: &str) -> bool {
    let (name, port) = match host.split_once(':') {
        Some((name, port)) => (name, Some(port)),
        None => (host, None),
    };
    let name_ok = !name.is_empty()
        && name
            .split('.')
            .all(|label| {
                !label.is_empty()
                    && !label.starts_with('-')
                    && !label.ends_with('-')
                    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            });
    let port_ok = port.map_or(true, |p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    name_ok && port_ok
}

/// `[a-z0-9]+((\.|_|__|-+)[a-z0-9]+)*`
fn valid_path_component(component: &str) -> bool {
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let mut i = 0;
    let mut expect_alnum = true;
    while i < bytes.len() {
        if alnum(bytes[i]) {
            while i < bytes.len() && alnum(bytes[i]) {
                i += 1;
            }
            expect_alnum = false;
            continue;
        }
        if expect_alnum {
            return false;
        }
        let sep_len = match bytes[i] {
            b'.' => 1,
            b'_' if bytes.get(i + 1) == Some(&b'_') => 2,
            b'_' => 1,
            b'-' => bytes[i..].iter().take_while(|&&b| b == b'-').count(),
            _ => return false,
        };
        i += sep_len;
        expect_alnum = true;
    }
    !expect_alnum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_tag() {
        let image = ImageRef::parse("rust:1.75-slim").unwrap();
        assert_eq!(image.repository, "rust");
        assert_eq!(image.tag, "1.75-slim");
    }

    #[test]
    fn test_parse_defaults_tag() {
        let image = ImageRef::parse("library/alpine").unwrap();
        assert_eq!(image.tag, DEFAULT_TAG);
    }

    #[test]
    fn test_parse_registry_port_is_not_tag() {
        let image = ImageRef::parse("localhost:5000/team/builder").unwrap();
        assert_eq!(image.repository, "localhost:5000/team/builder");
        assert_eq!(image.tag, "latest");

        let image = ImageRef::parse("registry.example.com:443/ci/rust:nightly").unwrap();
        assert_eq!(image.repository, "registry.example.com:443/ci/rust");
        assert_eq!(image.tag, "nightly");
    }

    #[test]
    fn test_unknown_but_well_formed_reference_is_valid() {
        assert!(ImageRef::new("nonexistent/image", "bogus").validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_references() {
        let cases = [
            ("", "latest"),
            ("Uppercase/repo", "latest"),
            ("repo//double", "latest"),
            ("repo-", "latest"),
            ("repo", ""),
            ("repo", "-leading-dash"),
            ("repo", "has space"),
            ("bad_host.:99/repo", "latest"),
        ];
        for (repository, tag) in cases {
            let err = ImageRef::new(repository, tag).validate().unwrap_err();
            assert!(
                matches!(err, TaskError::InvalidReference { .. }),
                "{repository}:{tag} should be rejected"
            );
        }
    }

    #[test]
    fn test_separators() {
        assert!(valid_path_component("a.b_c__d---e"));
        assert!(!valid_path_component("a___b"));
        assert!(!valid_path_component("a..b"));
        assert!(!valid_path_component("_a"));
    }

    #[test]
    fn test_tag_length_limit() {
        let long = "a".repeat(MAX_TAG_LEN + 1);
        assert!(ImageRef::new("repo", long).validate().is_err());
    }
}
