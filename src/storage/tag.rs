//! Image tag grammar (spec §4.10): `([a-z0-9-]{1,60})/([a-z0-9-]{1,60}):([a-z0-9.]{1,15})`.

use std::fmt;

use stacked_errors::{bail_locationless, Result};

/// A decomposed `<org>/<name>:<version>` image identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTag {
    pub org: String,
    pub name: String,
    pub version: String,
}

impl ImageTag {
    /// Decomposes `s` per the tag grammar; rejects anything that does not
    /// match, including empty segments and characters outside the allowed
    /// class or length.
    pub fn parse(s: &str) -> Result<Self> {
        let (org_name, version) = s
            .split_once(':')
            .ok_or_else(|| stacked_errors::Error::from(format!("invalid tag {s:?}: missing ':'")))?;
        let (org, name) = org_name
            .split_once('/')
            .ok_or_else(|| stacked_errors::Error::from(format!("invalid tag {s:?}: missing '/'")))?;
        if !valid_segment(org, 60, is_org_name_char) {
            bail_locationless!("invalid tag {s:?}: bad org segment {org:?}");
        }
        if !valid_segment(name, 60, is_org_name_char) {
            bail_locationless!("invalid tag {s:?}: bad name segment {name:?}");
        }
        if !valid_segment(version, 15, is_version_char) {
            bail_locationless!("invalid tag {s:?}: bad version segment {version:?}");
        }
        Ok(Self {
            org: org.to_owned(),
            name: name.to_owned(),
            version: version.to_owned(),
        })
    }
}

fn valid_segment(s: &str, max_len: usize, allowed: fn(char) -> bool) -> bool {
    !s.is_empty() && s.len() <= max_len && s.chars().all(allowed)
}

fn is_org_name_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.'
}

impl fmt::Display for ImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.org, self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_valid_tag() {
        let t = ImageTag::parse("combust-labs/alpine-base:3.12.0").unwrap();
        assert_eq!(t.to_string(), "combust-labs/alpine-base:3.12.0");
    }

    #[test]
    fn rejects_missing_parts() {
        assert!(ImageTag::parse("alpine:3.12").is_err());
        assert!(ImageTag::parse("org/name").is_err());
    }

    #[test]
    fn rejects_bad_characters() {
        assert!(ImageTag::parse("Org/name:1.0").is_err());
        assert!(ImageTag::parse("org/name:1_0").is_err());
    }

    #[test]
    fn rejects_oversized_segments() {
        let long_org = "a".repeat(61);
        assert!(ImageTag::parse(&format!("{long_org}/name:1.0")).is_err());
    }
}
