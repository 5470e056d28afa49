//! version.rs — Kernel ABI ordering
//!
//! Kernel images are named `kernel.efi-<ABI>` where the ABI is a Debian
//! package version: `[epoch:]upstream[-revision]`. Ordering follows dpkg:
//! the epoch compares numerically, then upstream and revision are compared
//! as alternating non-digit / digit runs. In non-digit runs `~` sorts before
//! everything (even the end of the string), letters sort before other
//! characters; digit runs compare as numbers.
//!
//! A string that does not parse never takes part in an ordering decision;
//! callers parse everything first and only then sort.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    #[error("version string is empty")]
    Empty,
    #[error("epoch {0:?} is not a non-negative integer")]
    InvalidEpoch(String),
    #[error("upstream version is empty")]
    EmptyUpstream,
    #[error("upstream version {0:?} must start with a digit")]
    UpstreamNotDigit(String),
    #[error("invalid character {1:?} in upstream version {0:?}")]
    InvalidUpstreamChar(String, char),
    #[error("revision is empty")]
    EmptyRevision,
    #[error("invalid character {1:?} in revision {0:?}")]
    InvalidRevisionChar(String, char),
}

/// A parsed Debian package version.
///
/// Equality is dpkg equality, so `1.0` and `1.00` compare equal even though
/// they print differently.
#[derive(Debug, Clone)]
pub struct Version {
    raw: String,
    epoch: u64,
    upstream: String,
    revision: String,
}

impl Version {
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(VersionError::Empty);
        }

        let (epoch, rest) = match raw.split_once(':') {
            Some((e, rest)) => {
                let epoch = e
                    .parse::<u64>()
                    .map_err(|_| VersionError::InvalidEpoch(e.to_string()))?;
                (epoch, rest)
            }
            None => (0, raw),
        };

        let (upstream, revision) = match rest.rfind('-') {
            Some(idx) => {
                let revision = &rest[idx + 1..];
                if revision.is_empty() {
                    return Err(VersionError::EmptyRevision);
                }
                (&rest[..idx], revision)
            }
            None => (rest, ""),
        };

        verify_upstream(upstream)?;
        verify_revision(revision)?;

        Ok(Self {
            raw: raw.to_string(),
            epoch,
            upstream: upstream.to_string(),
            revision: revision.to_string(),
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    /// Debian revision, empty for native versions.
    pub fn revision(&self) -> &str {
        &self.revision
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

fn verify_upstream(upstream: &str) -> Result<(), VersionError> {
    let first = upstream.chars().next().ok_or(VersionError::EmptyUpstream)?;
    if !first.is_ascii_digit() {
        return Err(VersionError::UpstreamNotDigit(upstream.to_string()));
    }
    if let Some(c) = upstream
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || ".+-~:".contains(*c)))
    {
        return Err(VersionError::InvalidUpstreamChar(upstream.to_string(), c));
    }
    Ok(())
}

fn verify_revision(revision: &str) -> Result<(), VersionError> {
    if let Some(c) = revision
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || ".+~".contains(*c)))
    {
        return Err(VersionError::InvalidRevisionChar(revision.to_string(), c));
    }
    Ok(())
}

/// dpkg character weight inside a non-digit run. `None` is end of string.
fn weight(c: Option<u8>) -> i32 {
    match c {
        None => 0,
        Some(c) if c.is_ascii_digit() => 0,
        Some(c) if c.is_ascii_alphabetic() => c as i32,
        Some(b'~') => -1,
        Some(c) => c as i32 + 256,
    }
}

fn is_digit(c: Option<&u8>) -> bool {
    c.map_or(false, u8::is_ascii_digit)
}

/// Compare two version fragments (upstream or revision) the dpkg way.
fn compare_fragment(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let (mut i, mut j) = (0, 0);

    while i < a.len() || j < b.len() {
        // non-digit run
        while (i < a.len() && !a[i].is_ascii_digit()) || (j < b.len() && !b[j].is_ascii_digit()) {
            let (wa, wb) = (weight(a.get(i).copied()), weight(b.get(j).copied()));
            if wa != wb {
                return wa.cmp(&wb);
            }
            i += 1;
            j += 1;
        }

        // digit run, leading zeros ignored
        while a.get(i) == Some(&b'0') {
            i += 1;
        }
        while b.get(j) == Some(&b'0') {
            j += 1;
        }
        let mut first_diff = Ordering::Equal;
        while is_digit(a.get(i)) && is_digit(b.get(j)) {
            if first_diff == Ordering::Equal {
                first_diff = a[i].cmp(&b[j]);
            }
            i += 1;
            j += 1;
        }
        if is_digit(a.get(i)) {
            return Ordering::Greater;
        }
        if is_digit(b.get(j)) {
            return Ordering::Less;
        }
        if first_diff != Ordering::Equal {
            return first_diff;
        }
    }
    Ordering::Equal
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch
            .cmp(&other.epoch)
            .then_with(|| compare_fragment(&self.upstream, &other.upstream))
            .then_with(|| compare_fragment(&self.revision, &other.revision))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn splits_epoch_upstream_revision() {
        let ver = v("2:5.15.0-1001-azure");
        assert_eq!(ver.epoch(), 2);
        assert_eq!(ver.upstream(), "5.15.0-1001");
        assert_eq!(ver.revision(), "azure");
        assert_eq!(ver.to_string(), "2:5.15.0-1001-azure");
    }

    #[test]
    fn kernel_abis_compare_numerically() {
        assert!(v("5.4.0-10") > v("5.4.0-9"));
        assert!(v("5.10.0-1") > v("5.9.0-100"));
        assert!(v("5.4.0-10") < v("5.4.1-1"));
    }

    #[test]
    fn tilde_sorts_before_release() {
        assert!(v("1.0~rc1") < v("1.0"));
        assert!(v("1.0~rc1") < v("1.0~rc2"));
        assert!(v("1.0~~") < v("1.0~"));
    }

    #[test]
    fn letters_sort_before_symbols() {
        assert!(v("1.0a") > v("1.0"));
        assert!(v("1.0+") > v("1.0a"));
    }

    #[test]
    fn epoch_dominates() {
        assert!(v("1:0.1") > v("9.9"));
        assert_eq!(v("0:1.0"), v("1.0"));
    }

    #[test]
    fn leading_zeros_are_insignificant() {
        assert_eq!(v("1.00").cmp(&v("1.0")), Ordering::Equal);
        assert_eq!(v("1.001"), v("1.1"));
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(Version::parse(""), Err(VersionError::Empty));
        assert_eq!(Version::parse("  "), Err(VersionError::Empty));
        assert!(matches!(Version::parse("x:1.0"), Err(VersionError::InvalidEpoch(_))));
        assert!(matches!(Version::parse("-1:1.0"), Err(VersionError::InvalidEpoch(_))));
        assert!(matches!(Version::parse("abc"), Err(VersionError::UpstreamNotDigit(_))));
        assert!(matches!(Version::parse("1.0_1"), Err(VersionError::InvalidUpstreamChar(_, '_'))));
        assert!(matches!(Version::parse("1.0-a_b"), Err(VersionError::InvalidRevisionChar(_, '_'))));
        assert_eq!(Version::parse("1.0-"), Err(VersionError::EmptyRevision));
        assert_eq!(Version::parse("1:"), Err(VersionError::EmptyUpstream));
    }

    fn version_string() -> impl Strategy<Value = String> {
        (
            proptest::option::of(0u8..3),
            "[0-9][0-9a-z.+~]{0,7}",
            proptest::option::of("[0-9a-z.+~]{1,5}"),
        )
            .prop_map(|(epoch, upstream, revision)| {
                let mut s = String::new();
                if let Some(e) = epoch {
                    s.push_str(&format!("{}:", e));
                }
                s.push_str(&upstream);
                if let Some(r) = revision {
                    s.push('-');
                    s.push_str(&r);
                }
                s
            })
    }

    proptest! {
        #[test]
        fn generated_versions_parse(s in version_string()) {
            prop_assert!(Version::parse(&s).is_ok());
        }

        #[test]
        fn order_is_antisymmetric(a in version_string(), b in version_string()) {
            let (a, b) = (v(&a), v(&b));
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        }

        #[test]
        fn order_is_transitive(a in version_string(), b in version_string(), c in version_string()) {
            let (a, b, c) = (v(&a), v(&b), v(&c));
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
            if a >= b && b >= c {
                prop_assert!(a >= c);
            }
        }

        #[test]
        fn descending_sort_is_idempotent(list in proptest::collection::vec(version_string(), 0..12)) {
            let mut once: Vec<Version> = list.iter().map(|s| v(s)).collect();
            once.sort_by(|a, b| b.cmp(a));
            let mut twice = once.clone();
            twice.sort_by(|a, b| b.cmp(a));
            let once: Vec<String> = once.iter().map(|v| v.to_string()).collect();
            let twice: Vec<String> = twice.iter().map(|v| v.to_string()).collect();
            prop_assert_eq!(once, twice);
        }
    }
}
