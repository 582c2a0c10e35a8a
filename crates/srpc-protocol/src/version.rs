//! Protocol version parsing and ordering.
//!
//! Version strings exchanged during the handshake are free text: a numeric
//! major followed by up to three more components, any of which may carry a
//! pre-release tag (`"2.0.0-beta"`, `"1.1alpha3"`). Parsing never fails; a
//! string that does not start with a number yields the zero version.
//!
//! Ordering compares the numeric components first and then falls back to a
//! per-component string comparison in which an untagged component sorts above
//! a tagged one with the same leading number (`"1.1" > "1.1alpha"`).
//! Missing trailing components count as zero, so `"1.2" == "1.2.0"`.

use std::cmp::Ordering;
use std::convert::Infallible;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

const PART_COUNT: usize = 4;

static VERSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<major>\d+)(\.?(?P<minor>[^.]+))?(\.?(?P<patch>[^.]+))?(\.?(?P<build>.+))?")
        .expect("version pattern is valid")
});

/// A parsed protocol version. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProtocolVersion {
    raw: String,
    major: i32,
    minor: i32,
    patch: i32,
    build: i32,
    special: Option<String>,
    is_alpha: bool,
    is_beta: bool,
    /// Numeric components actually consumed, in order.
    int_parts: [i32; PART_COUNT],
    /// Every slot as text; `"0"` for slots that were not present.
    string_parts: [String; PART_COUNT],
    /// Number of leading numeric components in `int_parts`.
    parts: usize,
    parsed: bool,
}

impl ProtocolVersion {
    /// Parse a version string. Never fails.
    pub fn parse(version: &str) -> Self {
        let raw = version.trim();
        let mut v = Self::zero(raw);

        if raw.is_empty() {
            return v;
        }
        let Some(caps) = VERSION_PATTERN.captures(raw) else {
            return v;
        };
        let Ok(major) = caps["major"].parse::<i32>() else {
            return v;
        };

        v.int_parts[0] = major;
        v.string_parts[0] = major.to_string();
        v.parts = 1;

        for slot in ["minor", "patch", "build"] {
            let Some(m) = caps.name(slot) else {
                break;
            };
            match m.as_str().trim().parse::<i32>() {
                Ok(n) => {
                    v.int_parts[v.parts] = n;
                    v.string_parts[v.parts] = n.to_string();
                    v.parts += 1;
                }
                Err(_) => {
                    // A tag ends numeric parsing; it stands in for the rest of the string.
                    let special = m.as_str().trim_end().to_string();
                    v.string_parts[v.parts] = special.clone();
                    v.special = Some(special);
                    break;
                }
            }
        }

        v.major = v.int_parts[0];
        v.minor = v.int_parts[1];
        v.patch = v.int_parts[2];
        v.build = v.int_parts[3];
        if let Some(special) = &v.special {
            v.is_alpha = special.contains("alpha");
            v.is_beta = special.contains("beta");
        }
        v.parsed = true;
        v
    }

    /// Parse an optional version string; `None` behaves like `""`.
    pub fn parse_opt(version: Option<&str>) -> Self {
        Self::parse(version.unwrap_or_default())
    }

    fn zero(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            major: 0,
            minor: 0,
            patch: 0,
            build: 0,
            special: None,
            is_alpha: false,
            is_beta: false,
            int_parts: [0; PART_COUNT],
            string_parts: std::array::from_fn(|_| "0".to_string()),
            parts: 0,
            parsed: false,
        }
    }

    pub fn major(&self) -> i32 {
        self.major
    }

    pub fn minor(&self) -> i32 {
        self.minor
    }

    pub fn patch(&self) -> i32 {
        self.patch
    }

    pub fn build(&self) -> i32 {
        self.build
    }

    /// The first non-numeric component, if any (`"0-beta"` in `"2.0.0-beta"`).
    pub fn special(&self) -> Option<&str> {
        self.special.as_deref()
    }

    pub fn is_alpha(&self) -> bool {
        self.is_alpha
    }

    pub fn is_beta(&self) -> bool {
        self.is_beta
    }

    pub fn is_unstable(&self) -> bool {
        self.special.is_some()
    }

    /// Whether the raw string matched the version pattern at all.
    pub fn is_parsed(&self) -> bool {
        self.parsed
    }

    /// The trimmed source string.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Decide which version two peers speak.
    ///
    /// The client must have a parseable version with the server's major and,
    /// when `minimum` is set, must not be older than it. The agreed version is
    /// the lower of the two.
    pub fn negotiate(
        server: &ProtocolVersion,
        minimum: Option<&ProtocolVersion>,
        client: &ProtocolVersion,
    ) -> Result<ProtocolVersion, VersionMismatch> {
        let compatible = client.is_parsed()
            && client.major() == server.major()
            && minimum.is_none_or(|min| client >= min);

        if !compatible {
            return Err(VersionMismatch {
                client: client.clone(),
                server: server.clone(),
                minimum: minimum.cloned(),
            });
        }

        Ok(if client < server { client.clone() } else { server.clone() })
    }

    fn key(&self) -> (i32, i32, i32, i32, Option<&str>) {
        (self.major, self.minor, self.patch, self.build, self.special())
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::zero("")
    }
}

impl FromStr for ProtocolVersion {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<String> for ProtocolVersion {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&str> for ProtocolVersion {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<ProtocolVersion> for String {
    fn from(v: ProtocolVersion) -> Self {
        v.raw
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Ord for ProtocolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.raw == other.raw {
            return Ordering::Equal;
        }
        match (self.parsed, other.parsed) {
            (false, false) => return Ordering::Equal,
            (false, true) => return Ordering::Less,
            (true, false) => return Ordering::Greater,
            (true, true) => {}
        }

        let shared = self.parts.min(other.parts);
        for i in 0..shared {
            if self.int_parts[i] != other.int_parts[i] {
                return self.int_parts[i].cmp(&other.int_parts[i]);
            }
        }

        for i in 1..PART_COUNT {
            let ord = compare_components(&self.string_parts[i], &other.string_parts[i]);
            if ord != Ordering::Equal {
                return ord;
            }
        }

        // Keep `Equal` in step with the component-wise equality.
        self.key().cmp(&other.key())
    }
}

impl PartialOrd for ProtocolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ProtocolVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ProtocolVersion {}

impl Hash for ProtocolVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parsed.hash(state);
        self.key().hash(state);
    }
}

/// Compare two components by leading number, then by tag.
fn compare_components(lhs: &str, rhs: &str) -> Ordering {
    let (lhs_number, lhs_suffix) = split_leading_number(lhs);
    let (rhs_number, rhs_suffix) = split_leading_number(rhs);

    if lhs_number != rhs_number {
        return lhs_number.cmp(&rhs_number);
    }

    match (lhs_suffix, rhs_suffix) {
        (None, None) => Ordering::Equal,
        // "1.1" sorts above "1.1alpha"
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(l), Some(r)) => l.cmp(r),
    }
}

/// Leading digit run as a number (0 when absent or out of range) and the rest.
fn split_leading_number(component: &str) -> (i32, Option<&str>) {
    match component.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => (
            component[..pos].parse().unwrap_or(0),
            Some(&component[pos..]),
        ),
        None => (component.parse().unwrap_or(0), None),
    }
}

/// Returned by [`ProtocolVersion::negotiate`] when the peers cannot agree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("client protocol version '{client}' is not compatible with server version '{server}'")]
pub struct VersionMismatch {
    pub client: ProtocolVersion,
    pub server: ProtocolVersion,
    pub minimum: Option<ProtocolVersion>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> ProtocolVersion {
        ProtocolVersion::parse(s)
    }

    #[test]
    fn parses_four_numeric_parts() {
        let ver = v("1.2.3.4");
        assert_eq!((ver.major(), ver.minor(), ver.patch(), ver.build()), (1, 2, 3, 4));
        assert!(ver.special().is_none());
        assert!(!ver.is_unstable());
        assert!(ver.is_parsed());
    }

    #[test]
    fn missing_parts_are_zero() {
        let ver = v("7");
        assert_eq!((ver.major(), ver.minor(), ver.patch(), ver.build()), (7, 0, 0, 0));
    }

    #[test]
    fn input_is_trimmed() {
        let ver = v("  1.5 \n");
        assert_eq!(ver.as_str(), "1.5");
        assert_eq!(ver.minor(), 5);
    }

    #[test]
    fn empty_and_absent_are_zero_version() {
        assert_eq!(v(""), ProtocolVersion::parse_opt(None));
        assert_eq!(v("   "), ProtocolVersion::default());
        let zero = ProtocolVersion::default();
        assert!(!zero.is_parsed());
        assert_eq!((zero.major(), zero.minor(), zero.patch(), zero.build()), (0, 0, 0, 0));
        assert!(!zero.is_unstable());
    }

    #[test]
    fn garbage_degrades_to_zero() {
        for s in ["abc", "v1.2", ".1", "-3", "99999999999999.1"] {
            let ver = v(s);
            assert!(!ver.is_parsed(), "{s} should not parse");
            assert_eq!(ver.major(), 0);
            assert!(!ver.is_unstable());
        }
    }

    #[test]
    fn beta_tag_marks_unstable() {
        let ver = v("2.0.0-beta");
        assert_eq!((ver.major(), ver.minor(), ver.patch()), (2, 0, 0));
        assert_eq!(ver.special(), Some("0-beta"));
        assert!(ver.is_beta());
        assert!(!ver.is_alpha());
        assert!(ver.is_unstable());
    }

    #[test]
    fn alpha_tag_stops_numeric_parsing() {
        let ver = v("1.1alpha3.5");
        assert_eq!(ver.major(), 1);
        assert_eq!(ver.minor(), 0);
        assert_eq!(ver.patch(), 0);
        assert_eq!(ver.special(), Some("1alpha3"));
        assert!(ver.is_alpha());
    }

    #[test]
    fn tag_match_is_case_sensitive() {
        let ver = v("1.0Beta");
        assert!(ver.is_unstable());
        assert!(!ver.is_beta());
    }

    #[test]
    fn parse_is_reflexive_and_roundtrips_through_display() {
        for s in ["", "1", "1.2.3", "2.0.0-beta", "1.1alpha", "junk", "3.4.5.6"] {
            assert_eq!(v(s), v(s));
            assert_eq!(v(&v(s).to_string()), v(s));
        }
    }

    #[test]
    fn numeric_ordering() {
        assert!(v("1.2.3") < v("1.2.4"));
        assert!(v("1.10") > v("1.9"));
        assert!(v("2") > v("1.9.9.9"));
        assert!(v("1.2.3.4") > v("1.2.3"));
    }

    #[test]
    fn untagged_component_beats_tagged() {
        assert!(v("1.1") > v("1.1alpha"));
        assert!(v("1.1alpha") < v("1.1"));
        assert!(v("2.0.0") > v("2.0.0-beta"));
    }

    #[test]
    fn tags_compare_ordinally() {
        assert!(v("1.1alpha") < v("1.1beta"));
        assert!(v("1.0.0-rc2") > v("1.0.0-rc1"));
    }

    #[test]
    fn trailing_zero_parts_compare_equal() {
        // Missing components count as zero, so these are the same version.
        assert_eq!(v("1.2"), v("1.2.0"));
        assert_eq!(v("1.2").cmp(&v("1.2.0")), Ordering::Equal);
    }

    #[test]
    fn unparsed_sorts_below_parsed() {
        assert!(v("") < v("0.0.1"));
        assert!(v("junk") < v("0"));
        assert_eq!(v("junk").cmp(&v("")), Ordering::Equal);
        assert_ne!(v("junk"), v("0"));
    }

    #[test]
    fn equal_versions_hash_equal() {
        use std::collections::HashSet;
        let set: HashSet<ProtocolVersion> = [v("1.2"), v("1.2.0"), v("1.3")].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn serializes_as_raw_string() {
        let json = serde_json::to_value(v("1.4.2-rc1")).unwrap();
        assert_eq!(json, serde_json::json!("1.4.2-rc1"));
        let back: ProtocolVersion = serde_json::from_value(json).unwrap();
        assert_eq!(back.special(), Some("2-rc1"));
    }

    #[test]
    fn negotiate_picks_lower_compatible_version() {
        let server = v("1.4");
        assert_eq!(ProtocolVersion::negotiate(&server, None, &v("1.2")).unwrap(), v("1.2"));
        assert_eq!(ProtocolVersion::negotiate(&server, None, &v("1.9")).unwrap(), v("1.4"));
    }

    #[test]
    fn negotiate_rejects_other_major_or_too_old() {
        let server = v("2.1");
        assert!(ProtocolVersion::negotiate(&server, None, &v("1.9")).is_err());
        assert!(ProtocolVersion::negotiate(&server, None, &v("")).is_err());

        let min = v("2.1");
        let err = ProtocolVersion::negotiate(&server, Some(&min), &v("2.0")).unwrap_err();
        assert_eq!(err.client, v("2.0"));
        assert_eq!(err.minimum, Some(min.clone()));
        assert!(ProtocolVersion::negotiate(&server, Some(&min), &v("2.1")).is_ok());
    }
}
