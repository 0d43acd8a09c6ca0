//! Label matchers shared by routes, silences and inhibition rules.
//!
//! A matcher compares one label against a value using equality or an anchored
//! regular expression. Matchers serialize as `{"name","value","isRegex","isEqual"}`
//! (the Alertmanager v2 shape) and can also be parsed from the compact
//! `name="value"` / `name=~"re"` string form used by routes.

use std::fmt;
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{AlertError, Result};
use crate::labels::Labels;

/// Comparison performed by a [`Matcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchType {
    /// `=`
    Equal,
    /// `!=`
    NotEqual,
    /// `=~`
    Regexp,
    /// `!~`
    NotRegexp,
}

impl MatchType {
    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regexp => "=~",
            Self::NotRegexp => "!~",
        }
    }

    const fn is_regex(self) -> bool {
        matches!(self, Self::Regexp | Self::NotRegexp)
    }

    const fn is_equal(self) -> bool {
        matches!(self, Self::Equal | Self::Regexp)
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// A single label matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawMatcher", into = "RawMatcher")]
pub struct Matcher {
    name: String,
    value: String,
    kind: MatchType,
    regex: Option<Regex>,
}

impl Matcher {
    /// Creates a matcher, compiling the anchored regex for regex matchers.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidMatcher` if the name is empty or the regex is invalid.
    pub fn new(kind: MatchType, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() {
            return Err(AlertError::InvalidMatcher {
                reason: "matcher name cannot be empty".to_string(),
            });
        }
        let regex = if kind.is_regex() {
            Some(
                Regex::new(&format!("^(?:{value})$")).map_err(|e| AlertError::InvalidMatcher {
                    reason: format!("invalid regular expression {value:?}: {e}"),
                })?,
            )
        } else {
            None
        };
        Ok(Self {
            name,
            value,
            kind,
            regex,
        })
    }

    /// Shorthand for an equality matcher.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::InvalidMatcher` if the name is empty.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(MatchType::Equal, name, value)
    }

    /// Label name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value or pattern.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Match type.
    #[must_use]
    pub const fn kind(&self) -> MatchType {
        self.kind
    }

    /// Tests a single label value; a missing label is the empty string.
    #[must_use]
    pub fn matches_value(&self, value: &str) -> bool {
        match (self.kind, &self.regex) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regexp, Some(re)) => re.is_match(value),
            (MatchType::NotRegexp, Some(re)) => !re.is_match(value),
            (MatchType::Regexp | MatchType::NotRegexp, None) => false,
        }
    }

    /// Tests a label set.
    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        self.matches_value(labels.get_or_empty(&self.name))
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value && self.kind == other.kind
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind, self.value)
    }
}

impl FromStr for Matcher {
    type Err = AlertError;

    /// Parses `name="value"`, `name!="value"`, `name=~"re"` or `name!~"re"`.
    /// Quotes around the value are optional.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let idx = s.find(['=', '!']).ok_or_else(|| AlertError::InvalidMatcher {
            reason: format!("no operator in matcher {s:?}"),
        })?;
        let (name, rest) = s.split_at(idx);
        let (kind, value) = if let Some(v) = rest.strip_prefix("=~") {
            (MatchType::Regexp, v)
        } else if let Some(v) = rest.strip_prefix("!~") {
            (MatchType::NotRegexp, v)
        } else if let Some(v) = rest.strip_prefix("!=") {
            (MatchType::NotEqual, v)
        } else if let Some(v) = rest.strip_prefix('=') {
            (MatchType::Equal, v)
        } else {
            return Err(AlertError::InvalidMatcher {
                reason: format!("unknown operator in matcher {s:?}"),
            });
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        Self::new(kind, name.trim(), value.replace("\\\"", "\""))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMatcher {
    name: String,
    value: String,
    #[serde(default)]
    is_regex: bool,
    #[serde(default = "default_true")]
    is_equal: bool,
}

const fn default_true() -> bool {
    true
}

impl TryFrom<RawMatcher> for Matcher {
    type Error = AlertError;

    fn try_from(raw: RawMatcher) -> Result<Self> {
        let kind = match (raw.is_regex, raw.is_equal) {
            (false, true) => MatchType::Equal,
            (false, false) => MatchType::NotEqual,
            (true, true) => MatchType::Regexp,
            (true, false) => MatchType::NotRegexp,
        };
        Self::new(kind, raw.name, raw.value)
    }
}

impl From<Matcher> for RawMatcher {
    fn from(m: Matcher) -> Self {
        Self {
            is_regex: m.kind.is_regex(),
            is_equal: m.kind.is_equal(),
            name: m.name,
            value: m.value,
        }
    }
}

/// A conjunction of matchers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Matchers(Vec<Matcher>);

impl Matchers {
    /// Creates an empty conjunction, which matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a list of compact matcher strings.
    ///
    /// # Errors
    ///
    /// Returns the first parse failure.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        items
            .iter()
            .map(|s| s.as_ref().parse())
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    /// True when every matcher matches.
    #[must_use]
    pub fn matches(&self, labels: &Labels) -> bool {
        self.0.iter().all(|m| m.matches(labels))
    }

    /// Returns the value of the first equality matcher on `name`.
    #[must_use]
    pub fn equality_value(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|m| m.kind == MatchType::Equal && m.name == name)
            .map(Matcher::value)
    }

    /// Iterates the matchers.
    pub fn iter(&self) -> std::slice::Iter<'_, Matcher> {
        self.0.iter()
    }

    /// Number of matchers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no matchers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Matcher>> for Matchers {
    fn from(v: Vec<Matcher>) -> Self {
        Self(v)
    }
}

impl<'a> IntoIterator for &'a Matchers {
    type Item = &'a Matcher;
    type IntoIter = std::slice::Iter<'a, Matcher>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn labels() -> Labels {
        Labels::new()
            .with("alertname", "HighCPU")
            .with("team", "platform")
    }

    #[test_case("alertname=\"HighCPU\"", true ; "equal")]
    #[test_case("alertname!=\"HighCPU\"", false ; "not equal")]
    #[test_case("alertname=~\"High.*\"", true ; "regex")]
    #[test_case("alertname=~\"CPU\"", false ; "regex is anchored")]
    #[test_case("alertname!~\"Low.*\"", true ; "negative regex")]
    #[test_case("missing=\"\"", true ; "missing label is empty")]
    #[test_case("team=platform", true ; "unquoted value")]
    fn parse_and_match(input: &str, expected: bool) {
        let m: Matcher = input.parse().unwrap();
        assert_eq!(m.matches(&labels()), expected);
    }

    #[test]
    fn parse_rejects_missing_operator() {
        assert!("alertname".parse::<Matcher>().is_err());
    }

    #[test]
    fn invalid_regex_rejected() {
        let err = Matcher::new(MatchType::Regexp, "a", "(").unwrap_err();
        assert!(matches!(err, AlertError::InvalidMatcher { .. }));
    }

    #[test]
    fn json_shape_round_trip() {
        let m = Matcher::new(MatchType::NotRegexp, "env", "dev|test").unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"name":"env","value":"dev|test","isRegex":true,"isEqual":false})
        );
        let back: Matcher = serde_json::from_value(json).unwrap();
        assert_eq!(back, m);
        assert!(back.matches(&Labels::new().with("env", "prod")));
    }

    #[test]
    fn json_rejects_bad_regex() {
        let json = serde_json::json!({"name":"a","value":"[","isRegex":true});
        assert!(serde_json::from_value::<Matcher>(json).is_err());
    }

    #[test]
    fn conjunction_requires_all() {
        let matchers = Matchers::parse(&["alertname=HighCPU", "team=db"]).unwrap();
        assert!(!matchers.matches(&labels()));
        assert!(Matchers::new().matches(&labels()));
    }

    #[test]
    fn equality_value_lookup() {
        let matchers = Matchers::parse(&["__alert_rule_uid__=\"r1\"", "x=~\".*\""]).unwrap();
        assert_eq!(matchers.equality_value("__alert_rule_uid__"), Some("r1"));
        assert_eq!(matchers.equality_value("x"), None);
    }
}
