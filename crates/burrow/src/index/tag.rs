//! Tag predicates: [`Operator`], [`Tag`] and [`TagRule`].
//!
//! These are the types rule consumers build from user input, so every entry
//! point validates: integer and string operators are checked against the
//! closed set, and tags are checked for both halves on construction and on
//! deserialization.

use crate::error::{BurrowError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Comparison applied by a [`TagRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
#[repr(u8)]
pub enum Operator {
    /// Tag value equals the rule value.
    Equal = 0,
    /// Tag value differs from the rule value, or the tag is absent.
    NotEqual = 1,
    /// Tag value matches the rule's regular expression.
    RegexEqual = 2,
    /// Tag value does not match the rule's regular expression, or the tag is absent.
    NotRegexEqual = 3,
}

impl Operator {
    /// Every operator in numeric order.
    pub const ALL: [Operator; 4] = [
        Operator::Equal,
        Operator::NotEqual,
        Operator::RegexEqual,
        Operator::NotRegexEqual,
    ];

    /// Returns the wire name of the operator.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Equal => "equal",
            Operator::NotEqual => "notequal",
            Operator::RegexEqual => "equalregex",
            Operator::NotRegexEqual => "notequalregex",
        }
    }
}

impl TryFrom<i64> for Operator {
    type Error = BurrowError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Operator::Equal),
            1 => Ok(Operator::NotEqual),
            2 => Ok(Operator::RegexEqual),
            3 => Ok(Operator::NotRegexEqual),
            other => Err(BurrowError::InvalidOperator(other.to_string())),
        }
    }
}

impl From<Operator> for i64 {
    fn from(op: Operator) -> Self {
        op as u8 as i64
    }
}

impl FromStr for Operator {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "equal" => Ok(Operator::Equal),
            "notequal" => Ok(Operator::NotEqual),
            "equalregex" => Ok(Operator::RegexEqual),
            "notequalregex" => Ok(Operator::NotRegexEqual),
            other => Err(BurrowError::InvalidOperator(format!(
                "unrecognized operator {other:?}"
            ))),
        }
    }
}

impl TryFrom<String> for Operator {
    type Error = BurrowError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Operator> for String {
    fn from(op: Operator) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tag key-value pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTag")]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value, or a pattern for the regex operators.
    pub value: String,
}

#[derive(Deserialize)]
struct RawTag {
    key: String,
    value: String,
}

impl TryFrom<RawTag> for Tag {
    type Error = BurrowError;

    fn try_from(raw: RawTag) -> Result<Self> {
        Tag::new(raw.key, raw.value)
    }
}

impl Tag {
    /// Creates a tag, rejecting an empty key or value.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let tag = Self {
            key: key.into(),
            value: value.into(),
        };
        tag.validate()?;
        Ok(tag)
    }

    /// Parses the `key:value` form. Both halves must be non-empty and made of
    /// ASCII letters, digits and underscores.
    pub fn parse(s: &str) -> Result<Self> {
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        };
        match s.split_once(':') {
            Some((key, value)) if valid(key) && valid(value) => Ok(Self {
                key: key.to_string(),
                value: value.to_string(),
            }),
            _ => Err(BurrowError::InvalidTag(format!(
                "tag must be in form key:value, got {s:?}"
            ))),
        }
    }

    /// Returns an error if the key or value is empty.
    pub fn validate(&self) -> Result<()> {
        if self.key.is_empty() || self.value.is_empty() {
            return Err(BurrowError::InvalidTag(
                "tag must contain a key and a value".to_string(),
            ));
        }
        Ok(())
    }

    /// Renders the tag back into `key:value` form.
    pub fn query_param(&self) -> String {
        format!("{}:{}", self.key, self.value)
    }
}

impl FromStr for Tag {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        Tag::parse(s)
    }
}

/// One predicate clause: "tag `key` `operator` `value`".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagRule {
    /// The tag the rule compares against.
    #[serde(flatten)]
    pub tag: Tag,
    /// How the series' tag value is compared.
    pub operator: Operator,
}

impl TagRule {
    /// Creates a rule.
    pub fn new(tag: Tag, operator: Operator) -> Self {
        Self { tag, operator }
    }

    /// Shorthand for an [`Operator::Equal`] rule.
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Ok(Self::new(Tag::new(key, value)?, Operator::Equal))
    }

    /// Shorthand for an [`Operator::NotEqual`] rule.
    pub fn not_equal(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Ok(Self::new(Tag::new(key, value)?, Operator::NotEqual))
    }

    /// Shorthand for an [`Operator::RegexEqual`] rule.
    pub fn regex(key: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        Ok(Self::new(Tag::new(key, pattern)?, Operator::RegexEqual))
    }

    /// Shorthand for an [`Operator::NotRegexEqual`] rule.
    pub fn not_regex(key: impl Into<String>, pattern: impl Into<String>) -> Result<Self> {
        Ok(Self::new(Tag::new(key, pattern)?, Operator::NotRegexEqual))
    }

    /// Builds a rule from a `key:value` string and an operator name, failing
    /// on either half before any evaluation happens.
    pub fn parse(tag: &str, operator: &str) -> Result<Self> {
        let tag = Tag::parse(tag)?;
        let operator = operator.parse()?;
        Ok(Self { tag, operator })
    }

    /// Checks the tag, then the operator.
    ///
    /// The operator is always one of the four variants once constructed, so
    /// only the tag can fail here; regex patterns are checked when the rule
    /// is compiled.
    pub fn validate(&self) -> Result<()> {
        self.tag.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Operator
    // ========================================================================

    #[test]
    fn test_operator_integer_boundary() {
        for op in Operator::ALL {
            assert_eq!(Operator::try_from(i64::from(op)).unwrap(), op);
        }
        assert!(matches!(
            Operator::try_from(4),
            Err(BurrowError::InvalidOperator(_))
        ));
        assert!(Operator::try_from(-1).is_err());
    }

    #[test]
    fn test_operator_json_roundtrip() {
        for op in Operator::ALL {
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{}\"", op));
            let back: Operator = serde_json::from_str(&json).unwrap();
            assert_eq!(back, op);
        }
    }

    #[test]
    fn test_operator_rejects_unknown_name() {
        assert!("like".parse::<Operator>().is_err());
        assert!("Equal".parse::<Operator>().is_err());
        assert!(serde_json::from_str::<Operator>("\"regex\"").is_err());
        assert!(serde_json::from_str::<Operator>("1").is_err());
    }

    // ========================================================================
    // Tag
    // ========================================================================

    #[test]
    fn test_tag_parse_and_query_param() {
        let tag = Tag::parse("host:server_01").unwrap();
        assert_eq!(tag.key, "host");
        assert_eq!(tag.value, "server_01");
        assert_eq!(tag.query_param(), "host:server_01");
    }

    #[test]
    fn test_tag_parse_rejects_malformed() {
        for bad in ["host", "host:", ":a", "a:b:c", "ho st:a", "host:a-b", ""] {
            assert!(
                matches!(Tag::parse(bad), Err(BurrowError::InvalidTag(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_tag_validate() {
        assert!(Tag::new("host", "a").is_ok());
        assert!(Tag::new("", "a").is_err());
        assert!(Tag::new("host", "").is_err());
    }

    #[test]
    fn test_tag_deserialize_validates() {
        let tag: Tag = serde_json::from_str(r#"{"key":"host","value":"a"}"#).unwrap();
        assert_eq!(tag, Tag::new("host", "a").unwrap());
        assert!(serde_json::from_str::<Tag>(r#"{"key":"","value":"a"}"#).is_err());
    }

    // ========================================================================
    // TagRule
    // ========================================================================

    #[test]
    fn test_rule_json_shape() {
        let rule = TagRule::not_regex("host", "^a.*").unwrap();
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"key": "host", "value": "^a.*", "operator": "notequalregex"})
        );
        let back: TagRule = serde_json::from_value(json).unwrap();
        assert_eq!(back, rule);
    }

    #[test]
    fn test_rule_json_rejects_bad_operator() {
        let json = r#"{"key":"host","value":"a","operator":"contains"}"#;
        assert!(serde_json::from_str::<TagRule>(json).is_err());
    }

    #[test]
    fn test_rule_parse() {
        let rule = TagRule::parse("host:a", "notequal").unwrap();
        assert_eq!(rule.operator, Operator::NotEqual);
        assert_eq!(rule.tag.query_param(), "host:a");
        assert!(TagRule::parse("host:a", "nope").is_err());
        assert!(TagRule::parse("host", "equal").is_err());
    }

    #[test]
    fn test_rule_validate() {
        let rule = TagRule::equal("host", "a").unwrap();
        assert!(rule.validate().is_ok());
        let broken = TagRule {
            tag: Tag {
                key: "host".into(),
                value: String::new(),
            },
            operator: Operator::Equal,
        };
        assert!(broken.validate().is_err());
    }
}
