//! Series keys: a measurement plus a sorted tag set.
//!
//! The text form is `measurement,k1=v1,k2=v2`. Commas, equals signs, spaces
//! and backslashes inside any component are escaped with a backslash.

use crate::error::{BurrowError, Result};
use crate::tsm::FIELD_SEPARATOR;
use std::fmt;
use std::str::FromStr;

/// Identity of one series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    measurement: String,
    tags: Vec<(String, String)>,
}

impl SeriesKey {
    /// Builds a key from parts. Tags are sorted; exact duplicates collapse.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::InvalidSeriesKey`] for an empty measurement,
    /// empty tag key or value, or one tag key bound to two values.
    pub fn new<K, V>(
        measurement: impl Into<String>,
        tags: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Self>
    where
        K: Into<String>,
        V: Into<String>,
    {
        let measurement = measurement.into();
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_parts(measurement, tags)
    }

    fn from_parts(measurement: String, mut tags: Vec<(String, String)>) -> Result<Self> {
        let invalid = |tags: &[(String, String)], reason: String| {
            BurrowError::InvalidSeriesKey {
                key: render(&measurement, tags),
                reason,
            }
        };
        if measurement.is_empty() {
            return Err(invalid(&tags, "empty measurement".to_string()));
        }
        if measurement.contains(FIELD_SEPARATOR) {
            return Err(invalid(&tags, format!("contains reserved {FIELD_SEPARATOR:?}")));
        }
        for (k, v) in &tags {
            if k.is_empty() || v.is_empty() {
                return Err(invalid(&tags, "empty tag key or value".to_string()));
            }
            if k.contains(FIELD_SEPARATOR) || v.contains(FIELD_SEPARATOR) {
                return Err(invalid(&tags, format!("contains reserved {FIELD_SEPARATOR:?}")));
            }
        }

        tags.sort();
        tags.dedup();
        if let Some(pair) = tags.windows(2).find(|w| w[0].0 == w[1].0) {
            let reason = format!(
                "tag {:?} has values {:?} and {:?}",
                pair[0].0, pair[0].1, pair[1].1
            );
            return Err(invalid(&tags, reason));
        }
        Ok(Self { measurement, tags })
    }

    /// Parses the escaped text form.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| BurrowError::InvalidSeriesKey {
            key: s.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = split_unescaped(s, ',').into_iter();
        let measurement = unescape(parts.next().unwrap_or_default())
            .ok_or_else(|| invalid("dangling escape"))?;

        let mut tags = Vec::new();
        for part in parts {
            let (k, v) =
                split_once_unescaped(part, '=').ok_or_else(|| invalid("tag without '='"))?;
            let k = unescape(k).ok_or_else(|| invalid("dangling escape"))?;
            let v = unescape(v).ok_or_else(|| invalid("dangling escape"))?;
            tags.push((k, v));
        }

        Self::from_parts(measurement, tags).map_err(|err| match err {
            BurrowError::InvalidSeriesKey { reason, .. } => BurrowError::InvalidSeriesKey {
                key: s.to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Measurement name.
    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Tags sorted by key.
    pub fn tags(&self) -> &[(String, String)] {
        &self.tags
    }

    /// Value of one tag, if the series carries it.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| self.tags[i].1.as_str())
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(&self.measurement, &self.tags))
    }
}

impl FromStr for SeriesKey {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        SeriesKey::parse(s)
    }
}

fn render(measurement: &str, tags: &[(String, String)]) -> String {
    let mut out = String::with_capacity(measurement.len() + tags.len() * 16);
    escape_into(measurement, &mut out);
    for (k, v) in tags {
        out.push(',');
        escape_into(k, &mut out);
        out.push('=');
        escape_into(v, &mut out);
    }
    out
}

fn escape_into(s: &str, out: &mut String) {
    for c in s.chars() {
        if matches!(c, ',' | '=' | ' ' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Removes escapes; `None` on a trailing lone backslash.
fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

fn split_unescaped(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            parts.push(&s[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&s[start..]);
    parts
}

fn split_once_unescaped(s: &str, sep: char) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == sep {
            return Some((&s[..i], &s[i + c.len_utf8()..]));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sorts_tags() {
        let key = SeriesKey::parse("cpu,region=eu,host=a").unwrap();
        assert_eq!(key.measurement(), "cpu");
        assert_eq!(key.tag("host"), Some("a"));
        assert_eq!(key.tag("zone"), None);
        assert_eq!(key.to_string(), "cpu,host=a,region=eu");
    }

    #[test]
    fn test_measurement_only() {
        let key = SeriesKey::parse("cpu").unwrap();
        assert!(key.tags().is_empty());
        assert_eq!(key.to_string(), "cpu");
    }

    #[test]
    fn test_escapes_roundtrip() {
        let key = SeriesKey::new("my cpu", [("path", "C:\\a,b=c")]).unwrap();
        let text = key.to_string();
        assert_eq!(text, "my\\ cpu,path=C:\\\\a\\,b\\=c");
        assert_eq!(SeriesKey::parse(&text).unwrap(), key);
    }

    #[test]
    fn test_duplicates() {
        let key = SeriesKey::parse("cpu,host=a,host=a").unwrap();
        assert_eq!(key.tags().len(), 1);
        assert!(SeriesKey::parse("cpu,host=a,host=b").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        let malformed = ["", ",host=a", "cpu,host", "cpu,=a", "cpu,host=", "cpu\\", "cpu#!~#x"];
        for bad in malformed {
            assert!(
                matches!(SeriesKey::parse(bad), Err(BurrowError::InvalidSeriesKey { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_value_may_contain_escaped_equals() {
        let key = SeriesKey::parse("cpu,expr=a\\=b").unwrap();
        assert_eq!(key.tag("expr"), Some("a=b"));
    }
}
