//! `key=value;key=value` connection strings.
//!
//! Keys are case-insensitive and may contain spaces (`Data Source`). Values
//! may be wrapped in single or double quotes to carry `;` characters; a
//! doubled quote inside a quoted value stands for one quote.

use std::fmt;

use crate::transaction::{ScopeError, ScopeResult};

/// A parsed connection string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionString {
    pairs: Vec<(String, String)>,
}

impl ConnectionString {
    /// Parse a connection string.
    pub fn parse(input: &str) -> ScopeResult<Self> {
        let mut pairs: Vec<(String, String)> = Vec::new();

        for segment in split_segments(input)? {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (key, value) = segment.split_once('=').ok_or_else(|| {
                ScopeError::InvalidConnectionString(format!("missing '=' in '{}'", segment))
            })?;

            let key = normalize_key(key);
            if key.is_empty() {
                return Err(ScopeError::InvalidConnectionString(format!(
                    "empty key in '{}'",
                    segment
                )));
            }
            let value = unquote(value.trim());

            // Later occurrences win.
            pairs.retain(|(k, _)| *k != key);
            pairs.push((key, value));
        }

        Ok(Self { pairs })
    }

    /// Check whether the input looks like `key=value` pairs at all.
    pub fn looks_like_pairs(input: &str) -> bool {
        input
            .split(';')
            .next()
            .and_then(|first| first.split_once('='))
            .map(|(key, _)| {
                !key.trim().is_empty()
                    && key
                        .trim()
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_')
            })
            .unwrap_or(false)
    }

    /// Get a value by key (case-insensitive).
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = normalize_key(key);
        self.pairs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Get the first value present among several key aliases.
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    /// Iterate over normalized keys and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Check if there are no pairs.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.pairs.iter().enumerate() {
            if i > 0 {
                write!(f, ";")?;
            }
            if value.contains(';') || value.contains('"') || value.starts_with('\'') {
                write!(f, "{}=\"{}\"", key, value.replace('"', "\"\""))?;
            } else {
                write!(f, "{}={}", key, value)?;
            }
        }
        Ok(())
    }
}

fn normalize_key(key: &str) -> String {
    key.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Split on unquoted `;`. A quote only opens when it is the first
/// non-blank character of a value, so `o'neil.db` stays a plain value.
fn split_segments(input: &str) -> ScopeResult<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut seen_eq = false;
    let mut value_start = false;
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => {
                if chars.peek() == Some(&q) {
                    current.push(q);
                    current.push(q);
                    chars.next();
                } else {
                    quote = None;
                    current.push(c);
                }
            }
            Some(_) => current.push(c),
            None if value_start && (c == '"' || c == '\'') => {
                quote = Some(c);
                value_start = false;
                current.push(c);
            }
            None if c == ';' => {
                segments.push(std::mem::take(&mut current));
                seen_eq = false;
                value_start = false;
            }
            None => {
                if c == '=' && !seen_eq {
                    seen_eq = true;
                    value_start = true;
                } else if !c.is_whitespace() {
                    value_start = false;
                }
                current.push(c);
            }
        }
    }

    if quote.is_some() {
        return Err(ScopeError::InvalidConnectionString(
            "unterminated quoted value".to_string(),
        ));
    }
    segments.push(current);
    Ok(segments)
}

fn unquote(value: &str) -> String {
    let mut chars = value.chars();
    match (chars.next(), value.chars().last()) {
        (Some(open), Some(close))
            if value.len() >= 2 && open == close && (open == '"' || open == '\'') =>
        {
            let inner = &value[1..value.len() - 1];
            let doubled: String = [open, open].iter().collect();
            inner.replace(&doubled, &open.to_string())
        }
        _ => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let cs = ConnectionString::parse("Data Source=app.db; Mode=ReadWriteCreate;").unwrap();
        assert_eq!(cs.len(), 2);
        assert_eq!(cs.get("data source"), Some("app.db"));
        assert_eq!(cs.get("DATA  SOURCE"), Some("app.db"));
        assert_eq!(cs.get("mode"), Some("ReadWriteCreate"));
        assert_eq!(cs.get("cache"), None);
        assert_eq!(cs.get_any(&["filename", "data source"]), Some("app.db"));
    }

    #[test]
    fn test_quoted_values() {
        let cs = ConnectionString::parse(r#"Data Source="a;b.db";Password='it''s'"#).unwrap();
        assert_eq!(cs.get("data source"), Some("a;b.db"));
        assert_eq!(cs.get("password"), Some("it's"));
    }

    #[test]
    fn test_quotes_inside_values_are_literal() {
        let cs = ConnectionString::parse("Data Source=/home/o'neil/app.db;Mode=ReadOnly").unwrap();
        assert_eq!(cs.get("data source"), Some("/home/o'neil/app.db"));
        assert_eq!(cs.get("mode"), Some("ReadOnly"));

        let cs = ConnectionString::parse(r#"Data Source=say "hi".db"#).unwrap();
        assert_eq!(cs.get("data source"), Some(r#"say "hi".db"#));

        let cs = ConnectionString::parse("Data Source= 'a;b.db' ").unwrap();
        assert_eq!(cs.get("data source"), Some("a;b.db"));

        let cs = ConnectionString::parse("Data Source=\"'lead.db\"").unwrap();
        assert_eq!(cs.get("data source"), Some("'lead.db"));
        assert_eq!(ConnectionString::parse(&cs.to_string()).unwrap(), cs);
    }

    #[test]
    fn test_last_value_wins() {
        let cs = ConnectionString::parse("Mode=Memory;mode=ReadOnly").unwrap();
        assert_eq!(cs.len(), 1);
        assert_eq!(cs.get("Mode"), Some("ReadOnly"));
    }

    #[test]
    fn test_invalid() {
        assert!(ConnectionString::parse("Data Source").is_err());
        assert!(ConnectionString::parse("=x").is_err());
        assert!(ConnectionString::parse("Data Source=\"open").is_err());
    }

    #[test]
    fn test_looks_like_pairs() {
        assert!(ConnectionString::looks_like_pairs("Data Source=x.db"));
        assert!(!ConnectionString::looks_like_pairs("app.db"));
        assert!(!ConnectionString::looks_like_pairs("file:app.db?mode=ro"));
        assert!(!ConnectionString::looks_like_pairs(":memory:"));
    }

    #[test]
    fn test_display() {
        let cs = ConnectionString::parse("Data Source=\"a;b\";Cache=Shared").unwrap();
        assert_eq!(cs.to_string(), "data source=\"a;b\";cache=Shared");
        assert_eq!(ConnectionString::parse(&cs.to_string()).unwrap(), cs);
    }
}
