//! Column values as handed back by the driver, and their coercion into
//! metric samples (`to_f64`) or label values (`to_label`).
//!
//! Numeric coercion is strict: anything that is not clearly a number yields
//! `None` and the sample is dropped. Label coercion is permissive: `NULL`
//! renders as an empty label so that series identity stays intact.

use chrono::{DateTime, Utc};
use std::fmt;

/// A single column value of a result row.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Timestamp(DateTime<Utc>),
    /// A value of a type the driver boundary does not decode (arrays, json, ...).
    Unsupported(String),
}

impl ColumnValue {
    /// Coerce the value into a metric sample.
    ///
    /// Returns `None` for `NULL`, unparsable text/bytes and unsupported types.
    #[must_use]
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => {
                #[allow(clippy::cast_precision_loss)]
                let v = *v as f64;
                Some(v)
            }
            Self::Float(v) => Some(*v),
            Self::Timestamp(ts) => {
                #[allow(clippy::cast_precision_loss)]
                let secs = ts.timestamp() as f64;
                Some(secs)
            }
            Self::Bytes(bytes) => std::str::from_utf8(bytes).ok().and_then(parse_numeral),
            Self::Text(text) => parse_numeral(text),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Null | Self::Unsupported(_) => None,
        }
    }

    /// Render the value as a label value.
    ///
    /// `NULL` becomes an empty string; only unsupported types yield `None`.
    #[must_use]
    pub fn to_label(&self) -> Option<String> {
        match self {
            Self::Int(v) => Some(v.to_string()),
            Self::Float(v) => Some(v.to_string()),
            Self::Timestamp(ts) => Some(ts.timestamp().to_string()),
            Self::Null => Some(String::new()),
            Self::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Self::Text(text) => Some(text.clone()),
            Self::Bool(b) => Some(b.to_string()),
            Self::Unsupported(_) => None,
        }
    }

    /// Short type name used in conversion error messages.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Int(_) => "integer",
            Self::Float(_) => "float",
            Self::Text(_) => "text",
            Self::Bytes(_) => "bytes",
            Self::Bool(_) => "bool",
            Self::Timestamp(_) => "timestamp",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(text) => write!(f, "{text:?}"),
            Self::Bytes(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Unsupported(type_name) => write!(f, "<{type_name}>"),
        }
    }
}

fn parse_numeral(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

/// One result row: column names paired with their values, in select-list order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawRow {
    columns: Vec<(String, ColumnValue)>,
}

impl RawRow {
    #[must_use]
    pub const fn new(columns: Vec<(String, ColumnValue)>) -> Self {
        Self { columns }
    }

    /// Look up a column value by (case-insensitive) name.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ColumnValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<(String, ColumnValue)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (String, ColumnValue)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap_or_default()
    }

    #[test]
    fn test_to_f64() {
        assert_eq!(ColumnValue::Int(2).to_f64(), Some(2.0));
        assert_eq!(ColumnValue::Float(2.0).to_f64(), Some(2.0));
        assert_eq!(
            ColumnValue::Timestamp(epoch(123_456_790)).to_f64(),
            Some(123_456_790.0)
        );
        assert_eq!(ColumnValue::Bytes(b"1234".to_vec()).to_f64(), Some(1234.0));
        assert_eq!(ColumnValue::Text("232.14".into()).to_f64(), Some(232.14));
        assert_eq!(ColumnValue::Text("1.5e3".into()).to_f64(), Some(1500.0));
        assert_eq!(ColumnValue::Bool(true).to_f64(), Some(1.0));
        assert_eq!(ColumnValue::Bool(false).to_f64(), Some(0.0));
    }

    #[test]
    fn test_to_f64_rejects_nonsense() {
        assert_eq!(ColumnValue::Null.to_f64(), None);
        assert_eq!(ColumnValue::Text("abc".into()).to_f64(), None);
        assert_eq!(ColumnValue::Bytes(vec![0xff, 0xfe]).to_f64(), None);
        assert_eq!(ColumnValue::Unsupported("INTERVAL".into()).to_f64(), None);
    }

    #[test]
    fn test_to_f64_text_nan() {
        let value = ColumnValue::Text("NaN".into()).to_f64();
        assert!(value.is_some_and(f64::is_nan));
    }

    #[test]
    fn test_to_label() {
        assert_eq!(ColumnValue::Int(1).to_label().as_deref(), Some("1"));
        assert_eq!(ColumnValue::Float(1.1).to_label().as_deref(), Some("1.1"));
        assert_eq!(
            ColumnValue::Timestamp(epoch(123_456_790)).to_label().as_deref(),
            Some("123456790")
        );
        assert_eq!(ColumnValue::Null.to_label().as_deref(), Some(""));
        assert_eq!(ColumnValue::Bytes(b"a".to_vec()).to_label().as_deref(), Some("a"));
        assert_eq!(ColumnValue::Text("a".into()).to_label().as_deref(), Some("a"));
        assert_eq!(ColumnValue::Bool(true).to_label().as_deref(), Some("true"));
        assert_eq!(ColumnValue::Bool(false).to_label().as_deref(), Some("false"));
    }

    #[test]
    fn test_to_label_unsupported() {
        assert_eq!(ColumnValue::Unsupported("JSONB".into()).to_label(), None);
    }

    #[test]
    fn test_raw_row_lookup_is_case_insensitive() {
        let row: RawRow = vec![
            ("datname".to_string(), ColumnValue::Text("postgres".into())),
            ("Count".to_string(), ColumnValue::Int(4)),
        ]
        .into_iter()
        .collect();

        assert_eq!(row.len(), 2);
        assert_eq!(row.get("count"), Some(&ColumnValue::Int(4)));
        assert_eq!(row.get("missing"), None);
    }
}
