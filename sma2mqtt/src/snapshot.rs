use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

/// A decoded measurement.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Numeric view of the value; text has none.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Signed(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Signed(v) => write!(f, "{v}"),
            Value::Unsigned(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Signed(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

/// All measurements read from one inverter in one poll.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InverterSnapshot {
    values: BTreeMap<String, Value>,
}

impl InverterSnapshot {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(name, value)| (name.as_str(), value))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for InverterSnapshot {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_name() {
        let snapshot: InverterSnapshot = [
            ("state1", Value::from(2_i64)),
            ("state2", Value::from("test")),
            ("state3", Value::from(25.3)),
        ]
        .into_iter()
        .collect();

        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get("state1"), Some(&Value::Signed(2)));
        assert_eq!(snapshot.get("state2"), Some(&Value::Text("test".into())));
        assert_eq!(snapshot.get("state3").and_then(Value::as_f64), Some(25.3));
        assert!(snapshot.get("state4").is_none());
    }

    #[test]
    fn empty_snapshot() {
        assert!(InverterSnapshot::default().is_empty());
    }

    #[test]
    fn text_is_not_numeric() {
        assert_eq!(Value::from("SB5.0").as_f64(), None);
        assert_eq!(Value::Unsigned(7).as_f64(), Some(7.));
    }

    #[test]
    fn serializes_as_plain_map() {
        let snapshot: InverterSnapshot = [("acPower", Value::Signed(1200)), ("gridFreq", Value::Float(50.01))]
            .into_iter()
            .collect();
        assert_eq!(
            serde_json::to_string(&snapshot).unwrap(),
            r#"{"acPower":1200,"gridFreq":50.01}"#
        );
    }
}
