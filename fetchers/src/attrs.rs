//! Attribute sets describing inputs and cached fetch results.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use crate::Error;

/// A single attribute value.
///
/// In JSON, strings, non-negative integers and booleans map to the
/// corresponding JSON types.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attr {
    String(String),
    Int(u64),
    Bool(bool),
}

pub type Attrs = BTreeMap<String, Attr>;

impl Attr {
    fn type_name(&self) -> &'static str {
        match self {
            Attr::String(_) => "a string",
            Attr::Int(_) => "an integer",
            Attr::Bool(_) => "a Boolean",
        }
    }

    /// Renders the value as it appears in a URL query.
    pub fn to_query_value(&self) -> String {
        match self {
            Attr::String(s) => s.clone(),
            Attr::Int(n) => n.to_string(),
            Attr::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        }
    }
}

impl fmt::Display for Attr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attr::String(s) => write!(f, "\"{}\"", s),
            Attr::Int(n) => write!(f, "{}", n),
            Attr::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl From<&str> for Attr {
    fn from(value: &str) -> Self {
        Attr::String(value.to_string())
    }
}

impl From<String> for Attr {
    fn from(value: String) -> Self {
        Attr::String(value)
    }
}

impl From<u64> for Attr {
    fn from(value: u64) -> Self {
        Attr::Int(value)
    }
}

impl From<bool> for Attr {
    fn from(value: bool) -> Self {
        Attr::Bool(value)
    }
}

/// Builds an [Attrs] from `(name, value)` pairs.
pub fn attrs<K, V, I>(pairs: I) -> Attrs
where
    K: Into<String>,
    V: Into<Attr>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

fn wrong_type(name: &str, expected: &'static str, got: &Attr) -> Error {
    Error::AttributeType {
        name: name.to_string(),
        expected,
        got: got.type_name(),
    }
}

pub fn maybe_get_str<'a>(attrs: &'a Attrs, name: &str) -> Result<Option<&'a str>, Error> {
    match attrs.get(name) {
        None => Ok(None),
        Some(Attr::String(s)) => Ok(Some(s)),
        Some(other) => Err(wrong_type(name, "a string", other)),
    }
}

pub fn get_str<'a>(attrs: &'a Attrs, name: &str) -> Result<&'a str, Error> {
    maybe_get_str(attrs, name)?.ok_or_else(|| Error::MissingAttribute(name.to_string()))
}

pub fn maybe_get_int(attrs: &Attrs, name: &str) -> Result<Option<u64>, Error> {
    match attrs.get(name) {
        None => Ok(None),
        Some(Attr::Int(n)) => Ok(Some(*n)),
        Some(other) => Err(wrong_type(name, "an integer", other)),
    }
}

pub fn get_int(attrs: &Attrs, name: &str) -> Result<u64, Error> {
    maybe_get_int(attrs, name)?.ok_or_else(|| Error::MissingAttribute(name.to_string()))
}

pub fn maybe_get_bool(attrs: &Attrs, name: &str) -> Result<Option<bool>, Error> {
    match attrs.get(name) {
        None => Ok(None),
        Some(Attr::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(wrong_type(name, "a Boolean", other)),
    }
}

pub fn get_bool(attrs: &Attrs, name: &str) -> Result<bool, Error> {
    maybe_get_bool(attrs, name)?.ok_or_else(|| Error::MissingAttribute(name.to_string()))
}

pub fn attrs_to_json(attrs: &Attrs) -> serde_json::Value {
    serde_json::Value::Object(
        attrs
            .iter()
            .map(|(k, v)| {
                let v = match v {
                    Attr::String(s) => serde_json::Value::from(s.as_str()),
                    Attr::Int(n) => serde_json::Value::from(*n),
                    Attr::Bool(b) => serde_json::Value::from(*b),
                };
                (k.clone(), v)
            })
            .collect(),
    )
}

/// Converts a JSON object to [Attrs]. Nulls are skipped, other values that
/// can't be represented are rejected.
pub fn json_to_attrs(json: &serde_json::Value) -> Result<Attrs, Error> {
    let obj = json
        .as_object()
        .ok_or_else(|| Error::Malformed(format!("expected a JSON object, got {json}")))?;

    let mut out = Attrs::new();
    for (name, value) in obj {
        let attr = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::String(s) => Attr::String(s.clone()),
            serde_json::Value::Bool(b) => Attr::Bool(*b),
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(n) => Attr::Int(n),
                None => {
                    return Err(Error::Malformed(format!(
                        "attribute '{name}' is not a non-negative integer: {n}"
                    )))
                }
            },
            other => {
                return Err(Error::Malformed(format!(
                    "unsupported value for attribute '{name}': {other}"
                )))
            }
        };
        out.insert(name.clone(), attr);
    }
    Ok(out)
}
