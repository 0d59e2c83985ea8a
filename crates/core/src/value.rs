//! Tagged document values flowing through credential rendering.
//!
//! Credential documents are built from live cluster objects and optionally
//! rewritten by a bind template, so their shape is only known at runtime.
//! `Value` keeps that shape explicit instead of passing `serde_json::Value`
//! around the broker.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type Document = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<Value>),
    Map(Document),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self { Value::String(s) => Some(s), _ => None }
    }

    pub fn as_map(&self) -> Option<&Document> {
        match self { Value::Map(m) => Some(m), _ => None }
    }

    pub fn get(&self, key: &str) -> Option<&Value> { self.as_map().and_then(|m| m.get(key)) }

    pub fn into_map(self) -> Option<Document> {
        match self { Value::Map(m) => Some(m), _ => None }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        use serde_json::Value as J;
        match v {
            J::Null => Value::Null,
            J::Bool(b) => Value::Bool(b),
            J::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            J::String(s) => Value::String(s),
            J::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            J::Object(map) => Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect()),
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        use serde_json::Value as J;
        match v {
            Value::Null => J::Null,
            Value::Bool(b) => J::Bool(b),
            Value::Integer(i) => J::from(i),
            // NaN/inf have no JSON form
            Value::Float(f) => serde_json::Number::from_f64(f).map(J::Number).unwrap_or(J::Null),
            Value::String(s) => J::String(s),
            Value::List(items) => J::Array(items.into_iter().map(J::from).collect()),
            Value::Map(map) => J::Object(map.into_iter().map(|(k, v)| (k, J::from(v))).collect()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}

impl From<Document> for Value {
    fn from(m: Document) -> Self { Value::Map(m) }
}
