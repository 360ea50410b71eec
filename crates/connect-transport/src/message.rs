use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded protocol message: the schema type name plus its fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub name: String,
    #[serde(rename = "message", default)]
    pub body: Value,
}

impl Message {
    pub fn new(name: impl Into<String>, body: Value) -> Self {
        Self {
            name: name.into(),
            body,
        }
    }

    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Value::Object(Default::default()))
    }

    pub fn is(&self, name: &str) -> bool {
        self.name == name
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.body.get(key).and_then(Value::as_str)
    }

    pub fn field_u64(&self, key: &str) -> Option<u64> {
        self.body.get(key).and_then(Value::as_u64)
    }

    pub fn field_bool(&self, key: &str) -> Option<bool> {
        self.body.get(key).and_then(Value::as_bool)
    }
}
