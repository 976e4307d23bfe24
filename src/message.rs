use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The payload envelope that travels along pipeline edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    id: String,
    payload: Value,
    metadata: HashMap<String, String>,
}

impl Message {
    pub fn new(id: &str, payload: Value) -> Self {
        Self {
            id: id.to_string(),
            payload,
            metadata: HashMap::new(),
        }
    }

    /// Successor envelope in the same run: new payload, same id and
    /// metadata. Node executors derive their outputs through this so
    /// metadata written upstream survives the whole walk.
    pub fn next(&self, payload: Value) -> Self {
        Self {
            id: self.id.clone(),
            payload,
            metadata: self.metadata.clone(),
        }
    }

    pub fn id(&self) -> String {
        self.id.clone()
    }

    pub fn payload(&self) -> Value {
        self.payload.clone()
    }

    /// Render the payload as prompt text: plain strings pass through
    /// unquoted, everything else is serialized to JSON.
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&String> {
        self.metadata.get(name)
    }

    pub fn add(&mut self, name: String, value: String) {
        self.metadata.insert(name, value);
    }
}
