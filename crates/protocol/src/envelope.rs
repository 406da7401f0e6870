//! Request/response envelope of the local control protocol.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A control command sent by a local shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Map<String, Value>>,
}

impl ControlRequest {
    /// Creates a request without arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: None,
        }
    }

    /// Adds one argument.
    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args
            .get_or_insert_with(Map::new)
            .insert(name.into(), value.into());
        self
    }

    /// Returns a raw argument.
    pub fn arg(&self, name: &str) -> Option<&Value> {
        self.args.as_ref().and_then(|a| a.get(name))
    }

    /// Returns a string argument.
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.arg(name).and_then(Value::as_str)
    }

    /// Returns a non-negative integer argument (numbers or numeric strings).
    pub fn u64_arg(&self, name: &str) -> Option<u64> {
        match self.arg(name)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Reply to a [`ControlRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl ControlResponse {
    /// Successful reply carrying `data`.
    ///
    /// `data` must serialize to a JSON object; anything else is wrapped
    /// under a `value` key.
    pub fn ok<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        let data = match serde_json::to_value(data)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".into(), other);
                map
            }
        };
        Ok(Self {
            success: true,
            error: None,
            data: Some(data),
        })
    }

    /// Successful reply without data.
    pub fn empty() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    /// Failed reply with a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data: None,
        }
    }

    /// Deserializes `data` into `T`.
    pub fn parse_data<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        match &self.data {
            Some(map) => Ok(Some(serde_json::from_value(Value::Object(map.clone()))?)),
            None => Ok(None),
        }
    }
}
