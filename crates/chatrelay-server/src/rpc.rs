use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use chatrelay_core::UserId;

pub const INVALID_DATA: &str = "invalid data";
pub const INVALID_ACTION: &str = "invalid action";
pub const UNAUTHENTICATED: &str = "unauthenticated";
pub const INTERNAL_ERROR: &str = "internal server error";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// A direct response frame: `{status, message?, ...fields}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            message: None,
            fields: Map::new(),
        }
    }

    pub fn success_with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::success()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            fields: Map::new(),
        }
    }

    pub fn invalid_action() -> Self {
        Self::error(INVALID_ACTION)
    }

    pub fn unauthenticated() -> Self {
        Self::error(UNAUTHENTICATED)
    }

    /// Add a top-level field.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        // Values here are plain data; a failed conversion would only come
        // from a map with non-string keys.
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// One decoded request: the action name plus the rest of the object.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub action: String,
    pub fields: Value,
}

/// Decode a frame payload into a request.
///
/// Failures come back as the error response to send; they never close the
/// connection.
pub fn parse_request(payload: &[u8]) -> Result<Request, Response> {
    let value: Value = serde_json::from_slice(payload).map_err(|_| Response::error(INVALID_DATA))?;
    let Value::Object(mut fields) = value else {
        return Err(Response::error(INVALID_DATA));
    };
    let action = match fields.remove("action") {
        Some(Value::String(action)) => action,
        _ => return Err(Response::invalid_action()),
    };
    Ok(Request {
        action,
        fields: Value::Object(fields),
    })
}

pub fn missing_field(key: &str) -> Response {
    Response::error(format!("missing required field: {key}"))
}

/// Extract a required string field.
pub fn require_str<'a>(fields: &'a Value, key: &str) -> Result<&'a str, Response> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| missing_field(key))
}

pub fn optional_str<'a>(fields: &'a Value, key: &str) -> Option<&'a str> {
    fields.get(key).and_then(Value::as_str)
}

/// Extract a required user id field (integer or integer string).
pub fn require_user_id(fields: &Value, key: &str) -> Result<UserId, Response> {
    match fields.get(key) {
        None | Some(Value::Null) => Err(missing_field(key)),
        Some(raw) => {
            UserId::from_json(raw).ok_or_else(|| Response::error(format!("invalid {key}")))
        }
    }
}
