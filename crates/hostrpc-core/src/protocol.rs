//! JSON-RPC 2.0 wire types shared by the server and the client.
//!
//! Every call carries positional parameters only: `params` is a JSON array.
//! Errors travel as a [`Fault`] whose message follows the
//! `"<ExceptionName>: <message>"` convention for script exceptions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

pub const SCRIPT_EXCEPTION: i32 = -32000;
pub const REGISTRATION_FAILED: i32 = -32001;
pub const MAIN_THREAD_TIMEOUT: i32 = -32002;

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a request with positional parameters.
    pub fn new(method: impl Into<String>, params: Vec<Value>, id: u64) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params: Some(Value::Array(params)),
            id: Some(Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Fault>,
    pub id: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, fault: Fault) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(fault),
            id,
        }
    }
}

/// A transport fault: the JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Fault {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Encode as a `system.multicall` failure entry.
    pub fn to_multicall_entry(&self) -> Value {
        serde_json::json!({
            "faultCode": self.code,
            "faultString": self.message,
        })
    }

    /// Decode a `system.multicall` failure entry.
    pub fn from_multicall_entry(entry: &Value) -> Option<Self> {
        let code = entry.get("faultCode")?.as_i64()?;
        let message = entry.get("faultString")?.as_str()?;
        Some(Self::new(code as i32, message))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Fault {}: {:?}>", self.code, self.message)
    }
}

/// One entry of a `system.multicall` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MulticallEntry {
    #[serde(rename = "methodName")]
    pub method_name: String,
    #[serde(default)]
    pub params: Vec<Value>,
}
