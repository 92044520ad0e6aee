//! Error types for the hostrpc bridge.
//!
//! Errors fall into four families:
//! - pre-flight validation errors, raised locally before any network activity
//! - transport faults and reconstructed remote exceptions
//! - timeouts waiting for a host main thread
//! - connection failures naming the configured server label

use crate::marshal::RemoteException;
use crate::protocol::{self, Fault};
use crate::script::ScriptFault;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the bridge.
#[derive(Debug, Error)]
pub enum RpcError {
    // Pre-flight validation errors
    #[error(
        "UnsupportedArgumentType: argument {index} of '{function}' is a {type_name}, which cannot \
         cross the wire; pass a primitive identifier instead"
    )]
    UnsupportedArgumentType {
        function: String,
        index: usize,
        type_name: String,
    },

    #[error(
        "InvalidKeyWordParameters: '{function}' was called with keyword arguments ({names}); \
         only positional arguments are supported"
    )]
    InvalidKeyWordParameters { function: String, names: String },

    #[error("FileNotSavedOnDisk: '{function}' must be defined in a file saved on disk, {path:?} was not found")]
    FileNotSavedOnDisk { function: String, path: PathBuf },

    #[error("Function '{function}' is not defined in {path:?}")]
    FunctionNotFound { function: String, path: PathBuf },

    #[error("InvalidClassMethod: '{class}.{method}' must be declared static to be called remotely")]
    InvalidClassMethod { class: String, method: String },

    #[error("InvalidTestCasePort: remote test case '{class}' must declare the port of the server it runs against")]
    InvalidTestCasePort { class: String },

    // Transport errors
    #[error("{0}")]
    Fault(Fault),

    #[error("{0}")]
    Remote(RemoteException),

    #[error("Could not connect to {label} at {address}: {message}")]
    Connection {
        label: String,
        address: String,
        message: String,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {message}")]
    Http {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    // Server-side errors
    #[error("{0}")]
    Script(ScriptFault),

    #[error("Could not register callable '{name}': {message}")]
    Registration { name: String, message: String },

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    // Local resource errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for bridge operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for RpcError {
    fn from(err: reqwest::Error) -> Self {
        RpcError::Http {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<ScriptFault> for RpcError {
    fn from(fault: ScriptFault) -> Self {
        RpcError::Script(fault)
    }
}

impl RpcError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        RpcError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error was raised before any network activity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            RpcError::UnsupportedArgumentType { .. }
                | RpcError::InvalidKeyWordParameters { .. }
                | RpcError::FileNotSavedOnDisk { .. }
                | RpcError::FunctionNotFound { .. }
                | RpcError::InvalidClassMethod { .. }
                | RpcError::InvalidTestCasePort { .. }
        )
    }

    /// Whether this error is the timeout condition, raised locally or
    /// reconstructed from the remote side.
    pub fn is_timeout(&self) -> bool {
        match self {
            RpcError::Timeout(_) => true,
            RpcError::Remote(exception) => exception.kind().is_timeout(),
            RpcError::Fault(fault) => fault.code == protocol::MAIN_THREAD_TIMEOUT,
            _ => false,
        }
    }

    /// The reconstructed remote exception, if this is one.
    pub fn as_remote(&self) -> Option<&RemoteException> {
        match self {
            RpcError::Remote(exception) => Some(exception),
            _ => None,
        }
    }

    /// The raw transport fault, if this is one.
    pub fn as_fault(&self) -> Option<&Fault> {
        match self {
            RpcError::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard codes:
    /// - -32700: Parse error
    /// - -32600: Invalid Request
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Bridge codes:
    /// - -32000: Script exception (`"<ExceptionName>: <message>"`)
    /// - -32001: Callable registration failed
    /// - -32002: Timed out waiting for the host main thread
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RpcError::Script(_) => protocol::SCRIPT_EXCEPTION,
            RpcError::Registration { .. } => protocol::REGISTRATION_FAILED,
            RpcError::Timeout(_) => protocol::MAIN_THREAD_TIMEOUT,
            RpcError::MethodNotFound(_) => protocol::METHOD_NOT_FOUND,
            RpcError::InvalidParams { .. } | RpcError::UnsupportedArgumentType { .. } => {
                protocol::INVALID_PARAMS
            }
            RpcError::Fault(fault) => fault.code,
            _ => protocol::INTERNAL_ERROR,
        }
    }

    /// Render this error as the fault that travels back over the wire.
    ///
    /// Script exceptions and timeouts keep the `"<ExceptionName>: <message>"`
    /// convention so the caller can rebuild a native error from them.
    pub fn to_fault(&self) -> Fault {
        let message = match self {
            RpcError::Script(fault) => fault.to_string(),
            RpcError::Timeout(after) => format!(
                "TimeoutError: the host main thread did not run the call within {:?}",
                after
            ),
            RpcError::Registration { name, message } => {
                format!("Could not register callable '{}': {}", name, message)
            }
            other => other.to_string(),
        };
        Fault::new(self.to_rpc_error_code(), message)
    }
}
