//! HTTP JSON-RPC client bound to one bridge server.
//!
//! A client is cheap to build and is not pooled: the factory and the
//! decorators create a fresh one per call. Faults are reconstructed into
//! [`RemoteException`](crate::marshal::RemoteException)s unless marshalling
//! is switched off, in which case they surface as raw [`Fault`]s.

use crate::config::{server_label, RpcConfig, RpcSettings};
use crate::error::{Result, RpcError};
use crate::marshal::{unmarshal_fault, ExceptionRegistry};
use crate::protocol::{Fault, JsonRpcRequest, JsonRpcResponse, MulticallEntry};
use crate::remap::RemapPairs;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Client session for the server at `(host, port)`.
#[derive(Debug)]
pub struct RpcClient {
    host: String,
    port: u16,
    label: String,
    marshal_exceptions: bool,
    traceback_file: Option<PathBuf>,
    request_timeout: Duration,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Connect to `port` on the host named by `RPC_SERVER_IP`.
    pub fn new(port: u16) -> Result<Self> {
        Self::with_settings(port, &RpcSettings::from_env())
    }

    pub fn with_settings(port: u16, settings: &RpcSettings) -> Result<Self> {
        let request_timeout = settings.timeout.saturating_add(RpcConfig::HTTP_GRACE);
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            host: settings.server_ip.clone(),
            port,
            label: server_label(port),
            marshal_exceptions: true,
            traceback_file: settings.traceback_file.clone(),
            request_timeout,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Enable or disable reconstruction of remote exceptions.
    pub fn marshal_exceptions(mut self, enabled: bool) -> Self {
        self.marshal_exceptions = enabled;
        self
    }

    pub fn is_marshalling(&self) -> bool {
        self.marshal_exceptions
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Operator-facing name of the server, used in connection errors.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, RpcConfig::RPC_PATH)
    }

    /// Call `method` with positional parameters.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(method, params, id);
        debug!("RPC call {} -> {}", method, self.endpoint());

        let response = self
            .http
            .post(self.endpoint())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error(e))?;

        if let Some(fault) = response.error {
            return Err(self.fault_error(fault));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    pub async fn is_running(&self) -> Result<bool> {
        Ok(self.call("is_running", vec![]).await?.as_bool().unwrap_or(false))
    }

    /// Ask the server to stop serving.
    pub async fn kill(&self) -> Result<bool> {
        Ok(self.call("kill", vec![]).await?.as_bool().unwrap_or(false))
    }

    pub async fn set_env(&self, name: &str, value: &str) -> Result<()> {
        self.call("set_env", vec![json!(name), json!(value)]).await?;
        Ok(())
    }

    /// Register shipped source as a callable named `name` on the server.
    pub async fn add_new_callable(
        &self,
        name: &str,
        code: &str,
        search_paths: &[PathBuf],
        remap_pairs: &RemapPairs,
    ) -> Result<String> {
        let paths: Vec<String> = search_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let confirmation = self
            .call(
                "add_new_callable",
                vec![
                    json!(name),
                    json!(code),
                    json!(paths),
                    serde_json::to_value(remap_pairs)?,
                ],
            )
            .await?;
        Ok(confirmation.as_str().unwrap_or_default().to_string())
    }

    pub async fn list_methods(&self) -> Result<Vec<String>> {
        let methods = self.call("system.listMethods", vec![]).await?;
        Ok(serde_json::from_value(methods)?)
    }

    pub async fn method_help(&self, method: &str) -> Result<String> {
        let help = self.call("system.methodHelp", vec![json!(method)]).await?;
        Ok(help.as_str().unwrap_or_default().to_string())
    }

    /// Run several calls in one round trip. Each entry fails independently.
    pub async fn multicall(&self, calls: Vec<MulticallEntry>) -> Result<Vec<Result<Value>>> {
        let batch = serde_json::to_value(calls)?;
        let results = self.call("system.multicall", vec![batch]).await?;
        let Value::Array(entries) = results else {
            return Err(RpcError::Other(
                "system.multicall returned a non-array result".to_string(),
            ));
        };

        Ok(entries
            .into_iter()
            .map(|entry| match entry {
                Value::Array(mut wrapped) if wrapped.len() == 1 => Ok(wrapped.remove(0)),
                other => Err(match Fault::from_multicall_entry(&other) {
                    Some(fault) => self.fault_error(fault),
                    None => RpcError::Other(format!("malformed multicall entry: {}", other)),
                }),
            })
            .collect())
    }

    fn fault_error(&self, fault: Fault) -> RpcError {
        if !self.marshal_exceptions {
            return RpcError::Fault(fault);
        }
        unmarshal_fault(
            fault,
            ExceptionRegistry::global(),
            self.traceback_file.as_deref(),
        )
    }

    fn transport_error(&self, err: reqwest::Error) -> RpcError {
        if err.is_timeout() {
            return RpcError::Timeout(self.request_timeout);
        }
        if err.is_connect() {
            return RpcError::Connection {
                label: self.label.clone(),
                address: format!("{}:{}", self.host, self.port),
                message: err.to_string(),
            };
        }
        RpcError::from(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_endpoint_and_label() {
        let settings = RpcSettings {
            server_ip: "10.1.2.3".into(),
            ..RpcSettings::default()
        };
        let client = RpcClient::with_settings(9997, &settings).unwrap();
        assert_eq!(client.endpoint(), "http://10.1.2.3:9997/rpc");
        assert_eq!(client.label(), "the RPC server on port 9997");
        assert!(client.is_marshalling());
        assert!(!client.marshal_exceptions(false).is_marshalling());
    }

    #[test]
    fn test_request_timeout_saturates() {
        let settings = RpcSettings {
            timeout: std::time::Duration::MAX,
            ..RpcSettings::default()
        };
        let client = RpcClient::with_settings(9997, &settings).unwrap();
        assert_eq!(client.request_timeout, std::time::Duration::MAX);
    }

    #[tokio::test]
    async fn test_connection_error_names_server() {
        let port = unused_port();
        let client = RpcClient::with_settings(port, &RpcSettings::default()).unwrap();
        match client.is_running().await.unwrap_err() {
            RpcError::Connection { label, address, .. } => {
                assert_eq!(label, format!("the RPC server on port {}", port));
                assert_eq!(address, format!("127.0.0.1:{}", port));
            }
            other => panic!("expected a connection error, got {:?}", other),
        }
    }
}
