//! Method dispatch: the fixed control surface, introspection, and the
//! callables registered at runtime.

use crate::error::{Result, RpcError};
use crate::host::{Callable, HostAdapter, ThreadSafeCall};
use crate::protocol::MulticallEntry;
use crate::remap::RemapPairs;
use crate::script::{ScriptEngine, ScriptFault, ENGINE_GLOBALS, INTERNAL_PREFIX};
use super::ServerStatus;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

static CALLABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_$][\w$]*$").expect("callable name regex must compile")
});

/// Control endpoints and their help text.
const CONTROL_METHODS: &[(&str, &str)] = &[
    ("is_running", "is_running() -> bool. Whether the server is serving requests."),
    ("kill", "kill() -> bool. Stop serving after this request."),
    (
        "set_env",
        "set_env(name, value). Set an environment variable for callables on this server.",
    ),
    (
        "add_new_callable",
        "add_new_callable(name, source, search_paths, remap_pairs) -> str. Register shipped source as a callable.",
    ),
    ("system.listMethods", "system.listMethods() -> [str]. Names of all methods."),
    ("system.methodHelp", "system.methodHelp(name) -> str. Help text for a method."),
    (
        "system.multicall",
        "system.multicall([{methodName, params}]) -> [[value] | {faultCode, faultString}].",
    ),
];

/// A method registered in the dispatch table.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value>;
}

/// Runs the callable on a blocking worker thread.
pub struct DirectCall(pub Arc<dyn Callable>);

#[async_trait]
impl Procedure for DirectCall {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        let callable = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || callable.call(&args))
            .await
            .map_err(|e| RpcError::Other(format!("callable task failed: {}", e)))?
            .map_err(RpcError::Script)
    }
}

#[async_trait]
impl Procedure for ThreadSafeCall {
    async fn invoke(&self, args: Vec<Value>) -> Result<Value> {
        self.call(args).await
    }
}

/// Variables set through `set_env`, layered over the process environment.
type EnvOverlay = Arc<std::sync::RwLock<BTreeMap<String, String>>>;

/// Shipped script source, evaluated in a fresh engine on every call.
pub struct ShippedCallable {
    name: String,
    source: String,
    search_paths: Arc<std::sync::RwLock<Vec<PathBuf>>>,
    env: EnvOverlay,
    traceback_file: Option<PathBuf>,
}

impl ShippedCallable {
    fn run(&self, args: &[Value]) -> std::result::Result<Value, ScriptFault> {
        let paths = self
            .search_paths
            .read()
            .map(|paths| paths.clone())
            .unwrap_or_default();
        let env = self.env.read().map(|env| env.clone()).unwrap_or_default();
        let mut engine = ScriptEngine::with_env(&paths, &env)?;
        engine.define(&self.name, &self.source)?;
        engine.invoke(&self.name, args)
    }
}

impl Callable for ShippedCallable {
    fn call(&self, args: &[Value]) -> std::result::Result<Value, ScriptFault> {
        let result = self.run(args);
        if let (Err(fault), Some(path)) = (&result, &self.traceback_file) {
            if let Err(e) = std::fs::write(path, fault.traceback()) {
                warn!("Could not write traceback file {}: {}", path.display(), e);
            }
        }
        result
    }
}

struct Registered {
    procedure: Arc<dyn Procedure>,
    help: String,
}

/// State shared by the HTTP handlers of one server.
pub struct ServerState {
    procedures: RwLock<HashMap<String, Registered>>,
    search_paths: Arc<std::sync::RwLock<Vec<PathBuf>>>,
    env: EnvOverlay,
    host: Option<Arc<dyn HostAdapter>>,
    timeout: Duration,
    traceback_file: Option<PathBuf>,
    quit: watch::Sender<bool>,
    status: Mutex<ServerStatus>,
}

impl ServerState {
    pub(crate) fn new(
        host: Option<Arc<dyn HostAdapter>>,
        timeout: Duration,
        traceback_file: Option<PathBuf>,
    ) -> Self {
        Self {
            procedures: RwLock::new(HashMap::new()),
            search_paths: Arc::new(std::sync::RwLock::new(Vec::new())),
            env: Arc::new(std::sync::RwLock::new(BTreeMap::new())),
            host,
            timeout,
            traceback_file,
            quit: watch::channel(false).0,
            status: Mutex::new(ServerStatus::Stopped),
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.status.lock().map(|s| *s).unwrap_or(ServerStatus::Stopped)
    }

    pub(crate) fn set_status(&self, status: ServerStatus) {
        if let Ok(mut current) = self.status.lock() {
            debug!("Server status {:?} -> {:?}", *current, status);
            *current = status;
        }
    }

    pub(crate) fn subscribe_quit(&self) -> watch::Receiver<bool> {
        self.quit.subscribe()
    }

    /// Flip the quit flag; the serve loop stops after the current request.
    pub fn request_quit(&self) {
        self.quit.send_replace(true);
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.search_paths
            .read()
            .map(|paths| paths.clone())
            .unwrap_or_default()
    }

    /// Variables set through `set_env` so far.
    pub fn env(&self) -> BTreeMap<String, String> {
        self.env.read().map(|env| env.clone()).unwrap_or_default()
    }

    /// Register `callable` as `name`, guarded by the host when there is one.
    pub async fn register_callable(&self, name: &str, callable: Arc<dyn Callable>, help: String) {
        let procedure: Arc<dyn Procedure> = match &self.host {
            Some(host) => Arc::new(host.thread_safe_call(callable, self.timeout)),
            None => Arc::new(DirectCall(callable)),
        };
        let previous = self
            .procedures
            .write()
            .await
            .insert(name.to_string(), Registered { procedure, help });
        if previous.is_some() {
            info!("Replaced callable {}", name);
        } else {
            info!("Registered callable {}", name);
        }
    }

    /// Dispatch one call. `system.multicall` fans out to [`Self::dispatch`].
    pub async fn handle(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        if method == "system.multicall" {
            return self.multicall(params).await;
        }
        self.dispatch(method, params).await
    }

    async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        match method {
            "is_running" => Ok(json!(self.status() == ServerStatus::Running)),
            "kill" => {
                info!("Kill requested");
                self.request_quit();
                Ok(json!(true))
            }
            "set_env" => {
                let name = str_param(&params, 0, "name")?;
                let value = str_param(&params, 1, "value")?;
                debug!("set_env {}", name);
                if let Ok(mut env) = self.env.write() {
                    env.insert(name.to_string(), value.to_string());
                }
                Ok(Value::Null)
            }
            "add_new_callable" => self.add_new_callable(params).await.map(Value::String),
            "system.listMethods" => Ok(json!(self.list_methods().await)),
            "system.methodHelp" => {
                let name = str_param(&params, 0, "method_name")?;
                self.method_help(name).await.map(Value::String)
            }
            "system.multicall" => Err(RpcError::InvalidParams {
                message: "system.multicall cannot be nested".to_string(),
            }),
            _ => {
                let procedure = self
                    .procedures
                    .read()
                    .await
                    .get(method)
                    .map(|r| Arc::clone(&r.procedure))
                    .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;
                procedure.invoke(params).await
            }
        }
    }

    async fn add_new_callable(&self, params: Vec<Value>) -> Result<String> {
        let name = str_param(&params, 0, "name")?.to_string();
        let source = str_param(&params, 1, "source")?.to_string();
        let paths: Vec<String> = match params.get(2) {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| RpcError::InvalidParams {
                message: format!("search_paths must be a list of strings: {}", e),
            })?,
        };
        let remap: RemapPairs = match params.get(3) {
            None | Some(Value::Null) => RemapPairs::default(),
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| RpcError::InvalidParams {
                message: format!("remap_pairs must be a list of [local, remote] pairs: {}", e),
            })?,
        };

        if !CALLABLE_NAME.is_match(&name) {
            return Err(RpcError::InvalidParams {
                message: format!("'{}' is not a valid callable name", name),
            });
        }
        if is_reserved(&name) {
            return Err(RpcError::InvalidParams {
                message: format!("'{}' is reserved by the server and cannot be a callable name", name),
            });
        }

        // Search paths only ever grow over a session.
        if let Ok(mut search_paths) = self.search_paths.write() {
            for path in paths {
                let path = PathBuf::from(remap.apply_str(&path));
                if !search_paths.contains(&path) {
                    debug!("Adding search path {}", path.display());
                    search_paths.push(path);
                }
            }
        }

        let check_paths = self.search_paths();
        let check_env = self.env();
        let (check_name, check_source) = (name.clone(), source.clone());
        tokio::task::spawn_blocking(move || {
            ScriptEngine::with_env(&check_paths, &check_env)?.define(&check_name, &check_source)
        })
        .await
        .map_err(|e| RpcError::Other(format!("registration task failed: {}", e)))?
        .map_err(|fault| RpcError::Registration {
            name: name.clone(),
            message: fault.to_string(),
        })?;

        let help = source.lines().next().unwrap_or_default().trim().to_string();
        let callable = Arc::new(ShippedCallable {
            name: name.clone(),
            source,
            search_paths: Arc::clone(&self.search_paths),
            env: Arc::clone(&self.env),
            traceback_file: self.traceback_file.clone(),
        });
        self.register_callable(&name, callable, help).await;

        Ok(format!("'{}' was added to the server", name))
    }

    async fn list_methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = CONTROL_METHODS.iter().map(|(m, _)| m.to_string()).collect();
        let mut registered: Vec<String> = self.procedures.read().await.keys().cloned().collect();
        registered.sort();
        methods.extend(registered);
        methods
    }

    async fn method_help(&self, name: &str) -> Result<String> {
        if let Some((_, help)) = CONTROL_METHODS.iter().find(|(m, _)| *m == name) {
            return Ok(help.to_string());
        }
        self.procedures
            .read()
            .await
            .get(name)
            .map(|r| r.help.clone())
            .ok_or_else(|| RpcError::MethodNotFound(name.to_string()))
    }

    async fn multicall(&self, params: Vec<Value>) -> Result<Value> {
        let batch = params.into_iter().next().unwrap_or(Value::Array(Vec::new()));
        let entries: Vec<MulticallEntry> =
            serde_json::from_value(batch).map_err(|e| RpcError::InvalidParams {
                message: format!("system.multicall expects a list of calls: {}", e),
            })?;

        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let outcome = self.dispatch(&entry.method_name, entry.params).await;
            results.push(match outcome {
                Ok(value) => json!([value]),
                Err(e) => {
                    error!("RPC error for {} in multicall: {}", entry.method_name, e);
                    e.to_fault().to_multicall_entry()
                }
            });
        }
        Ok(Value::Array(results))
    }
}

/// Names that would shadow a control endpoint or an engine global.
fn is_reserved(name: &str) -> bool {
    CONTROL_METHODS.iter().any(|(method, _)| *method == name)
        || ENGINE_GLOBALS.contains(&name)
        || name.starts_with(INTERNAL_PREFIX)
}

fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::InvalidParams {
            message: format!("Missing required parameter: {}", name),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;

    fn state() -> ServerState {
        let state = ServerState::new(None, Duration::from_secs(5), None);
        state.set_status(ServerStatus::Running);
        state
    }

    #[tokio::test]
    async fn test_control_endpoints() {
        let state = state();
        assert_eq!(state.handle("is_running", vec![]).await.unwrap(), json!(true));

        let mut quit = state.subscribe_quit();
        assert_eq!(state.handle("kill", vec![]).await.unwrap(), json!(true));
        assert!(*quit.borrow_and_update());
    }

    #[tokio::test]
    async fn test_add_new_callable_and_invoke() {
        let state = state();
        let confirmation = state
            .handle(
                "add_new_callable",
                vec![json!("add"), json!("function add(a, b) { return a + b; }"), json!([])],
            )
            .await
            .unwrap();
        assert_eq!(confirmation, json!("'add' was added to the server"));
        assert_eq!(state.handle("add", vec![json!(2), json!(3)]).await.unwrap(), json!(5));
    }

    #[tokio::test]
    async fn test_reregistration_overwrites() {
        let state = state();
        for body in ["return 1;", "return 2;"] {
            state
                .handle(
                    "add_new_callable",
                    vec![json!("value"), json!(format!("function value() {{ {} }}", body))],
                )
                .await
                .unwrap();
        }
        assert_eq!(state.handle("value", vec![]).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_registration_failure() {
        let state = state();
        let err = state
            .handle("add_new_callable", vec![json!("broken"), json!("function broken( {")])
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error_code(), protocol::REGISTRATION_FAILED);

        let err = state
            .handle("add_new_callable", vec![json!("not-a-name"), json!("")])
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_error_code(), protocol::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_reserved_names_are_rejected() {
        let state = state();
        for name in ["kill", "set_env", "is_running", "add_new_callable", "require", "process", "__rpc_import"] {
            let err = state
                .handle(
                    "add_new_callable",
                    vec![json!(name), json!(format!("function {}(x) {{ return x; }}", name))],
                )
                .await
                .unwrap_err();
            assert_eq!(err.to_rpc_error_code(), protocol::INVALID_PARAMS, "{}", name);
        }

        let mut quit = state.subscribe_quit();
        assert!(!*quit.borrow_and_update());
        let methods = state.handle("system.listMethods", vec![]).await.unwrap();
        let kills = methods
            .as_array()
            .unwrap()
            .iter()
            .filter(|m| *m == &json!("kill"))
            .count();
        assert_eq!(kills, 1);
    }

    #[tokio::test]
    async fn test_set_env_is_visible_to_callables() {
        let state = state();
        state
            .handle("set_env", vec![json!("HOSTRPC_DISPATCH_ENV"), json!("on")])
            .await
            .unwrap();
        assert_eq!(state.env().get("HOSTRPC_DISPATCH_ENV").map(String::as_str), Some("on"));
        assert_eq!(std::env::var("HOSTRPC_DISPATCH_ENV").ok(), None);

        state
            .handle(
                "add_new_callable",
                vec![json!("read_env"), json!("function read_env(k) { return process.env[k]; }")],
            )
            .await
            .unwrap();
        assert_eq!(
            state.handle("read_env", vec![json!("HOSTRPC_DISPATCH_ENV")]).await.unwrap(),
            json!("on")
        );
    }

    #[tokio::test]
    async fn test_search_paths_are_remapped_and_ratcheted() {
        let state = state();
        for paths in [json!(["/local/tools", "/opt/lib"]), json!(["/local/tools"])] {
            state
                .handle(
                    "add_new_callable",
                    vec![
                        json!("f"),
                        json!("function f() {}"),
                        paths,
                        json!([["/local", "/remote"]]),
                    ],
                )
                .await
                .unwrap();
        }
        assert_eq!(
            state.search_paths(),
            vec![PathBuf::from("/remote/tools"), PathBuf::from("/opt/lib")]
        );
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let err = state().handle("nope", vec![]).await.unwrap_err();
        assert_eq!(err.to_rpc_error_code(), protocol::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_multicall_and_introspection() {
        let state = state();
        state
            .handle(
                "add_new_callable",
                vec![json!("twice"), json!("function twice(x) {\n    return x * 2;\n}")],
            )
            .await
            .unwrap();

        let results = state
            .handle(
                "system.multicall",
                vec![json!([
                    {"methodName": "twice", "params": [4]},
                    {"methodName": "missing", "params": []},
                ])],
            )
            .await
            .unwrap();
        assert_eq!(results[0], json!([8]));
        assert_eq!(results[1]["faultCode"], json!(protocol::METHOD_NOT_FOUND));

        let methods = state.handle("system.listMethods", vec![]).await.unwrap();
        assert!(methods.as_array().unwrap().contains(&json!("twice")));
        assert_eq!(
            state.handle("system.methodHelp", vec![json!("twice")]).await.unwrap(),
            json!("function twice(x) {")
        );
    }
}
