//! Call-site wrappers that make a caller-local function run remotely.
//!
//! ```rust,ignore
//! let remote = remote_call(9998, vec![], RemapPairs::new());
//! let add = remote.wrap(ScriptFunction::new("/scripts/math.js", "add"));
//! assert_eq!(add.call(call_args![2, 3]).await?, json!(5));
//! ```
//!
//! Every invocation checks that the defining file is saved and that no
//! keyword arguments were passed, then builds a fresh client and factory
//! bound to the port.

use crate::args::Arguments;
use crate::client::RpcClient;
use crate::config::RpcSettings;
use crate::error::{Result, RpcError};
use crate::factory::RpcFactory;
use crate::marshal::CallSite;
use crate::remap::RemapPairs;
use crate::script::{ScriptClass, ScriptFunction};
use crate::validation::{validate_class_method, validate_file_is_saved, validate_key_word_parameters};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;

/// Wrap functions so their calls run on the server at `port`.
pub fn remote_call(port: u16, default_imports: Vec<String>, remap_pairs: RemapPairs) -> RemoteCall {
    RemoteCall {
        port,
        default_imports,
        remap_pairs,
        settings: RpcSettings::from_env(),
    }
}

/// Configuration shared by every function it wraps.
#[derive(Debug, Clone)]
pub struct RemoteCall {
    port: u16,
    default_imports: Vec<String>,
    remap_pairs: RemapPairs,
    settings: RpcSettings,
}

impl RemoteCall {
    pub fn new(port: u16) -> Self {
        remote_call(port, Vec::new(), RemapPairs::default())
    }

    /// Replace the environment-derived settings.
    pub fn settings(mut self, settings: RpcSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn wrap(&self, function: ScriptFunction) -> RemoteFunction {
        RemoteFunction {
            remote: self.clone(),
            function,
        }
    }

    fn factory(&self) -> Result<RpcFactory> {
        let client = RpcClient::with_settings(self.port, &self.settings)?;
        Ok(RpcFactory::with_settings(client, &self.settings)
            .remap_pairs(self.remap_pairs.clone())
            .default_imports(self.default_imports.clone()))
    }
}

/// A function whose calls execute on the server.
#[derive(Debug, Clone)]
pub struct RemoteFunction {
    remote: RemoteCall,
    function: ScriptFunction,
}

impl RemoteFunction {
    pub fn function(&self) -> &ScriptFunction {
        &self.function
    }

    /// Call the function remotely and return its result.
    #[track_caller]
    pub fn call(&self, args: impl Into<Arguments>) -> impl Future<Output = Result<Value>> + '_ {
        self.call_at(args.into(), CallSite::capture())
    }

    async fn call_at(&self, args: Arguments, call_site: CallSite) -> Result<Value> {
        validate_file_is_saved(&self.function)?;
        validate_key_word_parameters(&self.function, &args.keyword)?;
        let factory = self.remote.factory()?;
        factory
            .run_function_at(&self.function, args.positional, call_site)
            .await
    }
}

/// Wrap every member of `class`. Fails unless all of them are static.
pub fn remote_class(remote: &RemoteCall, class: ScriptClass) -> Result<RemoteClass> {
    let mut methods = BTreeMap::new();
    for member in class.members() {
        validate_class_method(&class, member)?;
        methods.insert(member.name.clone(), remote.wrap(class.function(member)));
    }
    Ok(RemoteClass { class, methods })
}

/// A class whose static methods execute on the server.
#[derive(Debug, Clone)]
pub struct RemoteClass {
    class: ScriptClass,
    methods: BTreeMap<String, RemoteFunction>,
}

impl RemoteClass {
    pub fn class(&self) -> &ScriptClass {
        &self.class
    }

    pub fn method(&self, name: &str) -> Option<&RemoteFunction> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Call static method `name` remotely.
    #[track_caller]
    pub fn call<'a>(
        &'a self,
        name: &str,
        args: impl Into<Arguments>,
    ) -> impl Future<Output = Result<Value>> + 'a {
        let call_site = CallSite::capture();
        let method = self.methods.get(name).ok_or_else(|| RpcError::FunctionNotFound {
            function: format!("{}.{}", self.class.name(), name),
            path: self.class.file().to_path_buf(),
        });
        call_method(method, args.into(), call_site)
    }
}

async fn call_method(
    method: Result<&RemoteFunction>,
    args: Arguments,
    call_site: CallSite,
) -> Result<Value> {
    method?.call_at(args, call_site).await
}
