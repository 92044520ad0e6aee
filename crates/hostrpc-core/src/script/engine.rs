//! Embedded script engine that runs shipped callables.
//!
//! Every engine owns a fresh Boa context. Contexts are not `Send`, so an
//! engine is created on the thread that executes the call and dropped when
//! the call returns. Module imports resolve against the search paths given at
//! construction.
//!
//! Bridge internals live under the `__rpc_` prefix and keep their own
//! references to the builtins they use, so shipped code may redefine any
//! other global.

use super::symbols::{resolve_module, wrap_module};
use boa_engine::{
    Context, JsArgs, JsError, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Global names the engine defines for its own use.
pub const ENGINE_GLOBALS: &[&str] = &["require", "process", "globalThis"];

/// Prefix of every engine-internal global.
pub const INTERNAL_PREFIX: &str = "__rpc_";

/// An exception raised by script code, keyed by its constructor name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct ScriptFault {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ScriptFault {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Text written to a traceback file for this fault.
    pub fn traceback(&self) -> String {
        match &self.stack {
            Some(stack) if !stack.trim().is_empty() => format!("{}\n{}", self, stack),
            _ => self.to_string(),
        }
    }

    fn from_js_error(err: JsError) -> Self {
        let text = err.to_string();
        match text.split_once(": ") {
            Some((name, message)) if is_identifier(name) => Self::new(name, message),
            _ => Self::new("Error", text),
        }
    }
}

/// Module loading and `process.env`, evaluated once per context.
const PRELUDE: &str = r#"
var __rpc_eval = eval;
var __rpc_stringify = JSON.stringify;
var __rpc_String = String;
var __rpc_Error = Error;
var __rpc_modules = {};
function __rpc_import(path) {
    var resolved = __rpc_locate(path, "", __rpc_stringify(__rpc_search_paths));
    if (resolved === null) {
        throw new __rpc_Error("Cannot find module '" + path + "'");
    }
    if (!(resolved in __rpc_modules)) {
        __rpc_modules[resolved] = {};
        __rpc_modules[resolved] = __rpc_eval(__rpc_read_module(resolved));
    }
    return __rpc_modules[resolved];
}
function __rpc_require(spec, dir) {
    var resolved = __rpc_locate(spec, dir, __rpc_stringify(__rpc_search_paths));
    if (resolved === null) {
        throw new __rpc_Error("Cannot find module '" + spec + "'");
    }
    return __rpc_import(resolved);
}
function require(spec) {
    return __rpc_require(spec, "");
}
"#;

/// Runs an expression and reports its value or the exception it raised as a
/// JSON string. `%EXPR%` is replaced with the expression.
const HARNESS: &str = r#"
(function () {
    try {
        var __rpc_value = (%EXPR%);
        return __rpc_stringify({ ok: true, value: __rpc_value === undefined ? null : __rpc_value });
    } catch (__rpc_caught) {
        var __rpc_is_error = __rpc_caught instanceof __rpc_Error;
        var __rpc_name = "Error";
        if (__rpc_is_error) {
            __rpc_name = __rpc_caught.name && __rpc_caught.name !== "Error"
                ? __rpc_String(__rpc_caught.name)
                : (__rpc_caught.constructor && __rpc_caught.constructor.name
                    ? __rpc_String(__rpc_caught.constructor.name)
                    : "Error");
        }
        return __rpc_stringify({
            ok: false,
            name: __rpc_name,
            message: __rpc_is_error ? __rpc_String(__rpc_caught.message) : __rpc_String(__rpc_caught),
            stack: __rpc_is_error && __rpc_caught.stack ? __rpc_String(__rpc_caught.stack) : null
        });
    }
})()
"#;

#[derive(Debug, Deserialize)]
struct HarnessOutcome {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    stack: Option<String>,
}

/// One script context with the bridge's module loader installed.
pub struct ScriptEngine {
    context: Context,
}

impl ScriptEngine {
    /// Create a context whose `require` and `__rpc_import` resolve against
    /// `search_paths`, with `process.env` reflecting the current environment.
    pub fn new(search_paths: &[PathBuf]) -> Result<Self, ScriptFault> {
        Self::with_env(search_paths, &BTreeMap::new())
    }

    /// Like [`Self::new`], with `env_overlay` layered over the process
    /// environment in `process.env`.
    pub fn with_env(
        search_paths: &[PathBuf],
        env_overlay: &BTreeMap<String, String>,
    ) -> Result<Self, ScriptFault> {
        let mut context = Context::default();

        for (name, length, body) in [
            ("__rpc_locate", 3, locate as NativeFnPtr),
            ("__rpc_read_module", 1, read_module as NativeFnPtr),
        ] {
            context
                .register_global_callable(JsString::from(name), length, NativeFunction::from_fn_ptr(body))
                .map_err(ScriptFault::from_js_error)?;
        }

        let paths: Vec<String> = search_paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        let mut env: serde_json::Map<String, Value> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, Value::String(v.into_string().ok()?))))
            .collect();
        for (name, value) in env_overlay {
            env.insert(name.clone(), Value::String(value.clone()));
        }
        let globals = format!(
            "var __rpc_search_paths = {};\nvar process = {{ env: {} }};\n",
            serde_json::to_string(&paths).map_err(internal)?,
            serde_json::to_string(&env).map_err(internal)?,
        );

        let mut engine = Self { context };
        engine.eval(&globals)?;
        engine.eval(PRELUDE)?;
        Ok(engine)
    }

    /// Evaluate shipped source and check that it defines function `name`.
    pub fn define(&mut self, name: &str, source: &str) -> Result<(), ScriptFault> {
        let source_literal = serde_json::to_string(source).map_err(internal)?;
        let name_literal = serde_json::to_string(name).map_err(internal)?;
        let expression = format!(
            "__rpc_eval({}), typeof globalThis[{}] === \"function\"",
            source_literal, name_literal
        );
        match self.run_guarded(&expression)? {
            Value::Bool(true) => Ok(()),
            _ => Err(ScriptFault::new(
                "ReferenceError",
                format!("the shipped source does not define a function named '{}'", name),
            )),
        }
    }

    /// Call a previously defined function with positional arguments.
    pub fn invoke(&mut self, name: &str, args: &[Value]) -> Result<Value, ScriptFault> {
        let name_literal = serde_json::to_string(name).map_err(internal)?;
        let args_literal = serde_json::to_string(args).map_err(internal)?;
        self.run_guarded(&format!("globalThis[{}].apply(null, {})", name_literal, args_literal))
    }

    /// Define `name` from `source` and call it once.
    pub fn run(search_paths: &[PathBuf], name: &str, source: &str, args: &[Value]) -> Result<Value, ScriptFault> {
        let mut engine = Self::new(search_paths)?;
        engine.define(name, source)?;
        engine.invoke(name, args)
    }

    fn run_guarded(&mut self, expression: &str) -> Result<Value, ScriptFault> {
        let output = self.eval(&HARNESS.replace("%EXPR%", expression))?;
        let outcome: HarnessOutcome = serde_json::from_str(&output).map_err(internal)?;
        if outcome.ok {
            return Ok(outcome.value);
        }
        Err(ScriptFault {
            name: outcome.name.unwrap_or_else(|| "Error".to_string()),
            message: outcome.message.unwrap_or_default(),
            stack: outcome.stack,
        })
    }

    fn eval(&mut self, code: &str) -> Result<String, ScriptFault> {
        let value = self
            .context
            .eval(Source::from_bytes(code))
            .map_err(ScriptFault::from_js_error)?;
        let text = value
            .to_string(&mut self.context)
            .map_err(ScriptFault::from_js_error)?;
        Ok(text.to_std_string_escaped())
    }
}

type NativeFnPtr = fn(&JsValue, &[JsValue], &mut Context) -> JsResult<JsValue>;

fn arg_string(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    let value = args.get_or_undefined(index);
    if value.is_null_or_undefined() {
        return Ok(String::new());
    }
    Ok(value.to_string(context)?.to_std_string_escaped())
}

/// `__rpc_locate(spec, dir, searchPathsJson)`: resolved file path or `null`.
fn locate(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let spec = arg_string(args, 0, context)?;
    let dir = arg_string(args, 1, context)?;
    let search_paths: Vec<PathBuf> = serde_json::from_str::<Vec<String>>(&arg_string(args, 2, context)?)
        .unwrap_or_default()
        .into_iter()
        .map(PathBuf::from)
        .collect();

    let from_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
    Ok(match resolve_module(&spec, from_dir.as_deref(), &search_paths) {
        Some(path) => JsValue::from(JsString::from(path.to_string_lossy().as_ref())),
        None => JsValue::null(),
    })
}

/// `__rpc_read_module(path)`: module text wrapped for evaluation.
fn read_module(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let path = PathBuf::from(arg_string(args, 0, context)?);
    let text = std::fs::read_to_string(&path).map_err(|e| {
        let message = format!("Cannot read module '{}': {}", path.display(), e);
        JsError::from(JsNativeError::error().with_message(message))
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new(""));
    Ok(JsValue::from(JsString::from(wrap_module(&text, dir).as_str())))
}

fn internal(err: serde_json::Error) -> ScriptFault {
    ScriptFault::new("InternalError", err.to_string())
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_define_and_invoke() {
        let mut engine = ScriptEngine::new(&[]).unwrap();
        engine
            .define("add", "function add(a, b) {\n    return a + b;\n}")
            .unwrap();
        assert_eq!(engine.invoke("add", &[json!(2), json!(3)]).unwrap(), json!(5));
        assert_eq!(
            engine.invoke("add", &[json!("a"), json!("b")]).unwrap(),
            json!("ab")
        );
    }

    #[test]
    fn test_undefined_becomes_null() {
        let value =
            ScriptEngine::run(&[], "noop", "function noop() {}", &[]).unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_thrown_error_keeps_name() {
        let err = ScriptEngine::run(
            &[],
            "explode",
            "function explode(n) { if (typeof n !== \"number\") { throw new TypeError(\"not a number\"); } }",
            &[json!("x")],
        )
        .unwrap_err();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message, "not a number");
        assert_eq!(err.to_string(), "TypeError: not a number");
    }

    #[test]
    fn test_custom_error_class_name() {
        let source = "function fail() {\n    class ValueError extends Error {}\n    throw new ValueError(\"boom\");\n}";
        let err = ScriptEngine::run(&[], "fail", source, &[]).unwrap_err();
        assert_eq!(err.name, "ValueError");
        assert_eq!(err.message, "boom");
    }

    #[test]
    fn test_syntax_error_on_define() {
        let mut engine = ScriptEngine::new(&[]).unwrap();
        let err = engine.define("broken", "function broken( {").unwrap_err();
        assert_eq!(err.name, "SyntaxError");
    }

    #[test]
    fn test_define_requires_named_function() {
        let mut engine = ScriptEngine::new(&[]).unwrap();
        let err = engine.define("missing", "function other() {}").unwrap_err();
        assert_eq!(err.name, "ReferenceError");
    }

    #[test]
    fn test_import_sibling_module() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("math.js"),
            "const OFFSET = 10;\nfunction shift(x) { return x + OFFSET; }\n",
        )
        .unwrap();
        fs::write(
            temp.path().join("shapes.js"),
            "const { shift } = require(\"./math\");\nfunction area(w, h) { return shift(w * h); }\n",
        )
        .unwrap();

        let source = format!(
            "function measure(w) {{\n    const shapes = __rpc_import({});\n    const {{ area }} = shapes;\n    return area(w, 2);\n}}",
            serde_json::to_string(&temp.path().join("shapes.js").to_string_lossy()).unwrap()
        );
        let value = ScriptEngine::run(&[], "measure", &source, &[json!(3)]).unwrap();
        assert_eq!(value, json!(16));
    }

    #[test]
    fn test_require_uses_search_paths() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("greeting.js"), "function hello(n) { return \"hi \" + n; }\n").unwrap();

        let source = "function greet(n) {\n    return require(\"greeting\").hello(n);\n}";
        let value =
            ScriptEngine::run(&[temp.path().to_path_buf()], "greet", source, &[json!("bob")]).unwrap();
        assert_eq!(value, json!("hi bob"));

        let err = ScriptEngine::run(&[], "greet", source, &[json!("bob")]).unwrap_err();
        assert!(err.message.contains("Cannot find module 'greeting'"));
    }

    #[test]
    fn test_names_used_by_the_harness_are_callable() {
        for name in ["value", "name", "isError", "e", "stringify"] {
            let source = format!("function {}(x) {{ return x + 1; }}", name);
            let value = ScriptEngine::run(&[], name, &source, &[json!(1)]).unwrap();
            assert_eq!(value, json!(2), "{}", name);
        }
    }

    #[test]
    fn test_redefined_builtins_do_not_break_reporting() {
        let source = "function String() { throw new Error(\"shadowed\"); }";
        let err = ScriptEngine::run(&[], "String", source, &[]).unwrap_err();
        assert_eq!(err.name, "Error");
        assert_eq!(err.message, "shadowed");
    }

    #[test]
    fn test_env_overlay_reaches_process_env() {
        let overlay = BTreeMap::from([("HOSTRPC_OVERLAY_ONLY".to_string(), "7".to_string())]);
        let mut engine = ScriptEngine::with_env(&[], &overlay).unwrap();
        engine
            .define("read", "function read(k) { return process.env[k]; }")
            .unwrap();
        assert_eq!(engine.invoke("read", &[json!("HOSTRPC_OVERLAY_ONLY")]).unwrap(), json!("7"));
        assert_eq!(std::env::var("HOSTRPC_OVERLAY_ONLY").ok(), None);
    }

    #[test]
    fn test_missing_module_message() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("gone.js");
        let source = format!(
            "function load() {{ return __rpc_import({}); }}",
            serde_json::to_string(&missing.to_string_lossy()).unwrap()
        );
        let err = ScriptEngine::run(&[], "load", &source, &[]).unwrap_err();
        assert_eq!(err.name, "Error");
        assert!(err.message.contains("Cannot find module"));
    }

    #[test]
    fn test_unreadable_module_raises() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("vanished.js");
        let mut context = Context::default();
        let args = [JsValue::from(JsString::from(missing.to_string_lossy().as_ref()))];
        let err = read_module(&JsValue::undefined(), &args, &mut context).unwrap_err();
        assert!(err.to_string().contains("Cannot read module"));
    }

    #[test]
    fn test_traceback_text() {
        let mut fault = ScriptFault::new("Error", "bad");
        assert_eq!(fault.traceback(), "Error: bad");
        fault.stack = Some("at f (x.js:1)".into());
        assert_eq!(fault.traceback(), "Error: bad\nat f (x.js:1)");
    }
}
