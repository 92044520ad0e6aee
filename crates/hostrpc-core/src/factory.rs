//! Turns caller-local script functions into callables on a bridge server.
//!
//! Shipping a function takes five steps:
//! 1. extract its source with decorator and comment lines removed
//! 2. collect the identifiers its body uses that are top-level names of its
//!    defining module
//! 3. synthesize one loader statement per module (with remapped paths) and
//!    one binding line per used name
//! 4. insert those lines as the first statements of the body
//! 5. drop the docstring literal
//!
//! The result is registered with `add_new_callable` and invoked by name.

use crate::args::CallArg;
use crate::client::RpcClient;
use crate::config::RpcSettings;
use crate::error::{Result, RpcError};
use crate::history::ExecutionHistory;
use crate::marshal::CallSite;
use crate::remap::RemapPairs;
use crate::script::{
    declared_names, referenced_identifiers, resolve_module, FunctionSource, ModuleSymbols,
    ScriptFunction, SymbolOrigin, TextSpan,
};
use crate::validation::validate_arguments;
use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source ready to ship, plus where it came from.
struct Shipment {
    lines: Vec<String>,
    locator: String,
}

/// One module the shipped function loads, and the bindings taken from it.
struct ModuleImport {
    path: PathBuf,
    base: String,
    bindings: Vec<String>,
}

/// Registers and runs caller-local functions on one server.
pub struct RpcFactory {
    client: RpcClient,
    remap_pairs: RemapPairs,
    default_imports: Vec<String>,
    search_paths: Vec<PathBuf>,
    path_override: Vec<PathBuf>,
    history: Option<ExecutionHistory>,
}

impl RpcFactory {
    /// A factory configured from the process environment.
    pub fn new(client: RpcClient) -> Self {
        Self::with_settings(client, &RpcSettings::from_env())
    }

    pub fn with_settings(client: RpcClient, settings: &RpcSettings) -> Self {
        Self {
            client,
            remap_pairs: RemapPairs::default(),
            default_imports: Vec::new(),
            search_paths: Vec::new(),
            path_override: settings.additional_paths.clone(),
            history: settings
                .execution_history_file
                .as_ref()
                .map(ExecutionHistory::new),
        }
    }

    pub fn remap_pairs(mut self, remap_pairs: RemapPairs) -> Self {
        self.remap_pairs = remap_pairs;
        self
    }

    /// Statements placed at the top of every shipped function body.
    pub fn default_imports(mut self, imports: Vec<String>) -> Self {
        self.default_imports = imports;
        self
    }

    /// Directories bare `require` specifiers resolve against, locally and on
    /// the server.
    pub fn search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    pub fn history(mut self, history: Option<ExecutionHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// The source lines that would be shipped for `function`.
    pub fn build_source(&self, function: &ScriptFunction) -> Result<Vec<String>> {
        Ok(self.prepare(function)?.lines)
    }

    /// Search paths sent along with a callable.
    ///
    /// An explicit override from the environment replaces the configured
    /// paths and the function's own directory.
    pub fn shipped_search_paths(&self, function: &ScriptFunction) -> Vec<PathBuf> {
        if !self.path_override.is_empty() {
            return self.path_override.clone();
        }
        let mut paths = self.search_paths.clone();
        if let Some(dir) = function.file().parent() {
            let dir = dir.to_path_buf();
            if !paths.contains(&dir) {
                paths.push(dir);
            }
        }
        paths
    }

    /// Ship `function` to the server. Re-registering a name replaces it.
    pub async fn register(&self, function: &ScriptFunction) -> Result<Vec<String>> {
        Ok(self.register_shipment(function).await?.lines)
    }

    /// Validate, register and call `function` with positional arguments.
    ///
    /// Remote exceptions carry a locator for the local definition and the
    /// site of this call. Raw faults pass through unchanged.
    #[track_caller]
    pub fn run_function_remotely<'a>(
        &'a self,
        function: &'a ScriptFunction,
        args: Vec<CallArg>,
    ) -> impl Future<Output = Result<Value>> + 'a {
        self.run_function_at(function, args, CallSite::capture())
    }

    /// [`Self::run_function_remotely`] with an explicit call site.
    pub async fn run_function_at(
        &self,
        function: &ScriptFunction,
        args: Vec<CallArg>,
        call_site: CallSite,
    ) -> Result<Value> {
        validate_arguments(function, &args)?;
        let params: Vec<Value> = args
            .iter()
            .map(|arg| arg.to_wire().unwrap_or(Value::Null))
            .collect();

        let shipment = self.register_shipment(function).await?;
        if let Some(history) = &self.history {
            if let Err(e) = history.record(&shipment.lines, function.name(), &params) {
                warn!("Failed to record execution history: {}", e);
            }
        }

        match self.client.call(function.name(), params).await {
            Err(RpcError::Remote(exception)) => Err(RpcError::Remote(
                exception
                    .with_locator(&shipment.locator)
                    .with_call_site(call_site),
            )),
            other => other,
        }
    }

    async fn register_shipment(&self, function: &ScriptFunction) -> Result<Shipment> {
        let shipment = self.prepare(function)?;
        let search_paths = self.shipped_search_paths(function);
        let confirmation = self
            .client
            .add_new_callable(
                function.name(),
                &shipment.lines.join("\n"),
                &search_paths,
                &self.remap_pairs,
            )
            .await?;
        debug!("{}", confirmation);
        Ok(shipment)
    }

    fn prepare(&self, function: &ScriptFunction) -> Result<Shipment> {
        let source = function.extract()?;
        let symbols = ModuleSymbols::scan(function.file())?;
        let locator = format!("{}, line {}", function.file().display(), source.def_line);

        let mut lines = source.lines.clone();
        if let Some(span) = source.docstring_span {
            strip_docstring(&mut lines, span);
        }
        let mut body_open = source.body_open;
        split_open_brace(&mut lines, body_open, source.body_brace, &source.body_indent);

        let mut imports: Vec<String> = Vec::new();
        for line in self
            .default_imports
            .iter()
            .cloned()
            .chain(self.synthesize_imports(function, &source, &symbols))
        {
            if !imports.contains(&line) {
                imports.push(line);
            }
        }

        for line in imports {
            body_open += 1;
            lines.insert(body_open, format!("{}{}", source.body_indent, line));
        }

        Ok(Shipment { lines, locator })
    }

    fn synthesize_imports(
        &self,
        function: &ScriptFunction,
        source: &FunctionSource,
        symbols: &ModuleSymbols,
    ) -> Vec<String> {
        let body = body_text(source);
        let mut excluded: BTreeSet<String> = declared_names(&body);
        excluded.extend(source.params.iter().cloned());
        excluded.insert(function.name().to_string());

        let used: Vec<String> = referenced_identifiers(&body)
            .into_iter()
            .filter(|name| symbols.contains(name) && !excluded.contains(name))
            .collect();

        let local_dir = function.file().parent().map(Path::to_path_buf);
        let own_path = normalize(function.file());
        let mut modules: Vec<ModuleImport> = Vec::new();
        let mut fallbacks: Vec<String> = Vec::new();

        for name in &used {
            let (module_path, binding) = match symbols.get(name) {
                Some(SymbolOrigin::Local) => (own_path.clone(), format!("{{ {} }}", name)),
                Some(SymbolOrigin::Named { module, exported }) => {
                    let binding = if exported == name {
                        format!("{{ {} }}", name)
                    } else {
                        format!("{{ {}: {} }}", exported, name)
                    };
                    match resolve_module(module, local_dir.as_deref(), &self.search_paths) {
                        Some(path) => (path, binding),
                        None => {
                            fallbacks.push(format!("const {} = require({});", binding, quote(module)));
                            continue;
                        }
                    }
                }
                Some(SymbolOrigin::Namespace { module }) => {
                    match resolve_module(module, local_dir.as_deref(), &self.search_paths) {
                        Some(path) => {
                            let remote = self.remap_pairs.apply(&path);
                            fallbacks.push(format!(
                                "const {} = __rpc_import({});",
                                name,
                                quote(&remote.to_string_lossy())
                            ));
                        }
                        None => fallbacks.push(format!("const {} = require({});", name, quote(module))),
                    }
                    continue;
                }
                None => continue,
            };

            match modules.iter_mut().find(|m| m.path == module_path) {
                Some(module) => module.bindings.push(binding),
                None => {
                    let base = unique_base(&module_path, &modules, &used, &excluded);
                    modules.push(ModuleImport {
                        path: module_path,
                        base,
                        bindings: vec![binding],
                    });
                }
            }
        }

        let mut lines = Vec::new();
        for module in modules {
            let remote = self.remap_pairs.apply(&module.path);
            lines.push(format!(
                "const {} = __rpc_import({});",
                module.base,
                quote(&remote.to_string_lossy())
            ));
            for binding in module.bindings {
                lines.push(format!("const {} = {};", binding, module.base));
            }
        }
        lines.extend(fallbacks);
        lines
    }
}

/// Function text after the opening brace of its body.
fn body_text(source: &FunctionSource) -> String {
    let open = &source.lines[source.body_open];
    let after_brace = open.get(source.body_brace + 1..).unwrap_or("");
    std::iter::once(after_brace)
        .chain(source.lines[source.body_open + 1..].iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Move any code after the body's opening brace onto its own line.
fn split_open_brace(lines: &mut Vec<String>, body_open: usize, brace: usize, indent: &str) {
    if !lines[body_open].get(brace..).is_some_and(|rest| rest.starts_with('{')) {
        return;
    }
    let rest = lines[body_open][brace + 1..].trim().to_string();
    if rest.is_empty() {
        return;
    }
    lines[body_open].truncate(brace + 1);

    match rest.strip_suffix('}') {
        Some(inner) => {
            let inner = inner.trim();
            let mut tail = Vec::new();
            if !inner.is_empty() {
                tail.push(format!("{}{}", indent, inner));
            }
            tail.push("}".to_string());
            lines.splice(body_open + 1..body_open + 1, tail);
        }
        None => lines.insert(body_open + 1, format!("{}{}", indent, rest)),
    }
}

/// Cut the docstring statement out of `lines`, dropping lines it leaves empty.
fn strip_docstring(lines: &mut Vec<String>, span: TextSpan) {
    let ((first, from), (last, to)) = (span.start, span.end);
    let (Some(head), Some(tail)) = (
        lines.get(first).and_then(|l| l.get(..from)),
        lines.get(last).and_then(|l| l.get(to..)),
    ) else {
        return;
    };
    let joined = format!("{}{}", head, tail.trim_start()).trim_end().to_string();
    let replacement = (!joined.trim().is_empty()).then_some(joined);
    lines.splice(first..=last, replacement);
}

/// Variable name for a module's loader binding.
fn unique_base(
    path: &Path,
    modules: &[ModuleImport],
    used: &[String],
    excluded: &BTreeSet<String>,
) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "module".to_string());
    let mut base: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '$' { c } else { '_' })
        .collect();
    if base.is_empty() || base.starts_with(|c: char| c.is_ascii_digit()) {
        base.insert(0, '_');
    }

    let taken = |candidate: &str| {
        used.iter().any(|u| u == candidate)
            || excluded.contains(candidate)
            || modules.iter().any(|m| m.base == candidate)
    };
    if !taken(&base) {
        return base;
    }
    let base = format!("{}_module", base);
    let mut candidate = base.clone();
    let mut n = 2;
    while taken(&candidate) {
        candidate = format!("{}{}", base, n);
        n += 1;
    }
    candidate
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| format!("\"{}\"", text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptEngine;
    use std::fs;
    use tempfile::TempDir;

    const GEOMETRY: &str = r#"const { clamp } = require("./math");
const SCALE = 2;

function helper(x) {
    return x * SCALE;
}

@remote_call(9998)
function scaled(a) {
    "Scale and clamp.";
    // scale first
    const doubled = helper(a);
    return clamp(doubled, 0, 10);
}

function one(x) { return helper(x); }
"#;

    fn fixture() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = fs::canonicalize(temp.path()).unwrap();
        fs::write(root.join("geometry.js"), GEOMETRY).unwrap();
        fs::write(
            root.join("math.js"),
            "function clamp(v, lo, hi) { return Math.min(Math.max(v, lo), hi); }\n",
        )
        .unwrap();
        (temp, root)
    }

    fn factory() -> RpcFactory {
        let client = RpcClient::with_settings(9998, &RpcSettings::default()).unwrap();
        RpcFactory::with_settings(client, &RpcSettings::default())
    }

    #[test]
    fn test_build_source_synthesizes_imports() {
        let (_temp, root) = fixture();
        let function = ScriptFunction::new(root.join("geometry.js"), "scaled");
        let lines = factory().build_source(&function).unwrap();

        assert_eq!(lines[0], "function scaled(a) {");
        assert_eq!(
            lines[1],
            format!("    const math = __rpc_import({});", quote(&root.join("math.js").to_string_lossy()))
        );
        assert_eq!(lines[2], "    const { clamp } = math;");
        assert_eq!(
            lines[3],
            format!(
                "    const geometry = __rpc_import({});",
                quote(&root.join("geometry.js").to_string_lossy())
            )
        );
        assert_eq!(lines[4], "    const { helper } = geometry;");
        assert_eq!(lines[5], "    const doubled = helper(a);");
        assert!(!lines.iter().any(|l| l.contains("Scale and clamp")));
        assert!(!lines.iter().any(|l| l.contains("SCALE")));
        assert!(!lines.iter().any(|l| l.trim_start().starts_with("//")));
        assert_eq!(lines.last().map(String::as_str), Some("}"));
    }

    #[test]
    fn test_remap_applies_to_loader_paths() {
        let (_temp, root) = fixture();
        let function = ScriptFunction::new(root.join("geometry.js"), "scaled");
        let lines = factory()
            .remap_pairs(RemapPairs::new().with(root.to_string_lossy(), "/remote/tools"))
            .build_source(&function)
            .unwrap();
        assert!(lines.contains(&"    const math = __rpc_import(\"/remote/tools/math.js\");".to_string()));
        assert!(lines
            .contains(&"    const geometry = __rpc_import(\"/remote/tools/geometry.js\");".to_string()));
    }

    #[test]
    fn test_one_line_function_is_split() {
        let (_temp, root) = fixture();
        let function = ScriptFunction::new(root.join("geometry.js"), "one");
        let lines = factory()
            .default_imports(vec!["const scene = require(\"scene\");".into()])
            .build_source(&function)
            .unwrap();
        assert_eq!(lines[0], "function one(x) {");
        assert_eq!(lines[1], "    const scene = require(\"scene\");");
        assert!(lines[2].starts_with("    const geometry = __rpc_import("));
        assert_eq!(lines[3], "    const { helper } = geometry;");
        assert_eq!(lines[4], "    return helper(x);");
        assert_eq!(lines[5], "}");
    }

    #[test]
    fn test_base_name_avoids_collisions() {
        let (_temp, root) = fixture();
        fs::write(
            root.join("helper.js"),
            "function helper(x) { return x; }\nfunction run(v) {\n    return helper(v);\n}\n",
        )
        .unwrap();
        let function = ScriptFunction::new(root.join("helper.js"), "run");
        let lines = factory().build_source(&function).unwrap();
        assert!(lines[1].starts_with("    const helper_module = __rpc_import("));
        assert_eq!(lines[2], "    const { helper } = helper_module;");
    }

    #[test]
    fn test_docstring_removal_keeps_template_literals() {
        let (_temp, root) = fixture();
        fs::write(
            root.join("report.js"),
            "function report(n) {\n    \"Build a report.\";\n    const text = `count:\n${n}\n`;\n    return text;\n}\n",
        )
        .unwrap();
        let function = ScriptFunction::new(root.join("report.js"), "report");
        let lines = factory().build_source(&function).unwrap();
        assert_eq!(
            lines,
            vec![
                "function report(n) {",
                "    const text = `count:",
                "${n}",
                "`;",
                "    return text;",
                "}",
            ]
        );

        let value = ScriptEngine::run(&[], "report", &lines.join("\n"), &[serde_json::json!(3)]).unwrap();
        assert_eq!(value, serde_json::json!("count:\n3\n"));
    }

    #[test]
    fn test_inline_docstring_is_cut_from_brace_line() {
        let (_temp, root) = fixture();
        fs::write(root.join("inline.js"), "function inline(x) { \"Doubles x.\"; return x * 2; }\n").unwrap();
        let function = ScriptFunction::new(root.join("inline.js"), "inline");
        let lines = factory().build_source(&function).unwrap();
        assert_eq!(lines, vec!["function inline(x) {", "    return x * 2;", "}"]);
    }

    #[test]
    fn test_destructured_params_ship_whole_body() {
        let (_temp, root) = fixture();
        fs::write(
            root.join("place.js"),
            "function place({ x, y }) {\n    const sum = x + y;\n    return sum;\n}\n",
        )
        .unwrap();
        let function = ScriptFunction::new(root.join("place.js"), "place");
        let lines = factory().build_source(&function).unwrap();
        assert_eq!(
            lines,
            vec!["function place({ x, y }) {", "    const sum = x + y;", "    return sum;", "}"]
        );

        let value = ScriptEngine::run(
            &[],
            "place",
            &lines.join("\n"),
            &[serde_json::json!({"x": 2, "y": 5})],
        )
        .unwrap();
        assert_eq!(value, serde_json::json!(7));
    }

    #[test]
    fn test_interpolated_names_are_imported() {
        let (_temp, root) = fixture();
        fs::write(
            root.join("label.js"),
            "function unit(n) { return n + \"cm\"; }\nfunction label(n) { return `size ${unit(n)}`; }\n",
        )
        .unwrap();
        let function = ScriptFunction::new(root.join("label.js"), "label");
        let lines = factory().build_source(&function).unwrap();
        assert!(lines.contains(&"    const { unit } = label_module;".to_string()));

        let value = ScriptEngine::run(&[], "label", &lines.join("\n"), &[serde_json::json!(4)]).unwrap();
        assert_eq!(value, serde_json::json!("size 4cm"));
    }

    #[test]
    fn test_search_path_override() {
        let function = ScriptFunction::new("/work/scripts/a.js", "a");
        let settings = RpcSettings {
            additional_paths: vec![PathBuf::from("/override")],
            ..RpcSettings::default()
        };
        let client = RpcClient::with_settings(9998, &settings).unwrap();
        let overridden = RpcFactory::with_settings(client, &settings);
        assert_eq!(overridden.shipped_search_paths(&function), vec![PathBuf::from("/override")]);

        let configured = factory().search_paths(vec![PathBuf::from("/lib")]);
        assert_eq!(
            configured.shipped_search_paths(&function),
            vec![PathBuf::from("/lib"), PathBuf::from("/work/scripts")]
        );
    }
}
