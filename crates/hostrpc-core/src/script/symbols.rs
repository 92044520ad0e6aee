//! Module-level symbol scanning.
//!
//! The scan is deliberately shallow: it looks at top-level declarations and
//! `require` bindings only, and treats every identifier in a function body as
//! a potential reference, including those inside template interpolations.
//! It may over-include, never silently drops a top-level name.

use super::lexer::{line_depths, mask_non_code};
use crate::error::{Result, RpcError};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static FUNCTION_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)")
        .expect("function declaration regex must compile")
});

static CLASS_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?class\s+([A-Za-z_$][\w$]*)")
        .expect("class declaration regex must compile")
});

static NAMESPACE_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*=\s*require\(\s*["'`]([^"'`]+)["'`]\s*\)"#)
        .expect("namespace require regex must compile")
});

static NAMED_REQUIRE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*(?:const|let|var)\s*\{([^}]*)\}\s*=\s*require\(\s*["'`]([^"'`]+)["'`]\s*\)"#)
        .expect("named require regex must compile")
});

static VARIABLE_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)")
        .expect("variable declaration regex must compile")
});

static LOCAL_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:const|let|var|function|class)\s+\*?\s*([A-Za-z_$][\w$]*)")
        .expect("local declaration regex must compile")
});

static LOCAL_DESTRUCTURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:const|let|var)\s*[\{\[]([^;]*?)[\}\]]\s*=")
        .expect("destructuring regex must compile")
});

static CATCH_BINDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bcatch\s*\(\s*([A-Za-z_$][\w$]*)").expect("catch binding regex must compile")
});

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_$][\w$]*").expect("identifier regex must compile"));

/// Where a module-level name comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolOrigin {
    /// Declared in the module itself.
    Local,
    /// `const NAME = require("module")`.
    Namespace { module: String },
    /// `const { exported: NAME } = require("module")`.
    Named { module: String, exported: String },
}

/// The top-level names of one script module.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleSymbols {
    symbols: BTreeMap<String, SymbolOrigin>,
}

impl ModuleSymbols {
    /// Read and scan a module file.
    pub fn scan(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| RpcError::io_with_path(e, path))?;
        Ok(Self::parse(&text))
    }

    /// Scan module text for top-level declarations.
    pub fn parse(text: &str) -> Self {
        let masked = mask_non_code(text);
        let depths = line_depths(&masked);
        let mut symbols = BTreeMap::new();

        for ((line, masked_line), depth) in text.lines().zip(masked.lines()).zip(depths) {
            if depth != 0 {
                continue;
            }

            if let Some(c) = NAMED_REQUIRE.captures(line) {
                let module = c[2].to_string();
                for binding in c[1].split(',') {
                    let mut parts = binding.splitn(2, ':').map(str::trim);
                    let exported = parts.next().unwrap_or("");
                    let local = parts.next().unwrap_or(exported);
                    let local = local.split('=').next().unwrap_or("").trim();
                    if IDENTIFIER.is_match(exported) && IDENTIFIER.is_match(local) {
                        symbols.insert(
                            local.to_string(),
                            SymbolOrigin::Named {
                                module: module.clone(),
                                exported: exported.to_string(),
                            },
                        );
                    }
                }
                continue;
            }

            if let Some(c) = NAMESPACE_REQUIRE.captures(line) {
                symbols.insert(
                    c[1].to_string(),
                    SymbolOrigin::Namespace {
                        module: c[2].to_string(),
                    },
                );
                continue;
            }

            let declared = FUNCTION_DECL
                .captures(masked_line)
                .or_else(|| CLASS_DECL.captures(masked_line))
                .or_else(|| VARIABLE_DECL.captures(masked_line));
            if let Some(c) = declared {
                symbols.insert(c[1].to_string(), SymbolOrigin::Local);
            }
        }

        Self { symbols }
    }

    pub fn get(&self, name: &str) -> Option<&SymbolOrigin> {
        self.symbols.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.symbols.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.symbols.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// Identifiers used in code that are not property accesses.
pub fn referenced_identifiers(text: &str) -> BTreeSet<String> {
    let masked = mask_non_code(text);
    IDENTIFIER
        .find_iter(&masked)
        .filter(|m| {
            let before = masked[..m.start()].chars().next_back();
            !matches!(before, Some('.') | Some('\\'))
                && !before.is_some_and(|c| c.is_ascii_digit())
        })
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Names bound inside a block of code: variables, nested functions and
/// classes, destructured bindings and catch parameters.
pub fn declared_names(text: &str) -> BTreeSet<String> {
    let masked = mask_non_code(text);
    let mut names: BTreeSet<String> = LOCAL_DECL
        .captures_iter(&masked)
        .chain(CATCH_BINDING.captures_iter(&masked))
        .map(|c| c[1].to_string())
        .collect();

    for c in LOCAL_DESTRUCTURE.captures_iter(&masked) {
        for binding in c[1].split(',') {
            // `{ a: b }` binds `b`; `{ a = 1 }` binds `a`.
            let target = binding.rsplit(':').next().unwrap_or("");
            let target = target.split('=').next().unwrap_or("").trim();
            if let Some(m) = IDENTIFIER.find(target) {
                names.insert(m.as_str().to_string());
            }
        }
    }
    names
}

/// Resolve a `require` specifier to a script file.
///
/// Relative specifiers (`./`, `../`) resolve against `from_dir`, bare ones
/// against each search path in order. A missing `.js` extension is tried
/// as a fallback.
pub fn resolve_module(spec: &str, from_dir: Option<&Path>, search_paths: &[PathBuf]) -> Option<PathBuf> {
    let spec_path = Path::new(spec);
    let candidates: Vec<PathBuf> = if spec_path.is_absolute() {
        vec![spec_path.to_path_buf()]
    } else if spec.starts_with("./") || spec.starts_with("../") {
        from_dir.map(|dir| vec![dir.join(spec)]).unwrap_or_default()
    } else {
        search_paths.iter().map(|dir| dir.join(spec)).collect()
    };

    candidates.into_iter().find_map(|candidate| {
        if candidate.is_file() {
            return Some(normalize(&candidate));
        }
        let mut with_ext = candidate.into_os_string();
        with_ext.push(".js");
        let with_ext = PathBuf::from(with_ext);
        with_ext.is_file().then(|| normalize(&with_ext))
    })
}

fn normalize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Wrap module text so that evaluating it yields an object of its
/// top-level names.
///
/// Decorator lines are dropped and `require` inside the module resolves
/// relative to `dir`.
pub fn wrap_module(text: &str, dir: &Path) -> String {
    let symbols = ModuleSymbols::parse(text);
    let body: Vec<&str> = text
        .lines()
        .filter(|line| !line.trim_start().starts_with('@'))
        .collect();
    let exports = symbols
        .names()
        .map(|name| format!("{0}: {0}", name))
        .collect::<Vec<_>>()
        .join(", ");
    let dir_literal = serde_json::to_string(&dir.to_string_lossy()).unwrap_or_else(|_| "\"\"".into());

    format!(
        "(function (require) {{\n{}\nreturn {{ {} }};\n}})(function (spec) {{ return __rpc_require(spec, {}); }})",
        body.join("\n"),
        exports,
        dir_literal
    )
}
