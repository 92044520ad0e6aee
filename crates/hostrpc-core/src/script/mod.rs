//! Script callables: locating them on disk, rewriting their references, and
//! running them in the embedded engine.

mod engine;
mod lexer;
mod source;
mod symbols;

pub use engine::{ScriptEngine, ScriptFault, ENGINE_GLOBALS, INTERNAL_PREFIX};
pub use source::{ClassMember, FunctionKind, FunctionSource, ScriptClass, ScriptFunction, TextSpan};
pub use symbols::{
    declared_names, referenced_identifiers, resolve_module, wrap_module, ModuleSymbols,
    SymbolOrigin,
};
