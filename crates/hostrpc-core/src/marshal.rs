//! Reconstruction of remote exceptions from wire faults.
//!
//! A fault message of the form `"<ExceptionName>: <message>"` is matched
//! against an explicit registry of exception names. Known names become a
//! [`RemoteException`] the caller can match on; unknown names are surfaced as
//! the raw [`Fault`] with its code and message untouched.

use crate::error::RpcError;
use crate::protocol::Fault;
use regex::Regex;
use std::collections::BTreeSet;
use std::fmt;
use std::panic::Location;
use std::path::Path;
use std::sync::{LazyLock, OnceLock, RwLock};
use tracing::{debug, info, warn};

/// `Name: message`, tolerating a `<class 'module.Name'>` wrapper.
static FAULT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:<class ')?(?:[\w$]+\.)*([A-Za-z_$][\w$]*)(?:'>)?: (?s)(.*)$")
        .expect("fault pattern regex must compile")
});

/// Exception names every script engine raises natively.
const BUILTIN_EXCEPTIONS: &[&str] = &[
    "Error",
    "TypeError",
    "RangeError",
    "ReferenceError",
    "SyntaxError",
    "EvalError",
    "URIError",
    "AggregateError",
    "InternalError",
    "TimeoutError",
];

/// The kind of a reconstructed exception.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    Error,
    TypeError,
    RangeError,
    ReferenceError,
    SyntaxError,
    EvalError,
    URIError,
    AggregateError,
    InternalError,
    TimeoutError,
    /// A name added through [`ExceptionRegistry::register`].
    Registered(String),
}

impl ExceptionKind {
    fn from_name(name: &str) -> Self {
        match name {
            "Error" => Self::Error,
            "TypeError" => Self::TypeError,
            "RangeError" => Self::RangeError,
            "ReferenceError" => Self::ReferenceError,
            "SyntaxError" => Self::SyntaxError,
            "EvalError" => Self::EvalError,
            "URIError" => Self::URIError,
            "AggregateError" => Self::AggregateError,
            "InternalError" => Self::InternalError,
            "TimeoutError" => Self::TimeoutError,
            other => Self::Registered(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Error => "Error",
            Self::TypeError => "TypeError",
            Self::RangeError => "RangeError",
            Self::ReferenceError => "ReferenceError",
            Self::SyntaxError => "SyntaxError",
            Self::EvalError => "EvalError",
            Self::URIError => "URIError",
            Self::AggregateError => "AggregateError",
            Self::InternalError => "InternalError",
            Self::TimeoutError => "TimeoutError",
            Self::Registered(name) => name,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError)
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Names the caller knows how to reconstruct.
#[derive(Debug)]
pub struct ExceptionRegistry {
    names: RwLock<BTreeSet<String>>,
}

impl Default for ExceptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionRegistry {
    /// A registry holding the built-in exception names.
    pub fn new() -> Self {
        Self {
            names: RwLock::new(BUILTIN_EXCEPTIONS.iter().map(|s| s.to_string()).collect()),
        }
    }

    /// The process-wide registry, populated with built-ins on first use.
    pub fn global() -> &'static ExceptionRegistry {
        static REGISTRY: OnceLock<ExceptionRegistry> = OnceLock::new();
        REGISTRY.get_or_init(ExceptionRegistry::new)
    }

    /// Make an application-defined exception name reconstructable.
    pub fn register(&self, name: impl Into<String>) {
        let name = name.into();
        debug!("Registering remote exception name {}", name);
        if let Ok(mut names) = self.names.write() {
            names.insert(name);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ExceptionKind> {
        let names = self.names.read().ok()?;
        names.contains(name).then(|| ExceptionKind::from_name(name))
    }
}

/// Where in the caller's code a remote call was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl CallSite {
    pub fn from_location(location: &'static Location<'static>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }

    /// The site of the nearest caller not marked `#[track_caller]`.
    #[track_caller]
    pub fn capture() -> Self {
        Self::from_location(Location::caller())
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// A remote exception rebuilt on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteException {
    kind: ExceptionKind,
    message: String,
    call_site: Option<CallSite>,
}

impl RemoteException {
    pub fn new(kind: ExceptionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            call_site: None,
        }
    }

    pub fn kind(&self) -> &ExceptionKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn call_site(&self) -> Option<&CallSite> {
        self.call_site.as_ref()
    }

    /// Append `"\n<file>, line <n>"` pointing at the local definition.
    pub fn with_locator(mut self, locator: &str) -> Self {
        self.message = format!("{}\n{}", self.message, locator);
        self
    }

    pub fn with_call_site(mut self, call_site: CallSite) -> Self {
        self.call_site = Some(call_site);
        self
    }
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(site) = &self.call_site {
            write!(f, "\n  called at {}", site)?;
        }
        Ok(())
    }
}

/// Split a fault message into exception name and message.
pub fn parse_fault_message(message: &str) -> Option<(&str, &str)> {
    let captures = FAULT_PATTERN.captures(message)?;
    Some((captures.get(1)?.as_str(), captures.get(2)?.as_str()))
}

/// Turn a wire fault into the error the caller sees.
///
/// Known exception names become [`RpcError::Remote`]. When a traceback file
/// is configured and readable, its contents are logged first. Anything else
/// is returned as the unchanged [`RpcError::Fault`].
pub fn unmarshal_fault(
    fault: Fault,
    registry: &ExceptionRegistry,
    traceback_file: Option<&Path>,
) -> RpcError {
    let Some((name, message)) = parse_fault_message(&fault.message) else {
        return RpcError::Fault(fault);
    };
    let Some(kind) = registry.lookup(name) else {
        debug!("Unknown remote exception {}; surfacing raw fault", name);
        return RpcError::Fault(fault);
    };

    if let Some(path) = traceback_file {
        match std::fs::read_to_string(path) {
            Ok(traceback) if !traceback.trim().is_empty() => {
                info!("Remote traceback ({}):\n{}", path.display(), traceback.trim_end());
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not read traceback file {}: {}", path.display(), e),
        }
    }

    RpcError::Remote(RemoteException::new(kind, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol;
    use tempfile::TempDir;

    #[test]
    fn test_parse_fault_message() {
        assert_eq!(
            parse_fault_message("TypeError: bad operand"),
            Some(("TypeError", "bad operand"))
        );
        assert_eq!(
            parse_fault_message("<class 'builtins.ValueError'>: boom"),
            Some(("ValueError", "boom"))
        );
        assert_eq!(
            parse_fault_message("RangeError: line one\nline two"),
            Some(("RangeError", "line one\nline two"))
        );
        assert_eq!(parse_fault_message("no separator here"), None);
    }

    #[test]
    fn test_builtin_is_reconstructed() {
        let registry = ExceptionRegistry::new();
        let fault = Fault::new(protocol::SCRIPT_EXCEPTION, "TypeError: x is not a function");
        match unmarshal_fault(fault, &registry, None) {
            RpcError::Remote(exception) => {
                assert_eq!(exception.kind(), &ExceptionKind::TypeError);
                assert_eq!(exception.message(), "x is not a function");
            }
            other => panic!("expected a remote exception, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_name_keeps_fault() {
        let registry = ExceptionRegistry::new();
        let fault = Fault::new(protocol::SCRIPT_EXCEPTION, "GremlinError: chewed the cables");
        match unmarshal_fault(fault.clone(), &registry, None) {
            RpcError::Fault(raw) => assert_eq!(raw, fault),
            other => panic!("expected the raw fault, got {:?}", other),
        }
    }

    #[test]
    fn test_registered_name() {
        let registry = ExceptionRegistry::new();
        assert_eq!(registry.lookup("ValueError"), None);
        registry.register("ValueError");
        assert_eq!(
            registry.lookup("ValueError"),
            Some(ExceptionKind::Registered("ValueError".into()))
        );
    }

    #[test]
    fn test_missing_traceback_file_is_ignored() {
        let temp = TempDir::new().unwrap();
        let registry = ExceptionRegistry::new();
        let fault = Fault::new(protocol::SCRIPT_EXCEPTION, "Error: boom");
        let err = unmarshal_fault(fault, &registry, Some(&temp.path().join("missing.log")));
        assert!(err.as_remote().is_some());
    }

    #[test]
    fn test_locator_and_call_site() {
        let site = CallSite::capture();
        let exception = RemoteException::new(ExceptionKind::RangeError, "too far")
            .with_locator("/scripts/a.js, line 3")
            .with_call_site(site);
        assert_eq!(exception.message(), "too far\n/scripts/a.js, line 3");
        assert_eq!(exception.call_site().unwrap().file, file!());
        assert!(exception.to_string().starts_with("RangeError: too far\n"));
    }

    #[test]
    fn test_timeout_kind() {
        assert!(ExceptionKind::TimeoutError.is_timeout());
        assert!(!ExceptionKind::Error.is_timeout());
    }
}
