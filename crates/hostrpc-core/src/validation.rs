//! Pre-flight checks run before a call leaves the process.
//!
//! Every check is a pure function of the call site. None of them touch the
//! network.

use crate::args::CallArg;
use crate::error::{Result, RpcError};
use crate::script::{ClassMember, ScriptClass, ScriptFunction};
use crate::testing::RemoteTestCase;
use std::collections::BTreeMap;

/// Reject arguments (or nested values) that cannot cross the wire.
pub fn validate_arguments(function: &ScriptFunction, args: &[CallArg]) -> Result<()> {
    for (index, arg) in args.iter().enumerate() {
        if let Some(unsupported) = arg.find_unsupported() {
            return Err(RpcError::UnsupportedArgumentType {
                function: function.qualified_name(),
                index,
                type_name: unsupported.type_name().to_string(),
            });
        }
    }
    Ok(())
}

/// Reject keyword arguments. The wire only carries positional ones.
pub fn validate_key_word_parameters(
    function: &ScriptFunction,
    kwargs: &BTreeMap<String, CallArg>,
) -> Result<()> {
    if kwargs.is_empty() {
        return Ok(());
    }
    Err(RpcError::InvalidKeyWordParameters {
        function: function.qualified_name(),
        names: kwargs.keys().cloned().collect::<Vec<_>>().join(", "),
    })
}

/// Require the function's defining file to exist on disk.
pub fn validate_file_is_saved(function: &ScriptFunction) -> Result<()> {
    if function.file().is_file() {
        return Ok(());
    }
    Err(RpcError::FileNotSavedOnDisk {
        function: function.qualified_name(),
        path: function.file().to_path_buf(),
    })
}

/// Require a class member to be static.
pub fn validate_class_method(class: &ScriptClass, method: &ClassMember) -> Result<()> {
    if method.is_static {
        return Ok(());
    }
    Err(RpcError::InvalidClassMethod {
        class: class.name().to_string(),
        method: method.name.clone(),
    })
}

/// Require a remote test case to name the port it runs against.
pub fn validate_test_case_class(test_case: &RemoteTestCase) -> Result<u16> {
    test_case.port().ok_or_else(|| RpcError::InvalidTestCasePort {
        class: test_case.class().name().to_string(),
    })
}
