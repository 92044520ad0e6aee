//! hostrpc - Dynamic RPC bridge into single-threaded host applications.
//!
//! A caller-local script function is shipped as source to a bridge server
//! running inside a host application (Blender, Unreal, or a plain process),
//! registered there under its name, and invoked with positional arguments.
//! Script exceptions raised on the server are rebuilt on the caller's side
//! with a pointer back to the local definition.
//!
//! # Example
//!
//! ```rust,ignore
//! use hostrpc::{call_args, remote_call, RemapPairs, ScriptFunction};
//!
//! #[tokio::main]
//! async fn main() -> hostrpc::Result<()> {
//!     let remote = remote_call(9998, vec![], RemapPairs::new());
//!     let add = remote.wrap(ScriptFunction::new("/scripts/math.js", "add"));
//!
//!     let sum = add.call(call_args![2, 3]).await?;
//!     println!("2 + 3 = {}", sum);
//!     Ok(())
//! }
//! ```

pub mod args;
pub mod client;
pub mod config;
pub mod decorators;
pub mod error;
pub mod factory;
pub mod history;
pub mod host;
pub mod marshal;
pub mod protocol;
pub mod remap;
pub mod script;
pub mod server;
pub mod testing;
pub mod validation;

// Re-export commonly used types
pub use args::{Arguments, CallArg, HostObject};
pub use client::RpcClient;
pub use config::{RpcConfig, RpcSettings};
pub use decorators::{remote_call, remote_class, RemoteCall, RemoteClass, RemoteFunction};
pub use error::{Result, RpcError};
pub use factory::RpcFactory;
pub use history::ExecutionHistory;
pub use host::blender::{BlenderAdapter, ManualTimers, TimerScheduler};
pub use host::unreal::{ManualTicker, TickScheduler, UnrealAdapter};
pub use host::{Callable, HostAdapter, ThreadSafeCall};
pub use marshal::{CallSite, ExceptionKind, ExceptionRegistry, RemoteException};
pub use protocol::{Fault, MulticallEntry};
pub use remap::RemapPairs;
pub use script::{ScriptClass, ScriptEngine, ScriptFault, ScriptFunction};
pub use server::queue::{CallOutcome, ExecutionQueue, Ticket};
pub use server::{BoundServer, RpcServer, RpcServerBuilder, ServerHandle, ServerStatus};
pub use testing::{RemoteTestCase, TestReport};
