//! rivet - a frontend server that runs per-route JavaScript handlers
//!
//! rivet combines:
//! - Boa: ECMAScript engine written in Rust, one engine per worker thread
//! - boa_runtime: WebAPI support (console, timers, fetch, URL, etc.)
//! - engine pools with session affinity, keyed by filesystem and site version
//! - axum: HTTP surface with file-based routing

pub mod cli;
pub mod dispatch;
pub mod fs;
pub mod pool;
pub mod runtime;
pub mod server;

// Re-export commonly used types
pub use dispatch::{DispatchConfig, DispatchError, Dispatcher, Route};
pub use pool::{EnginePool, PoolKey, PoolRegistry};
pub use runtime::{RuntimeError, RuntimeResult, ScriptEngine};
pub use server::{Server, ServerConfig, ServerError, ServerResult};
