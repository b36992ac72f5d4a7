//! Script runtime powered by the Boa engine
//!
//! A Boa [`Context`] is not thread-safe, so every [`ScriptEngine`] owns one
//! dedicated worker thread that creates the context and runs every task sent to
//! it, strictly one at a time and in FIFO order. Other threads interact with an
//! engine only by scheduling closures onto that queue.
//!
//! Each engine carries:
//! - its own [`ModuleLoader`] with a CommonJS-style `require` and a module cache
//!   keyed by path and modification time
//! - an event loop for promise jobs, timers and native async jobs
//! - the capability modules (console, timers, fetch, process, path, fs)
//!   installed from a [`CapabilitySet`] during startup

pub mod capabilities;
mod engine;
mod event_loop;
pub(crate) mod json;
mod loader;

pub use capabilities::{CapabilityConfig, CapabilityError, CapabilitySet};
pub use engine::{EngineScope, EngineSetup, ScriptEngine, TaskScheduler};
pub use loader::{LoadedModule, ModuleHandle, ModuleLoader};

use boa_engine::{Context, JsError, JsNativeError, JsValue, js_string};
use thiserror::Error;

/// Errors that can occur while running scripts
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("error evaluating {path}: {message}")]
    ModuleEvaluation { path: String, message: String },

    #[error("capability '{name}' failed to initialize: {message}")]
    Capability { name: String, message: String },

    #[error("task panicked: {0}")]
    TaskPanicked(String),

    #[error("engine {0} is stopped")]
    EngineStopped(u64),

    #[error("engine {0} has not been started")]
    EngineNotStarted(u64),

    #[error("engine failed to start: {0}")]
    EngineStart(String),

    #[error("JavaScript error: {0}")]
    JsError(String),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl RuntimeError {
    /// Convert into an exception thrown back into script code
    pub(crate) fn into_js(self, context: &mut Context) -> JsError {
        let code = match &self {
            RuntimeError::ModuleNotFound(_) => "MODULE_NOT_FOUND",
            RuntimeError::ModuleEvaluation { .. } => "ERR_MODULE_EVALUATION",
            _ => "ERR_RUNTIME",
        };
        throw_with_code(self.to_string(), code, context)
    }
}

/// Build an `Error` object carrying a Node-style `code` property
pub(crate) fn throw_with_code(
    message: impl Into<String>,
    code: &str,
    context: &mut Context,
) -> JsError {
    let error = JsNativeError::error()
        .with_message(message.into())
        .to_opaque(context);
    // Setting a data property on a fresh ordinary object cannot fail.
    let _ = error.set(js_string!("code"), js_string!(code), false, context);
    JsError::from_opaque(error.into())
}

/// Message and `code` of a value thrown by script code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrownError {
    pub message: String,
    pub code: Option<String>,
}

impl ThrownError {
    pub fn from_js(err: &JsError, context: &mut Context) -> Self {
        let value = err.to_opaque(context);
        Self::from_value(&value, context)
    }

    pub fn from_value(value: &JsValue, context: &mut Context) -> Self {
        let Some(object) = value.as_object() else {
            return Self {
                message: display_value(value, context),
                code: None,
            };
        };

        let read = |key: &str, context: &mut Context| {
            object
                .get(js_string!(key), context)
                .ok()
                .filter(|v| !v.is_undefined() && !v.is_null())
                .and_then(|v| v.to_string(context).ok())
                .map(|s| s.to_std_string_escaped())
        };

        let code = read("code", context);
        let message = match (read("name", context), read("message", context)) {
            (Some(name), Some(message)) => format!("{name}: {message}"),
            (None, Some(message)) => message,
            _ => display_value(value, context),
        };

        Self { message, code }
    }

    pub fn is_read_only(&self) -> bool {
        self.code.as_deref() == Some("EROFS")
    }
}

fn display_value(value: &JsValue, context: &mut Context) -> String {
    value
        .to_string(context)
        .map(|s| s.to_std_string_escaped())
        .unwrap_or_else(|_| value.display().to_string())
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
