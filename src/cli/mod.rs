//! One-shot script execution for `rivet run`

pub mod logging;

use crate::fs::{OsFs, VirtualFs, vpath};
use crate::runtime::{EngineSetup, RuntimeError, RuntimeResult, ScriptEngine, json};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Outcome of [`run_script`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutcome {
    /// `module.exports` as JSON, when the script exported anything serializable
    pub exports: Option<String>,
    /// False when timers or promises were still pending at the deadline
    pub completed: bool,
}

/// Run `path` as a CommonJS module on a fresh engine rooted at its directory.
///
/// Timers and promises keep the run alive until they settle or `timeout` passes.
pub fn run_script(path: &Path, timeout: Duration) -> RuntimeResult<ScriptOutcome> {
    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| RuntimeError::ModuleNotFound(path.display().to_string()))?
        .to_string();

    let fs: Arc<dyn VirtualFs> =
        Arc::new(OsFs::new(dir).map_err(|e| RuntimeError::ModuleNotFound(e.to_string()))?);
    let engine = ScriptEngine::spawn(EngineSetup::new(fs))?;

    let outcome = engine.call_blocking(move |scope| {
        let deadline = Instant::now() + timeout;
        let module = scope.load_module(&vpath::join("/", &file_name), "/")?;
        let completed = scope.run_until_idle(deadline);

        let exports = if module.exports.is_undefined() {
            None
        } else {
            json::stringify(&module.exports, scope.context_mut())
                .map_err(|e| RuntimeError::JsError(e.to_string()))?
                .filter(|text| text != "{}")
        };
        Ok(ScriptOutcome { exports, completed })
    });

    engine.stop();
    outcome
}
