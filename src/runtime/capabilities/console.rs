use super::{CapabilityConfig, CapabilityError};
use boa_engine::{Context, JsResult};
use boa_gc::{Finalize, Trace};
use boa_runtime::{ConsoleState, Logger, extensions::ConsoleExtension, register_extensions};

/// Console output from scripts, emitted as tracing events
#[derive(Debug, Clone, Trace, Finalize)]
pub struct ScriptLogger {
    #[unsafe_ignore_trace]
    engine_id: u64,
}

impl ScriptLogger {
    pub fn new(engine_id: u64) -> Self {
        Self { engine_id }
    }
}

impl Logger for ScriptLogger {
    fn log(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        tracing::info!(target: "rivet::script", engine = self.engine_id, "{msg}");
        Ok(())
    }

    fn info(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        tracing::info!(target: "rivet::script", engine = self.engine_id, "{msg}");
        Ok(())
    }

    fn warn(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        tracing::warn!(target: "rivet::script", engine = self.engine_id, "{msg}");
        Ok(())
    }

    fn error(&self, msg: String, _state: &ConsoleState, _context: &mut Context) -> JsResult<()> {
        tracing::error!(target: "rivet::script", engine = self.engine_id, "{msg}");
        Ok(())
    }
}

pub(super) fn install(config: &mut CapabilityConfig<'_>) -> Result<(), CapabilityError> {
    register_extensions(
        ConsoleExtension(ScriptLogger::new(config.engine_id)),
        None,
        config.context,
    )
    .map_err(|e| CapabilityError::Js(e.to_string()))
}
