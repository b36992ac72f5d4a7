use super::{CapabilityConfig, CapabilityError};
use boa_runtime::{
    extensions::{
        EncodingExtension, FetchExtension, MicrotaskExtension, StructuredCloneExtension,
        TimeoutExtension, UrlExtension,
    },
    fetch::BlockingReqwestFetcher,
    register_extensions,
};

fn js_error(err: impl std::fmt::Display) -> CapabilityError {
    CapabilityError::Js(err.to_string())
}

/// setTimeout/setInterval/clear* and queueMicrotask, fed into the engine event loop
pub(super) fn install_timers(config: &mut CapabilityConfig<'_>) -> Result<(), CapabilityError> {
    register_extensions(TimeoutExtension, None, config.context).map_err(js_error)?;
    register_extensions(MicrotaskExtension, None, config.context).map_err(js_error)
}

pub(super) fn install_web(config: &mut CapabilityConfig<'_>) -> Result<(), CapabilityError> {
    register_extensions(UrlExtension, None, config.context).map_err(js_error)?;
    register_extensions(EncodingExtension, None, config.context).map_err(js_error)?;
    register_extensions(StructuredCloneExtension, None, config.context).map_err(js_error)?;

    // Node-style alias some handlers expect
    let global = config.context.global_object();
    config.set_global("global", global)
}

pub(super) fn install_fetch(config: &mut CapabilityConfig<'_>) -> Result<(), CapabilityError> {
    register_extensions(
        FetchExtension(BlockingReqwestFetcher::default()),
        None,
        config.context,
    )
    .map_err(js_error)
}

#[cfg(test)]
mod tests {
    use crate::fs::{MemoryFs, VirtualFs};
    use crate::runtime::{EngineSetup, ScriptEngine};
    use std::sync::Arc;

    #[test]
    fn test_web_globals_are_installed() {
        let fs: Arc<dyn VirtualFs> = Arc::new(MemoryFs::new());
        let engine = ScriptEngine::spawn(EngineSetup::new(fs)).unwrap();
        let kinds = engine
            .call_blocking(|scope| {
                let value = scope.eval(
                    "[typeof setTimeout, typeof queueMicrotask, typeof URL, typeof TextEncoder, \
                     typeof structuredClone, typeof fetch, global === globalThis].join(',')",
                )?;
                Ok(value.as_string().map(|s| s.to_std_string_escaped()))
            })
            .unwrap();
        assert_eq!(
            kinds.as_deref(),
            Some("function,function,function,function,function,function,true")
        );
    }
}
