use super::{CapabilityConfig, CapabilityError};
use boa_engine::{
    JsValue, NativeFunction, Source, js_string, object::ObjectInitializer, property::Attribute,
};
use boa_gc::{Finalize, Trace};

#[derive(Trace, Finalize)]
struct CwdCaptures {
    base_path: String,
}

fn platform() -> &'static str {
    if cfg!(target_os = "windows") {
        "win32"
    } else if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "freebsd") {
        "freebsd"
    } else {
        "unknown"
    }
}

/// `process` with the host environment, a virtual `cwd()` and `nextTick`
pub(super) fn install(config: &mut CapabilityConfig<'_>) -> Result<(), CapabilityError> {
    let context = &mut *config.context;

    let env = {
        let mut builder = ObjectInitializer::new(context);
        for (key, value) in std::env::vars() {
            builder.property(js_string!(key), js_string!(value), Attribute::all());
        }
        builder.build()
    };

    let versions = ObjectInitializer::new(context)
        .property(js_string!("rivet"), js_string!(env!("CARGO_PKG_VERSION")), Attribute::all())
        .property(js_string!("site"), js_string!(config.version), Attribute::all())
        .build();

    let cwd = NativeFunction::from_copy_closure_with_captures(
        |_this, _args, captures: &CwdCaptures, _context| {
            Ok(JsValue::from(js_string!(captures.base_path.as_str())))
        },
        CwdCaptures {
            base_path: config.base_path.to_string(),
        },
    );

    let process = ObjectInitializer::new(context)
        .property(js_string!("env"), env, Attribute::all())
        .property(js_string!("version"), js_string!(config.version), Attribute::all())
        .property(js_string!("versions"), versions, Attribute::all())
        .property(js_string!("platform"), js_string!(platform()), Attribute::all())
        .property(js_string!("pid"), std::process::id(), Attribute::all())
        .function(cwd, js_string!("cwd"), 0)
        .build();

    // nextTick runs before promise reactions queued after it
    let next_tick = context.eval(Source::from_bytes(
        "(function (callback, ...args) { queueMicrotask(() => callback(...args)); })",
    ))?;
    process.set(js_string!("nextTick"), next_tick, false, context)?;

    config.provide_module("process", process.clone());
    config.set_global("process", process)
}

#[cfg(test)]
mod tests {
    use crate::fs::{MemoryFs, VirtualFs};
    use crate::runtime::{EngineSetup, ScriptEngine};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_process_surface() {
        let fs: Arc<dyn VirtualFs> = Arc::new(MemoryFs::new());
        let engine = ScriptEngine::spawn(
            EngineSetup::new(fs).base_path("/site").version("v7"),
        )
        .unwrap();
        let summary = engine
            .call_blocking(|scope| {
                let value = scope.eval(
                    "[process.version, process.cwd(), typeof process.env, process.versions.site].join(',')",
                )?;
                Ok(value.as_string().map(|s| s.to_std_string_escaped()))
            })
            .unwrap();
        assert_eq!(summary.as_deref(), Some("v7,/site,object,v7"));
    }

    #[test]
    fn test_next_tick_runs_callback() {
        let fs: Arc<dyn VirtualFs> = Arc::new(MemoryFs::new());
        let engine = ScriptEngine::spawn(EngineSetup::new(fs)).unwrap();
        let ticked = engine
            .call_blocking(|scope| {
                scope.eval("globalThis.ticks = []; process.nextTick((a) => ticks.push(a), 'x');")?;
                scope.run_until_idle(Instant::now() + Duration::from_secs(1));
                let value = scope.eval("ticks.join('')")?;
                Ok(value.as_string().map(|s| s.to_std_string_escaped()))
            })
            .unwrap();
        assert_eq!(ticked.as_deref(), Some("x"));
    }
}
