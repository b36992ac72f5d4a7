//! Capability modules installed into every engine at startup
//!
//! A capability is a named initializer that receives the fresh context and may
//! define globals or register built-in modules for `require`. The standard set:
//!
//! - `console`: console API routed to tracing under the `rivet::script` target
//! - `timers`: setTimeout/setInterval and queueMicrotask
//! - `web`: URL, TextEncoder/TextDecoder, structuredClone
//! - `fetch`: blocking `fetch` driven by the engine event loop
//! - `process`: `process` global and built-in
//! - `path`: POSIX path helpers over virtual paths
//! - `fs`: synchronous file API over the engine's [`VirtualFs`]

mod console;
mod fs;
mod path;
mod process;
mod web;

pub use console::ScriptLogger;

use super::{ModuleLoader, RuntimeError, RuntimeResult, TaskScheduler};
use crate::fs::VirtualFs;
use boa_engine::{Context, JsError, JsValue, js_string};
use std::{fmt, rc::Rc, sync::Arc};
use thiserror::Error;

/// Errors raised by a capability initializer
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("{0}")]
    Js(String),

    #[error("{0}")]
    Message(String),
}

impl From<JsError> for CapabilityError {
    fn from(err: JsError) -> Self {
        CapabilityError::Js(err.to_string())
    }
}

/// What an initializer may touch while an engine is being built
pub struct CapabilityConfig<'a> {
    pub context: &'a mut Context,
    pub fs: &'a Arc<dyn VirtualFs>,
    pub base_path: &'a str,
    pub version: &'a str,
    pub engine_id: u64,
    pub loader: &'a Rc<ModuleLoader>,
    /// Queue of the engine being built; clones may be moved to other threads
    pub scheduler: &'a TaskScheduler,
}

impl CapabilityConfig<'_> {
    /// Make `value` the result of `require(name)` and `require('node:' + name)`
    pub fn provide_module(&self, name: &str, value: impl Into<JsValue>) {
        self.loader.provide(name, value.into());
    }

    pub fn set_global(
        &mut self,
        name: &str,
        value: impl Into<JsValue>,
    ) -> Result<(), CapabilityError> {
        let global = self.context.global_object();
        global.set(js_string!(name), value.into(), false, self.context)?;
        Ok(())
    }
}

pub type CapabilityInit =
    Arc<dyn Fn(&mut CapabilityConfig<'_>) -> Result<(), CapabilityError> + Send + Sync>;

/// Ordered list of capability initializers
#[derive(Clone, Default)]
pub struct CapabilitySet {
    entries: Vec<(String, CapabilityInit)>,
}

impl CapabilitySet {
    /// An empty set: engines get a bare ECMAScript context
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        Self::new()
            .with("console", console::install)
            .with("timers", web::install_timers)
            .with("web", web::install_web)
            .with("fetch", web::install_fetch)
            .with("process", process::install)
            .with("path", path::install)
            .with("fs", fs::install)
    }

    pub fn with<F>(mut self, name: &str, init: F) -> Self
    where
        F: Fn(&mut CapabilityConfig<'_>) -> Result<(), CapabilityError> + Send + Sync + 'static,
    {
        self.register(name, init);
        self
    }

    /// Add an initializer, replacing any earlier one with the same name
    pub fn register<F>(&mut self, name: &str, init: F)
    where
        F: Fn(&mut CapabilityConfig<'_>) -> Result<(), CapabilityError> + Send + Sync + 'static,
    {
        let init: CapabilityInit = Arc::new(init);
        match self.entries.iter_mut().find(|(existing, _)| existing == name) {
            Some(entry) => entry.1 = init,
            None => self.entries.push((name.to_string(), init)),
        }
    }

    pub fn without(mut self, name: &str) -> Self {
        self.entries.retain(|(existing, _)| existing != name);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Run every initializer in order, stopping at the first failure
    pub fn install(&self, config: &mut CapabilityConfig<'_>) -> RuntimeResult<()> {
        for (name, init) in &self.entries {
            init(config).map_err(|err| RuntimeError::Capability {
                name: name.clone(),
                message: err.to_string(),
            })?;
        }
        Ok(())
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;
    use crate::runtime::{EngineSetup, ScriptEngine};

    #[test]
    fn test_standard_set_order() {
        let set = CapabilitySet::standard();
        let names: Vec<&str> = set.names().collect::<Vec<_>>();
        assert_eq!(
            names,
            ["console", "timers", "web", "fetch", "process", "path", "fs"]
        );
    }

    #[test]
    fn test_register_replaces_and_without_removes() {
        let set = CapabilitySet::standard()
            .with("fs", |_config| Ok(()))
            .without("fetch");
        let names: Vec<&str> = set.names().collect();
        assert_eq!(names, ["console", "timers", "web", "process", "path", "fs"]);
    }

    #[test]
    fn test_custom_capability_is_visible_to_scripts() {
        let fs: Arc<dyn VirtualFs> = Arc::new(MemoryFs::new());
        let capabilities = CapabilitySet::new().with("site", |config| {
            let name = js_string!("docs");
            config.provide_module("site", name.clone());
            config.set_global("SITE", name)
        });
        let engine = ScriptEngine::spawn(EngineSetup::new(fs).capabilities(capabilities)).unwrap();
        let same = engine
            .call_blocking(|scope| {
                let global = scope.eval("SITE")?;
                let loader = scope.loader().clone();
                let module = loader.require("node:site", "/", scope.context_mut())?;
                Ok(JsValue::strict_equals(&global, &module))
            })
            .unwrap();
        assert!(same);
    }

    #[test]
    fn test_capability_schedules_onto_its_engine() {
        let fs: Arc<dyn VirtualFs> = Arc::new(MemoryFs::new());
        let kept: Arc<parking_lot::Mutex<Option<TaskScheduler>>> = Arc::default();
        let slot = kept.clone();
        let capabilities = CapabilitySet::new().with("relay", move |config| {
            *slot.lock() = Some(config.scheduler.clone());
            config.set_global("hits", 0)
        });
        let engine = ScriptEngine::spawn(EngineSetup::new(fs).capabilities(capabilities)).unwrap();

        let scheduler = kept.lock().take().unwrap();
        assert_eq!(scheduler.engine_id(), engine.id());
        assert_eq!(
            engine.scheduler().map(|s| s.engine_id()),
            Some(engine.id())
        );

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            for _ in 0..3 {
                scheduler
                    .schedule(|scope| {
                        scope.eval("hits += 1").unwrap();
                    })
                    .unwrap();
            }
            scheduler
                .schedule(move |scope| {
                    let hits = scope.eval("hits").unwrap().as_number();
                    tx.send(hits).unwrap();
                })
                .unwrap();
        })
        .join()
        .unwrap();

        let hits = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert_eq!(hits, Some(3.0));
    }
}
