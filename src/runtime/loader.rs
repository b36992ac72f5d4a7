//! CommonJS module loader with a per-engine cache
//!
//! Resolution of a specifier against a base directory:
//! 1. absolute specifiers pass through, everything else joins the base directory
//! 2. a directory resolves to its `index.js`, then `index.json`
//! 3. a path without a `.js`/`.json` suffix that does not exist tries
//!    `path.js`, then `path.json`
//!
//! A cached module is reused while its recorded modification time is not older
//! than the file's current one, and the very same exports object is returned.
//! The cache lives inside one engine and is only touched from its worker thread.

use super::{RuntimeError, RuntimeResult, ThrownError, json};
use crate::fs::{VirtualFs, vpath};
use boa_engine::{
    Context, JsArgs, JsError, JsObject, JsValue, NativeFunction, Source, js_string,
    object::{ObjectInitializer, builtins::JsFunction},
    property::Attribute,
};
use boa_gc::{Finalize, Trace};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    path::Path,
    rc::Rc,
    sync::Arc,
    time::SystemTime,
};

/// Identity of a loaded module that can leave the engine thread.
///
/// `id` changes exactly when the module is re-evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleHandle {
    pub id: u64,
    pub path: String,
}

/// A module together with its exports value (engine thread only)
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub handle: ModuleHandle,
    pub exports: JsValue,
}

/// Marks a module as mid-evaluation until dropped, so a panic unwinding out of
/// the module body cannot leave a stale partial-exports entry behind.
struct LoadingEntry<'a> {
    loading: &'a RefCell<HashMap<String, (u64, JsObject)>>,
    path: &'a str,
}

impl<'a> LoadingEntry<'a> {
    fn insert(
        loading: &'a RefCell<HashMap<String, (u64, JsObject)>>,
        path: &'a str,
        id: u64,
        module: JsObject,
    ) -> Self {
        loading.borrow_mut().insert(path.to_string(), (id, module));
        Self { loading, path }
    }
}

impl Drop for LoadingEntry<'_> {
    fn drop(&mut self) {
        self.loading.borrow_mut().remove(self.path);
    }
}

struct CachedModule {
    id: u64,
    exports: JsValue,
    modified: SystemTime,
}

pub struct ModuleLoader {
    fs: Arc<dyn VirtualFs>,
    engine_id: u64,
    cache: RefCell<HashMap<String, CachedModule>>,
    /// Module objects whose body is still running, for cyclic requires
    loading: RefCell<HashMap<String, (u64, JsObject)>>,
    builtins: RefCell<HashMap<String, JsValue>>,
    next_id: Cell<u64>,
}

#[derive(Trace, Finalize)]
struct RequireCaptures {
    #[unsafe_ignore_trace]
    loader: Rc<ModuleLoader>,
    base_dir: String,
}

impl ModuleLoader {
    pub fn new(fs: Arc<dyn VirtualFs>, engine_id: u64) -> Self {
        Self {
            fs,
            engine_id,
            cache: RefCell::new(HashMap::new()),
            loading: RefCell::new(HashMap::new()),
            builtins: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
        }
    }

    pub fn fs(&self) -> &Arc<dyn VirtualFs> {
        &self.fs
    }

    /// Register a built-in module returned for a bare `require(name)`
    pub fn provide(&self, name: &str, exports: JsValue) {
        self.builtins.borrow_mut().insert(name.to_string(), exports);
    }

    pub fn builtin(&self, name: &str) -> Option<JsValue> {
        let name = name.strip_prefix("node:").unwrap_or(name);
        self.builtins.borrow().get(name).cloned()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Drop every cached module and built-in
    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
        self.loading.borrow_mut().clear();
        self.builtins.borrow_mut().clear();
    }

    /// Resolve `specifier` to an absolute virtual path of an existing file
    pub fn resolve(&self, specifier: &str, base_dir: &str) -> RuntimeResult<String> {
        let candidate = vpath::join(base_dir, specifier);

        if let Ok(stat) = self.fs.stat(&candidate) {
            if !stat.is_dir {
                return Ok(candidate);
            }
            for index in ["index.js", "index.json"] {
                let path = vpath::join(&candidate, index);
                if self.fs.is_file(&path) {
                    return Ok(path);
                }
            }
            return Err(RuntimeError::ModuleNotFound(candidate));
        }

        if !candidate.ends_with(".js") && !candidate.ends_with(".json") {
            for ext in [".js", ".json"] {
                let path = format!("{candidate}{ext}");
                if self.fs.is_file(&path) {
                    return Ok(path);
                }
            }
        }

        Err(RuntimeError::ModuleNotFound(candidate))
    }

    /// `require()` semantics: built-ins first, then the filesystem
    pub fn require(
        self: &Rc<Self>,
        specifier: &str,
        base_dir: &str,
        context: &mut Context,
    ) -> RuntimeResult<JsValue> {
        if let Some(exports) = self.builtin(specifier) {
            return Ok(exports);
        }
        self.load(specifier, base_dir, context)
            .map(|module| module.exports)
    }

    /// Resolve and load a module, reusing the cached exports when still fresh
    pub fn load(
        self: &Rc<Self>,
        specifier: &str,
        base_dir: &str,
        context: &mut Context,
    ) -> RuntimeResult<LoadedModule> {
        let path = self.resolve(specifier, base_dir)?;
        let stat = self
            .fs
            .stat(&path)
            .map_err(|_| RuntimeError::ModuleNotFound(path.clone()))?;

        if let Some(module) = self.in_progress(&path, context) {
            return Ok(module);
        }

        if let Some(cached) = self.cache.borrow().get(&path) {
            if cached.modified >= stat.modified {
                return Ok(LoadedModule {
                    handle: ModuleHandle {
                        id: cached.id,
                        path,
                    },
                    exports: cached.exports.clone(),
                });
            }
        }

        let source = self
            .fs
            .read_to_string(&path)
            .map_err(|_| RuntimeError::ModuleNotFound(path.clone()))?;

        let id = self.next_id.get();
        self.next_id.set(id + 1);

        let exports = if path.ends_with(".json") {
            json::parse(&source, context)
                .map_err(|err| evaluation_error(&path, &err, context))?
        } else {
            self.evaluate_commonjs(&path, id, &source, context)?
        };

        tracing::debug!(engine = self.engine_id, path = %path, id, "module evaluated");
        self.cache.borrow_mut().insert(
            path.clone(),
            CachedModule {
                id,
                exports: exports.clone(),
                modified: stat.modified,
            },
        );

        Ok(LoadedModule {
            handle: ModuleHandle { id, path },
            exports,
        })
    }

    fn in_progress(&self, path: &str, context: &mut Context) -> Option<LoadedModule> {
        let (id, module) = self.loading.borrow().get(path).cloned()?;
        let exports = module.get(js_string!("exports"), context).ok()?;
        Some(LoadedModule {
            handle: ModuleHandle {
                id,
                path: path.to_string(),
            },
            exports,
        })
    }

    fn evaluate_commonjs(
        self: &Rc<Self>,
        path: &str,
        id: u64,
        source: &str,
        context: &mut Context,
    ) -> RuntimeResult<JsValue> {
        let wrapped = format!(
            "(function (exports, require, module, __filename, __dirname) {{\n{source}\n}})"
        );
        let wrapper = context
            .eval(Source::from_bytes(wrapped.as_bytes()).with_path(Path::new(path)))
            .map_err(|err| evaluation_error(path, &err, context))?;
        let wrapper = wrapper
            .as_callable()
            .map(|f| f.clone())
            .ok_or_else(|| RuntimeError::ModuleEvaluation {
                path: path.to_string(),
                message: "module wrapper did not evaluate to a function".to_string(),
            })?;

        let dirname = vpath::dirname(path);
        let exports = ObjectInitializer::new(context).build();
        let module = ObjectInitializer::new(context)
            .property(js_string!("exports"), exports.clone(), Attribute::all())
            .property(js_string!("id"), js_string!(path), Attribute::all())
            .property(js_string!("filename"), js_string!(path), Attribute::all())
            .build();
        let require = self.require_function(&dirname, context);

        let entry = LoadingEntry::insert(&self.loading, path, id, module.clone());
        let result = wrapper.call(
            &JsValue::undefined(),
            &[
                exports.into(),
                require.into(),
                module.clone().into(),
                js_string!(path).into(),
                js_string!(dirname.as_str()).into(),
            ],
            context,
        );
        drop(entry);
        result.map_err(|err| evaluation_error(path, &err, context))?;

        module
            .get(js_string!("exports"), context)
            .map_err(|err| evaluation_error(path, &err, context))
    }

    /// The `require` function handed to modules living in `base_dir`
    pub fn require_function(self: &Rc<Self>, base_dir: &str, context: &mut Context) -> JsFunction {
        NativeFunction::from_copy_closure_with_captures(
            |_this, args, captures: &RequireCaptures, context| {
                let specifier = args
                    .get_or_undefined(0)
                    .to_string(context)?
                    .to_std_string_escaped();
                captures
                    .loader
                    .require(&specifier, &captures.base_dir, context)
                    .map_err(|err| err.into_js(context))
            },
            RequireCaptures {
                loader: self.clone(),
                base_dir: base_dir.to_string(),
            },
        )
        .to_js_function(context.realm())
    }
}

fn evaluation_error(path: &str, err: &JsError, context: &mut Context) -> RuntimeError {
    RuntimeError::ModuleEvaluation {
        path: path.to_string(),
        message: ThrownError::from_js(err, context).message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFs;

    fn loader_with(files: &[(&str, &str)]) -> (Rc<ModuleLoader>, Arc<MemoryFs>, Context) {
        let fs = Arc::new(MemoryFs::with_files(files.iter().copied()));
        let loader = Rc::new(ModuleLoader::new(fs.clone(), 0));
        (loader, fs, Context::default())
    }

    #[test]
    fn test_resolution_rules() {
        let (loader, _fs, _ctx) = loader_with(&[
            ("/lib/math.js", ""),
            ("/lib/data.json", "{}"),
            ("/lib/pkg/index.json", "{}"),
            ("/lib/both/index.js", ""),
            ("/lib/both/index.json", ""),
        ]);

        assert_eq!(loader.resolve("./math", "/lib").unwrap(), "/lib/math.js");
        assert_eq!(loader.resolve("math.js", "/lib").unwrap(), "/lib/math.js");
        assert_eq!(loader.resolve("../lib/data", "/lib/pkg").unwrap(), "/lib/data.json");
        assert_eq!(loader.resolve("/lib/pkg", "/elsewhere").unwrap(), "/lib/pkg/index.json");
        assert_eq!(loader.resolve("./both", "/lib").unwrap(), "/lib/both/index.js");
        assert!(matches!(
            loader.resolve("./missing", "/lib"),
            Err(RuntimeError::ModuleNotFound(_))
        ));
    }

    #[test]
    fn test_cache_identity_follows_mtime() {
        let (loader, fs, mut context) = loader_with(&[("/routes/a.js", "exports.n = 1;")]);

        let first = loader.load("/routes/a.js", "/", &mut context).unwrap();
        let second = loader.load("./a", "/routes", &mut context).unwrap();
        assert_eq!(first.handle, second.handle);
        let same = JsValue::strict_equals(&first.exports, &second.exports);
        assert!(same);

        fs.write_file("/routes/a.js", b"exports.n = 2;").unwrap();
        let third = loader.load("/routes/a.js", "/", &mut context).unwrap();
        assert_ne!(first.handle.id, third.handle.id);
        assert!(!JsValue::strict_equals(&first.exports, &third.exports));

        let n = third
            .exports
            .as_object()
            .unwrap()
            .get(js_string!("n"), &mut context)
            .unwrap();
        assert_eq!(n.as_number(), Some(2.0));
    }

    #[test]
    fn test_module_wrapper_and_nested_require() {
        let (loader, _fs, mut context) = loader_with(&[
            ("/routes/_data/posts.js", "module.exports = { count: 3, file: __filename };"),
            (
                "/routes/blog/index.js",
                "const posts = require('../_data/posts');\n\
                 exports.summary = posts.count + ':' + posts.file + ':' + __dirname;",
            ),
        ]);

        let module = loader.load("/routes/blog", "/", &mut context).unwrap();
        let summary = module
            .exports
            .as_object()
            .unwrap()
            .get(js_string!("summary"), &mut context)
            .unwrap();
        assert_eq!(
            summary.to_string(&mut context).unwrap().to_std_string_escaped(),
            "3:/routes/_data/posts.js:/routes/blog"
        );
        assert_eq!(loader.cached_len(), 2);
    }

    #[test]
    fn test_json_modules_and_builtins() {
        let (loader, _fs, mut context) = loader_with(&[("/config.json", r#"{"port": 8080}"#)]);
        loader.provide("answer", JsValue::from(42));

        let config = loader.require("./config", "/", &mut context).unwrap();
        let port = config
            .as_object()
            .unwrap()
            .get(js_string!("port"), &mut context)
            .unwrap();
        assert_eq!(port.as_number(), Some(8080.0));
        assert_eq!(
            loader.require("node:answer", "/", &mut context).unwrap().as_number(),
            Some(42.0)
        );
    }

    #[test]
    fn test_evaluation_errors_carry_message() {
        let (loader, _fs, mut context) = loader_with(&[
            ("/broken.js", "throw new TypeError('bad module');"),
            ("/syntax.js", "exports.x = ;"),
        ]);

        match loader.load("/broken.js", "/", &mut context) {
            Err(RuntimeError::ModuleEvaluation { path, message }) => {
                assert_eq!(path, "/broken.js");
                assert!(message.contains("bad module"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            loader.load("/syntax.js", "/", &mut context),
            Err(RuntimeError::ModuleEvaluation { .. })
        ));
        assert_eq!(loader.cached_len(), 0);
    }

    #[test]
    fn test_cyclic_require_sees_partial_exports() {
        let (loader, _fs, mut context) = loader_with(&[
            ("/a.js", "exports.early = 'a'; const b = require('./b'); exports.fromB = b.sawEarly;"),
            ("/b.js", "const a = require('./a'); exports.sawEarly = a.early;"),
        ]);

        let a = loader.load("/a.js", "/", &mut context).unwrap();
        let seen = a
            .exports
            .as_object()
            .unwrap()
            .get(js_string!("fromB"), &mut context)
            .unwrap();
        assert_eq!(seen.to_string(&mut context).unwrap().to_std_string_escaped(), "a");
    }

    #[test]
    fn test_panic_during_evaluation_clears_loading_entry() {
        let (loader, fs, mut context) = loader_with(&[(
            "/page.js",
            "exports.partial = true; require('explode')();",
        )]);
        let explode = NativeFunction::from_fn_ptr(|_, _, _| panic!("native failure"))
            .to_js_function(context.realm());
        loader.provide("explode", explode.into());

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            loader.load("/page.js", "/", &mut context)
        }));
        assert!(outcome.is_err());
        assert!(loader.loading.borrow().is_empty());
        assert_eq!(loader.cached_len(), 0);

        // A later load evaluates the module afresh instead of returning partial exports
        fs.write_file("/page.js", b"exports.complete = true;").unwrap();
        let mut fresh = Context::default();
        let page = loader.load("/page.js", "/", &mut fresh).unwrap();
        let exports = page.exports.as_object().unwrap();
        assert_eq!(
            exports.get(js_string!("complete"), &mut fresh).unwrap().as_boolean(),
            Some(true)
        );
        assert!(exports.get(js_string!("partial"), &mut fresh).unwrap().is_undefined());
    }
}
