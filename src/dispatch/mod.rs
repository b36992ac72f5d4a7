//! Request dispatch onto script engines
//!
//! One dispatch runs one HTTP-method export of one route module for one request:
//!
//! 1. load the route module through the engine's cache (404 when missing, 500 when
//!    it fails to evaluate)
//! 2. pick the export named after the lowercased method, `delete` falling back to
//!    `del` (405 when there is none; the handler is never called)
//! 3. build the request/response objects and call the handler on the engine queue
//! 4. wait for the first response write, bounded by the request timeout; once the
//!    synchronous call has returned, asynchronous continuations get at least
//!    the grace period to respond
//!
//! The wait is advisory. A handler that never yields keeps its engine busy after
//! the dispatcher has answered with 408.

mod bridge;
pub mod template;

pub use bridge::{RenderTarget, ResponseBridge, next_function, request_object, response_object};
pub use template::{BasicRenderer, Rendered, TemplateError, TemplateRenderer, find_template};

use crate::fs::{VirtualFs, vpath};
use crate::pool::{EnginePool, PoolRegistry};
use crate::runtime::{EngineScope, RuntimeError, RuntimeResult, ScriptEngine, ThrownError};
use crate::server::{RequestInfo, ResponseBuilder};
use boa_engine::{
    Context, JsObject, JsResult, JsValue, NativeFunction, js_string,
    object::builtins::JsPromise,
};
use boa_gc::{Finalize, Trace};
use md5::{Digest, Md5};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::Instant;

/// A resolved route, as produced by the route table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub url_path: String,
    /// Absolute virtual path of the script or template
    pub file_path: String,
    /// Extension without the dot: `js`, `html`, `md`, ...
    pub file_type: String,
    pub is_dynamic: bool,
    pub param_name: Option<String>,
}

impl Route {
    pub fn is_script(&self) -> bool {
        self.file_type == "js"
    }
}

/// Why a dispatch failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("error evaluating {path}: {message}")]
    ModuleEvaluation { path: String, message: String },

    #[error("handler failed: {0}")]
    HandlerPanic(String),

    #[error("no response after {0} ms")]
    TimeoutExceeded(u64),

    #[error("no template found for {0}")]
    TemplateNotFound(String),

    #[error("read-only filesystem violation: {0}")]
    ReadOnlyFilesystem(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("engine unavailable: {0}")]
    Engine(String),
}

impl DispatchError {
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::FileNotFound(_) => 404,
            DispatchError::MethodNotAllowed { .. } => 405,
            DispatchError::TimeoutExceeded(_) => 408,
            DispatchError::Engine(_) => 503,
            DispatchError::ModuleEvaluation { .. }
            | DispatchError::HandlerPanic(_)
            | DispatchError::TemplateNotFound(_)
            | DispatchError::ReadOnlyFilesystem(_)
            | DispatchError::Template(_) => 500,
        }
    }

    /// The response written when this error happens before any handler write
    pub fn to_response(&self) -> ResponseBuilder {
        let body = match self {
            DispatchError::FileNotFound(_) => "File not found".to_string(),
            DispatchError::MethodNotAllowed { .. } => "Method not allowed".to_string(),
            DispatchError::TimeoutExceeded(_) => {
                "Request timeout: handler produced no response".to_string()
            }
            other => other.to_string(),
        };
        ResponseBuilder::new().status(self.status()).text(body)
    }

    /// Map an exception thrown by handler code
    fn from_thrown(thrown: ThrownError) -> Self {
        if thrown.is_read_only() {
            DispatchError::ReadOnlyFilesystem(thrown.message)
        } else {
            DispatchError::HandlerPanic(thrown.message)
        }
    }
}

impl From<RuntimeError> for DispatchError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::ModuleNotFound(path) => DispatchError::FileNotFound(path),
            RuntimeError::ModuleEvaluation { path, message } => {
                DispatchError::ModuleEvaluation { path, message }
            }
            RuntimeError::TaskPanicked(message) | RuntimeError::JsError(message) => {
                DispatchError::HandlerPanic(message)
            }
            other => DispatchError::Engine(other.to_string()),
        }
    }
}

/// Outcome of one dispatch.
///
/// `error` may be set even when `response` came from the handler, e.g. when it
/// threw after writing. The response must still be written only once.
#[derive(Debug)]
pub struct Dispatched {
    pub response: ResponseBuilder,
    pub error: Option<DispatchError>,
}

impl Dispatched {
    fn failed(error: DispatchError) -> Self {
        Self {
            response: error.to_response(),
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub request_timeout: Duration,
    pub async_grace: Duration,
    /// Route requests from the same client to the same engine
    pub session_affinity: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            async_grace: Duration::from_secs(5),
            session_affinity: true,
        }
    }
}

/// Stable session id for a client: md5 of its address and user agent.
///
/// The address comes from `X-Real-IP`, then the first `X-Forwarded-For` entry,
/// then the peer address, without port or IPv6 brackets.
pub fn session_id(request: &RequestInfo) -> String {
    let forwarded = request
        .header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim);
    let address = request
        .header("x-real-ip")
        .map(str::trim)
        .or(forwarded)
        .or(request.remote_addr.as_deref())
        .map(strip_port)
        .unwrap_or_default();
    let user_agent = request.header("user-agent").unwrap_or_default();

    let mut hasher = Md5::new();
    hasher.update(address.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    hex::encode(hasher.finalize())
}

fn strip_port(address: &str) -> &str {
    if let Some(rest) = address.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match address.rsplit_once(':') {
        // A single colon separates host and port; more means a bare IPv6 address
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => address,
    }
}

/// Runs route handlers for one site (filesystem and version)
pub struct Dispatcher {
    registry: Arc<PoolRegistry>,
    fs: Arc<dyn VirtualFs>,
    version: String,
    renderer: Arc<dyn TemplateRenderer>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<PoolRegistry>,
        fs: Arc<dyn VirtualFs>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            fs,
            version: version.into(),
            renderer: Arc::new(BasicRenderer),
            config: DispatchConfig::default(),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn fs(&self) -> &Arc<dyn VirtualFs> {
        &self.fs
    }

    pub fn pool(&self) -> RuntimeResult<Arc<EnginePool>> {
        self.registry.pool_for(&self.fs, &self.version)
    }

    /// Serve `request` for `route`: templates directly, scripts on a pooled engine
    pub async fn dispatch(&self, route: &Route, request: &RequestInfo) -> Dispatched {
        if !route.is_script() {
            return self.render_page(route, request);
        }

        let pool = match self.pool() {
            Ok(pool) => pool,
            Err(err) => return Dispatched::failed(err.into()),
        };

        let session = self.config.session_affinity.then(|| session_id(request));
        let engine = match &session {
            Some(id) => pool.get_engine_for_session(id),
            None => pool.get_engine(),
        };
        let engine = match engine {
            Ok(engine) => engine,
            Err(err) => return Dispatched::failed(err.into()),
        };

        let dispatched = self.dispatch_on(&engine, route, request).await;
        if session.is_none() {
            pool.return_engine(engine);
        }
        dispatched
    }

    /// Run the route handler on a specific engine
    pub async fn dispatch_on(
        &self,
        engine: &ScriptEngine,
        route: &Route,
        request: &RequestInfo,
    ) -> Dispatched {
        let (bridge, mut response_rx) = ResponseBridge::new();
        let invocation = Invocation {
            route: route.clone(),
            request: request.clone(),
            bridge: bridge.clone(),
            target: RenderTarget {
                fs: self.fs.clone(),
                renderer: self.renderer.clone(),
                script_path: route.file_path.clone(),
            },
        };

        let mut returned_rx = match engine.run(move |scope| Ok(invocation.invoke(scope))) {
            Ok(rx) => rx,
            Err(err) => return Dispatched::failed(err.into()),
        };

        let timeout = self.config.request_timeout;
        let mut deadline = Instant::now() + timeout;
        let mut returned = false;

        loop {
            tokio::select! {
                response = &mut response_rx => {
                    let Ok(response) = response else {
                        return Dispatched::failed(DispatchError::Engine(
                            "response channel closed".to_string(),
                        ));
                    };
                    // The synchronous call may still throw after writing
                    if !returned {
                        let settled = tokio::time::timeout_at(deadline, &mut returned_rx).await;
                        if let Ok(Ok(result)) = settled {
                            let result = result.map_err(DispatchError::from).and_then(|r| r);
                            if let Err(error) = result {
                                tracing::warn!(
                                    path = %route.file_path,
                                    "handler failed after responding: {error}"
                                );
                                bridge.record_error(error);
                            }
                        }
                    }
                    return Dispatched { response, error: bridge.take_error() };
                }
                outcome = &mut returned_rx, if !returned => {
                    returned = true;
                    let outcome = match outcome {
                        Ok(result) => result.map_err(DispatchError::from).and_then(|r| r),
                        Err(_) => Err(DispatchError::Engine(format!(
                            "engine {} stopped",
                            engine.id()
                        ))),
                    };
                    match outcome {
                        // Already-sent responses are waiting in the channel
                        Ok(()) if bridge.is_sent() => {}
                        Ok(()) => {
                            let grace = Instant::now() + self.config.async_grace;
                            deadline = deadline.max(grace);
                        }
                        Err(error) => {
                            if bridge.claim() {
                                return Dispatched::failed(error);
                            }
                            tracing::warn!(
                                path = %route.file_path,
                                "handler failed after responding: {error}"
                            );
                            bridge.record_error(error);
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        let error = bridge
            .take_error()
            .unwrap_or(DispatchError::TimeoutExceeded(timeout.as_millis() as u64));
        if bridge.claim() {
            tracing::warn!(path = %route.file_path, "no response before deadline: {error}");
            return Dispatched::failed(error);
        }
        // A write raced the deadline
        match response_rx.try_recv() {
            Ok(response) => Dispatched {
                response,
                error: Some(error),
            },
            Err(_) => Dispatched::failed(error),
        }
    }

    /// Render a template route without a script
    pub fn render_page(&self, route: &Route, request: &RequestInfo) -> Dispatched {
        if !matches!(request.method.as_str(), "GET" | "HEAD") {
            return Dispatched::failed(DispatchError::MethodNotAllowed {
                method: request.method.clone(),
                path: route.file_path.clone(),
            });
        }
        if !self.fs.is_file(&route.file_path) {
            return Dispatched::failed(DispatchError::FileNotFound(route.file_path.clone()));
        }

        let data = serde_json::json!({
            "path": request.path,
            "query": request.query,
            "params": request.params,
        });
        match self.renderer.render(self.fs.as_ref(), &route.file_path, &data) {
            Ok(rendered) => Dispatched {
                response: ResponseBuilder::new()
                    .header("content-type", rendered.content_type)
                    .body(rendered.body),
                error: None,
            },
            Err(err) => Dispatched::failed(err.into()),
        }
    }
}

/// Everything the engine-side half of a dispatch needs
struct Invocation {
    route: Route,
    request: RequestInfo,
    bridge: Arc<ResponseBridge>,
    target: RenderTarget,
}

#[derive(Trace, Finalize)]
struct RejectionCaptures {
    #[unsafe_ignore_trace]
    bridge: Arc<ResponseBridge>,
}

impl Invocation {
    fn invoke(self, scope: &mut EngineScope) -> Result<(), DispatchError> {
        let base_dir = vpath::dirname(&self.route.file_path);
        let module = scope.load_module(&self.route.file_path, &base_dir)?;
        let context = scope.context_mut();

        let handler = find_handler(&module.exports, &self.request.method, context)
            .map_err(|err| DispatchError::from_thrown(ThrownError::from_js(&err, context)))?
            .ok_or_else(|| DispatchError::MethodNotAllowed {
                method: self.request.method.clone(),
                path: self.route.file_path.clone(),
            })?;

        let request = request_object(&self.request, context);
        let response = response_object(&self.bridge, self.target, context);
        let next = next_function(context);

        let returned = handler
            .call(&module.exports, &[request.into(), response.into(), next], context)
            .map_err(|err| DispatchError::from_thrown(ThrownError::from_js(&err, context)))?;

        let promise = returned
            .as_object()
            .and_then(|object| JsPromise::from_object(object.clone()).ok());
        if let Some(promise) = promise {
            let on_rejected = NativeFunction::from_copy_closure_with_captures(
                |_this, args, captures: &RejectionCaptures, context| {
                    let reason = args.first().cloned().unwrap_or_default();
                    let thrown = ThrownError::from_value(&reason, context);
                    captures.bridge.fail(DispatchError::from_thrown(thrown));
                    Ok(JsValue::undefined())
                },
                RejectionCaptures {
                    bridge: self.bridge.clone(),
                },
            )
            .to_js_function(context.realm());
            promise.then(None, Some(on_rejected), context);
        }
        Ok(())
    }
}

/// The export handling `method`, if it is callable
fn find_handler(
    exports: &JsValue,
    method: &str,
    context: &mut Context,
) -> JsResult<Option<JsObject>> {
    let Some(exports) = exports.as_object() else {
        return Ok(None);
    };
    let method = method.to_ascii_lowercase();
    let names: &[&str] = if method == "delete" { &["delete", "del"] } else { &[method.as_str()] };

    for name in names {
        let value = exports.get(js_string!(*name), context)?;
        if let Some(function) = value.as_callable() {
            return Ok(Some(function.clone()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EmbeddedFs, MemoryFs};
    use crate::pool::PoolOptions;
    use crate::runtime::EngineSetup;
    use std::collections::HashMap;

    fn request(method: &str, path: &str) -> RequestInfo {
        RequestInfo {
            method: method.to_string(),
            url: path.to_string(),
            path: path.to_string(),
            query: String::new(),
            headers: HashMap::new(),
            params: HashMap::new(),
            body: None,
            remote_addr: Some("127.0.0.1:50000".to_string()),
        }
    }

    fn route(file_path: &str) -> Route {
        Route {
            url_path: vpath::clean(
                template::template_stem(file_path).trim_start_matches("/routes"),
            ),
            file_path: file_path.to_string(),
            file_type: vpath::extname(file_path).trim_start_matches('.').to_string(),
            is_dynamic: false,
            param_name: None,
        }
    }

    fn dispatcher(fs: Arc<dyn VirtualFs>, config: DispatchConfig) -> Dispatcher {
        let registry = Arc::new(PoolRegistry::new(PoolOptions {
            capacity: 1,
            ..PoolOptions::default()
        }));
        Dispatcher::new(registry, fs, "test").with_config(config)
    }

    fn body(dispatched: &Dispatched) -> String {
        String::from_utf8_lossy(&dispatched.response.body).into_owned()
    }

    fn memory(files: &[(&str, &str)]) -> Arc<dyn VirtualFs> {
        Arc::new(MemoryFs::with_files(files.iter().copied()))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_success_scenario() {
        let fs = memory(&[(
            "/routes/test.js",
            "exports.get = (req, res) => res.json({ method: req.method, success: true });",
        )]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let dispatched = dispatcher
            .dispatch(&route("/routes/test.js"), &request("GET", "/test"))
            .await;
        assert_eq!(dispatched.response.status, 200);
        assert_eq!(
            dispatched.response.headers.get("content-type").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(body(&dispatched), r#"{"method":"GET","success":true}"#);
        assert!(dispatched.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_only_first_write_is_sent() {
        let fs = memory(&[(
            "/routes/twice.js",
            "exports.get = (req, res) => { res.status(201).json({ first: true }); res.send('second'); };",
        )]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let dispatched = dispatcher
            .dispatch(&route("/routes/twice.js"), &request("GET", "/twice"))
            .await;
        assert_eq!(dispatched.response.status, 201);
        assert_eq!(body(&dispatched), r#"{"first":true}"#);
        assert!(dispatched.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_throw_after_send_keeps_response() {
        let fs = memory(&[(
            "/routes/late.js",
            "exports.get = (req, res) => { res.send('ok'); throw new Error('late'); };",
        )]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let dispatched = dispatcher
            .dispatch(&route("/routes/late.js"), &request("GET", "/late"))
            .await;
        assert_eq!(dispatched.response.status, 200);
        assert_eq!(body(&dispatched), "ok");
        assert!(matches!(
            dispatched.error,
            Some(DispatchError::HandlerPanic(ref message)) if message.contains("late")
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_method_not_allowed_never_calls_handler() {
        let fs = memory(&[(
            "/routes/get-only.js",
            "globalThis.calls = 0;\nexports.get = (req, res) => { globalThis.calls++; res.send('ok'); };",
        )]);
        let dispatcher = dispatcher(fs.clone(), DispatchConfig::default());
        let engine = ScriptEngine::spawn(EngineSetup::new(fs)).unwrap();

        let dispatched = dispatcher
            .dispatch_on(&engine, &route("/routes/get-only.js"), &request("POST", "/get-only"))
            .await;
        assert_eq!(dispatched.response.status, 405);
        assert_eq!(body(&dispatched), "Method not allowed");

        let calls = engine
            .call(|scope| scope.eval("globalThis.calls").map(|v| v.as_number()))
            .await
            .unwrap();
        assert_eq!(calls, Some(0.0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_falls_back_to_del() {
        let fs = memory(&[("/routes/item.js", "exports.del = (req, res) => res.send('gone');")]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let dispatched = dispatcher
            .dispatch(&route("/routes/item.js"), &request("DELETE", "/item"))
            .await;
        assert_eq!(body(&dispatched), "gone");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_module_and_evaluation_error() {
        let fs = memory(&[("/routes/broken.js", "exports.get = ;")]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let missing = dispatcher
            .dispatch(&route("/routes/nope.js"), &request("GET", "/nope"))
            .await;
        assert_eq!(missing.response.status, 404);
        assert_eq!(body(&missing), "File not found");

        let broken = dispatcher
            .dispatch(&route("/routes/broken.js"), &request("GET", "/broken"))
            .await;
        assert_eq!(broken.response.status, 500);
        assert!(matches!(broken.error, Some(DispatchError::ModuleEvaluation { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_async_response_within_grace() {
        let fs = memory(&[(
            "/routes/later.js",
            "exports.get = (req, res) => { setTimeout(() => res.send('later'), 300); };",
        )]);
        let dispatcher = dispatcher(
            fs,
            DispatchConfig {
                request_timeout: Duration::from_millis(100),
                async_grace: Duration::from_secs(2),
                session_affinity: false,
            },
        );

        let dispatched = dispatcher
            .dispatch(&route("/routes/later.js"), &request("GET", "/later"))
            .await;
        assert_eq!(dispatched.response.status, 200);
        assert_eq!(body(&dispatched), "later");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_when_nothing_responds() {
        let fs = memory(&[(
            "/routes/hang.js",
            "exports.get = (req, res) => { new Promise(() => {}).then(() => res.send('never')); };",
        )]);
        let dispatcher = dispatcher(
            fs,
            DispatchConfig {
                request_timeout: Duration::from_millis(50),
                async_grace: Duration::from_millis(50),
                session_affinity: false,
            },
        );

        let dispatched = dispatcher
            .dispatch(&route("/routes/hang.js"), &request("GET", "/hang"))
            .await;
        assert_eq!(dispatched.response.status, 408);
        assert_eq!(body(&dispatched), "Request timeout: handler produced no response");
        assert!(matches!(dispatched.error, Some(DispatchError::TimeoutExceeded(50))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_thrown_and_rejected_handlers() {
        let fs = memory(&[
            ("/routes/throws.js", "exports.get = () => { throw new Error('kaput'); };"),
            (
                "/routes/rejects.js",
                "exports.get = async () => { throw new Error('async kaput'); };",
            ),
        ]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let thrown = dispatcher
            .dispatch(&route("/routes/throws.js"), &request("GET", "/throws"))
            .await;
        assert_eq!(thrown.response.status, 500);
        assert!(body(&thrown).contains("kaput"));

        let rejected = dispatcher
            .dispatch(&route("/routes/rejects.js"), &request("GET", "/rejects"))
            .await;
        assert_eq!(rejected.response.status, 500);
        assert!(matches!(
            rejected.error,
            Some(DispatchError::HandlerPanic(ref message)) if message.contains("async kaput")
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_render_falls_back_to_markdown() {
        let fs = memory(&[
            ("/routes/blog.js", "exports.get = (req, res) => res.render({ Title: 'Posts' });"),
            ("/routes/blog.md", "# {{ .Title }}"),
            ("/routes/lonely.js", "exports.get = (req, res) => res.render({});"),
        ]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let blog = dispatcher.dispatch(&route("/routes/blog.js"), &request("GET", "/blog")).await;
        assert_eq!(blog.response.status, 200);
        assert!(body(&blog).contains("<h1>Posts</h1>"));

        let lonely = dispatcher
            .dispatch(&route("/routes/lonely.js"), &request("GET", "/lonely"))
            .await;
        assert_eq!(lonely.response.status, 500);
        assert!(matches!(lonely.error, Some(DispatchError::TemplateNotFound(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_read_only_write_is_a_500() {
        let fs: Arc<dyn VirtualFs> = Arc::new(EmbeddedFs::new([(
            "/routes/save.js",
            b"const fs = require('fs');\nexports.post = (req, res) => { fs.writeFileSync('/data.txt', req.body); res.send('saved'); };"
                .as_slice(),
        )]));
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let mut post = request("POST", "/save");
        post.body = Some(b"payload".to_vec());
        let dispatched = dispatcher.dispatch(&route("/routes/save.js"), &post).await;
        assert_eq!(dispatched.response.status, 500);
        assert!(body(&dispatched).contains("read-only"));
        assert!(matches!(dispatched.error, Some(DispatchError::ReadOnlyFilesystem(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_requests_on_one_engine_never_interleave() {
        let fs = memory(&[(
            "/routes/count.js",
            "let counter = 0;\nexports.get = (req, res) => { const seen = counter; counter = seen + 1; res.send(String(seen)); };",
        )]);
        let dispatcher = Arc::new(dispatcher(fs.clone(), DispatchConfig::default()));
        let engine = Arc::new(ScriptEngine::spawn(EngineSetup::new(fs)).unwrap());

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                let engine = engine.clone();
                tokio::spawn(async move {
                    let dispatched = dispatcher
                        .dispatch_on(&engine, &route("/routes/count.js"), &request("GET", "/count"))
                        .await;
                    body(&dispatched)
                })
            })
            .collect();

        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap().parse::<u32>().unwrap());
        }
        seen.sort();
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_affinity_keeps_state() {
        let fs = memory(&[(
            "/routes/visits.js",
            "globalThis.visits = (globalThis.visits || 0);\n\
             exports.get = (req, res) => res.send(String(++globalThis.visits));",
        )]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());
        let mut req = request("GET", "/visits");
        req.headers.insert("user-agent".to_string(), "test-agent".to_string());

        let first = dispatcher.dispatch(&route("/routes/visits.js"), &req).await;
        let second = dispatcher.dispatch(&route("/routes/visits.js"), &req).await;
        assert_eq!(body(&first), "1");
        assert_eq!(body(&second), "2");
    }

    #[test]
    fn test_session_id_sources() {
        let mut req = request("GET", "/");
        req.remote_addr = Some("10.0.0.1:4242".to_string());
        let from_peer = session_id(&req);

        req.remote_addr = Some("10.0.0.1:9999".to_string());
        assert_eq!(session_id(&req), from_peer);

        req.headers.insert("x-forwarded-for".to_string(), "10.0.0.1, 172.16.0.1".to_string());
        req.remote_addr = Some("192.168.1.1:80".to_string());
        assert_eq!(session_id(&req), from_peer);

        req.headers.insert("x-real-ip".to_string(), "10.0.0.2".to_string());
        assert_ne!(session_id(&req), from_peer);

        assert_eq!(strip_port("[::1]:8080"), "::1");
        assert_eq!(strip_port("::1"), "::1");
        assert_eq!(session_id(&req).len(), 32);
    }

    #[test]
    fn test_template_route_renders_directly() {
        let fs = memory(&[("/routes/about.html", "<p>{{ .path }}</p>")]);
        let dispatcher = dispatcher(fs, DispatchConfig::default());

        let dispatched = dispatcher
            .render_page(&route("/routes/about.html"), &request("GET", "/about"));
        assert_eq!(dispatched.response.status, 200);
        assert_eq!(body(&dispatched), "<p>/about</p>");

        let post = dispatcher.render_page(&route("/routes/about.html"), &request("POST", "/about"));
        assert_eq!(post.response.status, 405);
    }
}
