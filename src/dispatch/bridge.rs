//! Request and response objects handed to route handlers
//!
//! The [`ResponseBridge`] is the only way a handler can produce a response. The
//! first write wins: `json`, `send` and `render` check and set the sent flag under
//! one lock, and every later write, including the dispatcher's own fallback
//! responses, becomes a no-op.

use super::DispatchError;
use super::template::{TemplateError, TemplateRenderer, find_template};
use crate::fs::VirtualFs;
use crate::runtime::json;
use crate::server::{RequestInfo, ResponseBuilder};
use boa_engine::{
    Context, JsArgs, JsObject, JsResult, JsValue, NativeFunction, js_string,
    object::ObjectInitializer, property::Attribute,
};
use boa_gc::{Finalize, Trace};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::oneshot;

struct BridgeState {
    sent: bool,
    status: u16,
    headers: HashMap<String, String>,
    sender: Option<oneshot::Sender<ResponseBuilder>>,
    error: Option<DispatchError>,
}

pub struct ResponseBridge {
    state: Mutex<BridgeState>,
}

impl ResponseBridge {
    /// A fresh bridge and the receiver that gets its single response
    pub fn new() -> (Arc<Self>, oneshot::Receiver<ResponseBuilder>) {
        let (sender, receiver) = oneshot::channel();
        let bridge = Arc::new(Self {
            state: Mutex::new(BridgeState {
                sent: false,
                status: 200,
                headers: HashMap::new(),
                sender: Some(sender),
                error: None,
            }),
        });
        (bridge, receiver)
    }

    pub fn is_sent(&self) -> bool {
        self.state.lock().sent
    }

    pub fn status(&self) -> u16 {
        self.state.lock().status
    }

    pub fn set_status(&self, status: u16) {
        self.state.lock().status = status;
    }

    pub fn set_header(&self, name: &str, value: &str) {
        self.state
            .lock()
            .headers
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    /// Write the response with the current status and headers.
    ///
    /// Returns `false` without writing when a response was already sent.
    pub fn respond(&self, content_type: &str, body: Vec<u8>) -> bool {
        let mut state = self.state.lock();
        if state.sent {
            return false;
        }
        state.sent = true;

        let mut response = ResponseBuilder::new().status(state.status);
        response
            .headers
            .insert("content-type".to_string(), content_type.to_string());
        for (name, value) in &state.headers {
            response.headers.insert(name.clone(), value.clone());
        }
        response.body = body;

        if let Some(sender) = state.sender.take() {
            let _ = sender.send(response);
        }
        true
    }

    /// Take the right to respond without going through the handler path.
    ///
    /// Returns `false` when a response was already sent.
    pub fn claim(&self) -> bool {
        let mut state = self.state.lock();
        if state.sent {
            return false;
        }
        state.sent = true;
        state.sender = None;
        true
    }

    /// Keep the first error reported for this request
    pub fn record_error(&self, error: DispatchError) {
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
    }

    pub fn take_error(&self) -> Option<DispatchError> {
        self.state.lock().error.take()
    }

    /// Record `error` and answer with it unless a response already went out
    pub fn fail(&self, error: DispatchError) {
        let response = error.to_response();
        let mut state = self.state.lock();
        if state.error.is_none() {
            state.error = Some(error);
        }
        if state.sent {
            return;
        }
        state.sent = true;
        if let Some(sender) = state.sender.take() {
            let _ = sender.send(response);
        }
    }
}

/// What `render(data)` needs besides the bridge
#[derive(Clone)]
pub struct RenderTarget {
    pub fs: Arc<dyn VirtualFs>,
    pub renderer: Arc<dyn TemplateRenderer>,
    pub script_path: String,
}

type ResponseMethod =
    fn(&JsValue, &[JsValue], &ResponseCaptures, &mut Context) -> JsResult<JsValue>;

#[derive(Clone, Trace, Finalize)]
struct ResponseCaptures {
    #[unsafe_ignore_trace]
    bridge: Arc<ResponseBridge>,
    #[unsafe_ignore_trace]
    target: RenderTarget,
}

fn response_json(
    this: &JsValue,
    args: &[JsValue],
    captures: &ResponseCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    if captures.bridge.is_sent() {
        return Ok(this.clone());
    }
    let body = json::stringify(args.get_or_undefined(0), context)?
        .unwrap_or_else(|| "null".to_string());
    captures.bridge.respond("application/json", body.into_bytes());
    Ok(this.clone())
}

fn response_send(
    this: &JsValue,
    args: &[JsValue],
    captures: &ResponseCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    if captures.bridge.is_sent() {
        return Ok(this.clone());
    }
    let data = args.get_or_undefined(0);
    let body = if data.is_undefined() {
        String::new()
    } else {
        data.to_string(context)?.to_std_string_escaped()
    };
    captures
        .bridge
        .respond("text/plain; charset=utf-8", body.into_bytes());
    Ok(this.clone())
}

fn response_render(
    this: &JsValue,
    args: &[JsValue],
    captures: &ResponseCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    if captures.bridge.is_sent() {
        return Ok(this.clone());
    }
    let target = &captures.target;
    let Some(template) = find_template(target.fs.as_ref(), &target.script_path) else {
        captures
            .bridge
            .fail(DispatchError::TemplateNotFound(target.script_path.clone()));
        return Ok(this.clone());
    };

    let data = json::to_serde(args.get_or_undefined(0), context)?;
    match target.renderer.render(target.fs.as_ref(), &template, &data) {
        Ok(rendered) => {
            captures.bridge.respond(rendered.content_type, rendered.body);
        }
        Err(TemplateError::NotFound(path)) => {
            captures.bridge.fail(DispatchError::TemplateNotFound(path));
        }
        Err(err) => captures.bridge.fail(DispatchError::Template(err)),
    }
    Ok(this.clone())
}

fn response_status(
    this: &JsValue,
    args: &[JsValue],
    captures: &ResponseCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let code = args.get_or_undefined(0).to_u32(context)?;
    if (100..=999).contains(&code) {
        captures.bridge.set_status(code as u16);
    }
    Ok(this.clone())
}

fn response_set_header(
    this: &JsValue,
    args: &[JsValue],
    captures: &ResponseCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let name = args.get_or_undefined(0).to_string(context)?.to_std_string_escaped();
    let value = args.get_or_undefined(1).to_string(context)?.to_std_string_escaped();
    captures.bridge.set_header(&name, &value);
    Ok(this.clone())
}

/// `{ json, send, render, status, setHeader }` bound to one bridge
pub fn response_object(
    bridge: &Arc<ResponseBridge>,
    target: RenderTarget,
    context: &mut Context,
) -> JsObject {
    let captures = ResponseCaptures {
        bridge: bridge.clone(),
        target,
    };
    let method = |f: ResponseMethod| {
        NativeFunction::from_copy_closure_with_captures(f, captures.clone())
    };

    ObjectInitializer::new(context)
        .function(method(response_json), js_string!("json"), 1)
        .function(method(response_send), js_string!("send"), 1)
        .function(method(response_render), js_string!("render"), 1)
        .function(method(response_status), js_string!("status"), 1)
        .function(method(response_set_header), js_string!("setHeader"), 2)
        .build()
}

fn string_map(map: &HashMap<String, String>, context: &mut Context) -> JsObject {
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort();
    let mut builder = ObjectInitializer::new(context);
    for (key, value) in entries {
        builder.property(js_string!(key.as_str()), js_string!(value.as_str()), Attribute::all());
    }
    builder.build()
}

/// `{ method, url, path, query, headers, params, body? }`
pub fn request_object(request: &RequestInfo, context: &mut Context) -> JsObject {
    let headers = string_map(&request.headers, context);
    let params = string_map(&request.params, context);

    let mut builder = ObjectInitializer::new(context);
    builder
        .property(js_string!("method"), js_string!(request.method.as_str()), Attribute::all())
        .property(js_string!("url"), js_string!(request.url.as_str()), Attribute::all())
        .property(js_string!("path"), js_string!(request.path.as_str()), Attribute::all())
        .property(js_string!("query"), js_string!(request.query.as_str()), Attribute::all())
        .property(js_string!("headers"), headers, Attribute::all())
        .property(js_string!("params"), params, Attribute::all());

    if !matches!(request.method.as_str(), "GET" | "HEAD") {
        let body = request.text().unwrap_or_default();
        builder.property(js_string!("body"), js_string!(body), Attribute::all());
    }
    builder.build()
}

/// The `next` argument; calling it does nothing
pub fn next_function(context: &mut Context) -> JsValue {
    NativeFunction::from_fn_ptr(|_this, _args, _context| Ok(JsValue::undefined()))
        .to_js_function(context.realm())
        .into()
}
