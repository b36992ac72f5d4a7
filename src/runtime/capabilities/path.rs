use super::{CapabilityConfig, CapabilityError};
use crate::fs::vpath;
use boa_engine::{
    Context, JsArgs, JsResult, JsValue, NativeFunction, js_string, object::ObjectInitializer,
    property::Attribute,
};
use boa_gc::{Finalize, Trace};

#[derive(Trace, Finalize)]
struct ResolveCaptures {
    cwd: String,
}

fn string_args(args: &[JsValue], context: &mut Context) -> JsResult<Vec<String>> {
    args.iter()
        .map(|value| value.to_string(context).map(|s| s.to_std_string_escaped()))
        .collect()
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

/// Join segments; relative input stays relative
fn join_segments(segments: &[String]) -> String {
    let joined = segments
        .iter()
        .filter(|segment| !segment.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("/");
    if joined.is_empty() {
        return ".".to_string();
    }
    if joined.starts_with('/') {
        return vpath::clean(&joined);
    }
    let cleaned = vpath::relative(&joined);
    if cleaned.is_empty() {
        ".".to_string()
    } else {
        cleaned
    }
}

/// Resolve right to left until an absolute path is formed, falling back to `cwd`
fn resolve_segments(cwd: &str, segments: &[String]) -> String {
    segments
        .iter()
        .fold(cwd.to_string(), |base, segment| vpath::join(&base, segment))
}

/// `path` built-in over virtual POSIX paths
pub(super) fn install(config: &mut CapabilityConfig<'_>) -> Result<(), CapabilityError> {
    let resolve = NativeFunction::from_copy_closure_with_captures(
        |_this, args, captures: &ResolveCaptures, context| {
            let segments = string_args(args, context)?;
            Ok(js_string!(resolve_segments(&captures.cwd, &segments)).into())
        },
        ResolveCaptures {
            cwd: config.base_path.to_string(),
        },
    );

    let path = ObjectInitializer::new(config.context)
        .property(js_string!("sep"), js_string!("/"), Attribute::all())
        .property(js_string!("delimiter"), js_string!(":"), Attribute::all())
        .function(
            NativeFunction::from_fn_ptr(|_this, args, context| {
                let segments = string_args(args, context)?;
                Ok(js_string!(join_segments(&segments)).into())
            }),
            js_string!("join"),
            0,
        )
        .function(resolve, js_string!("resolve"), 0)
        .function(
            NativeFunction::from_fn_ptr(|_this, args, context| {
                let path = string_arg(args, 0, context)?;
                Ok(js_string!(join_segments(&[path])).into())
            }),
            js_string!("normalize"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_this, args, context| {
                let path = string_arg(args, 0, context)?;
                if !path.starts_with('/') && !path.contains('/') {
                    return Ok(js_string!(".").into());
                }
                Ok(js_string!(vpath::dirname(&path)).into())
            }),
            js_string!("dirname"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_this, args, context| {
                let path = string_arg(args, 0, context)?;
                let base = vpath::basename(&path);
                let ext = args.get_or_undefined(1);
                let base = if ext.is_undefined() {
                    base
                } else {
                    let ext = ext.to_string(context)?.to_std_string_escaped();
                    base.strip_suffix(ext.as_str())
                        .filter(|stripped| !stripped.is_empty())
                        .unwrap_or(base)
                };
                Ok(js_string!(base).into())
            }),
            js_string!("basename"),
            2,
        )
        .function(
            NativeFunction::from_fn_ptr(|_this, args, context| {
                let path = string_arg(args, 0, context)?;
                Ok(js_string!(vpath::extname(&path)).into())
            }),
            js_string!("extname"),
            1,
        )
        .function(
            NativeFunction::from_fn_ptr(|_this, args, context| {
                let path = string_arg(args, 0, context)?;
                Ok(JsValue::from(path.starts_with('/')))
            }),
            js_string!("isAbsolute"),
            1,
        )
        .build();

    config.provide_module("path", path);
    Ok(())
}
