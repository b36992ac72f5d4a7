//! Synchronous `fs` built-in over the engine's virtual filesystem
//!
//! Failures are thrown as `Error` objects whose `code` is the Node-style errno
//! name (`ENOENT`, `EROFS`, `ENOTDIR`, `EIO`).

use super::{CapabilityConfig, CapabilityError};
use crate::fs::{FsError, VirtualFs, vpath};
use crate::runtime::throw_with_code;
use boa_engine::{
    Context, JsArgs, JsError, JsResult, JsValue, NativeFunction, js_string,
    object::{ObjectInitializer, builtins::JsArray},
    property::Attribute,
};
use boa_gc::{Finalize, Trace};
use std::{sync::Arc, time::UNIX_EPOCH};

#[derive(Trace, Finalize)]
struct FsCaptures {
    #[unsafe_ignore_trace]
    fs: Arc<dyn VirtualFs>,
    base_path: String,
}

impl FsCaptures {
    fn path_arg(&self, args: &[JsValue], context: &mut Context) -> JsResult<String> {
        let path = args
            .get_or_undefined(0)
            .to_string(context)?
            .to_std_string_escaped();
        Ok(vpath::join(&self.base_path, &path))
    }
}

fn throw(err: FsError, context: &mut Context) -> JsError {
    throw_with_code(err.to_string(), err.code(), context)
}

/// Second argument as an encoding name, either directly or as `{ encoding }`
fn encoding_arg(args: &[JsValue], context: &mut Context) -> JsResult<Option<String>> {
    let options = args.get_or_undefined(1);
    let encoding = match options.as_object() {
        Some(object) => object.get(js_string!("encoding"), context)?,
        None => options.clone(),
    };
    if encoding.is_undefined() || encoding.is_null() {
        return Ok(None);
    }
    Ok(Some(encoding.to_string(context)?.to_std_string_escaped()))
}

fn function<F>(fs: &Arc<dyn VirtualFs>, base_path: &str, f: F) -> NativeFunction
where
    F: Fn(&[JsValue], &FsCaptures, &mut Context) -> JsResult<JsValue> + Copy + 'static,
{
    NativeFunction::from_copy_closure_with_captures(
        move |_this, args, captures: &FsCaptures, context| f(args, captures, context),
        FsCaptures {
            fs: fs.clone(),
            base_path: base_path.to_string(),
        },
    )
}

fn read_file_sync(
    args: &[JsValue],
    captures: &FsCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let path = captures.path_arg(args, context)?;
    let encoding = encoding_arg(args, context)?;
    let bytes = captures.fs.read_file(&path).map_err(|e| throw(e, context))?;
    match encoding {
        Some(_) => Ok(js_string!(String::from_utf8_lossy(&bytes).into_owned()).into()),
        None => {
            let values = bytes.into_iter().map(JsValue::from);
            Ok(JsArray::from_iter(values, context).into())
        }
    }
}

fn write_file_sync(
    args: &[JsValue],
    captures: &FsCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let path = captures.path_arg(args, context)?;
    let data = args
        .get_or_undefined(1)
        .to_string(context)?
        .to_std_string_escaped();
    captures
        .fs
        .write_file(&path, data.as_bytes())
        .map_err(|e| throw(e, context))?;
    Ok(JsValue::undefined())
}

fn exists_sync(
    args: &[JsValue],
    captures: &FsCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let path = captures.path_arg(args, context)?;
    Ok(JsValue::from(captures.fs.exists(&path)))
}

fn readdir_sync(
    args: &[JsValue],
    captures: &FsCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let path = captures.path_arg(args, context)?;
    let entries = captures.fs.read_dir(&path).map_err(|e| throw(e, context))?;
    let names = entries
        .into_iter()
        .map(|entry| JsValue::from(js_string!(entry.name)));
    Ok(JsArray::from_iter(names, context).into())
}

fn stat_sync(args: &[JsValue], captures: &FsCaptures, context: &mut Context) -> JsResult<JsValue> {
    let path = captures.path_arg(args, context)?;
    let stat = captures.fs.stat(&path).map_err(|e| throw(e, context))?;
    let mtime_ms = stat
        .modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default();

    let is_dir = stat.is_dir;
    let object = ObjectInitializer::new(context)
        .property(js_string!("size"), stat.len as f64, Attribute::all())
        .property(js_string!("mtimeMs"), mtime_ms, Attribute::all())
        .function(
            NativeFunction::from_copy_closure(move |_this, _args, _context| {
                Ok(JsValue::from(!is_dir))
            }),
            js_string!("isFile"),
            0,
        )
        .function(
            NativeFunction::from_copy_closure(move |_this, _args, _context| {
                Ok(JsValue::from(is_dir))
            }),
            js_string!("isDirectory"),
            0,
        )
        .build();
    Ok(object.into())
}

fn mkdir_sync(args: &[JsValue], captures: &FsCaptures, context: &mut Context) -> JsResult<JsValue> {
    let path = captures.path_arg(args, context)?;
    captures
        .fs
        .create_dir_all(&path)
        .map_err(|e| throw(e, context))?;
    Ok(JsValue::undefined())
}

fn unlink_sync(
    args: &[JsValue],
    captures: &FsCaptures,
    context: &mut Context,
) -> JsResult<JsValue> {
    let path = captures.path_arg(args, context)?;
    captures.fs.remove(&path).map_err(|e| throw(e, context))?;
    Ok(JsValue::undefined())
}

pub(super) fn install(config: &mut CapabilityConfig<'_>) -> Result<(), CapabilityError> {
    let (fs, base) = (config.fs, config.base_path);
    let functions: [(&str, NativeFunction, usize); 7] = [
        ("readFileSync", function(fs, base, read_file_sync), 2),
        ("writeFileSync", function(fs, base, write_file_sync), 2),
        ("existsSync", function(fs, base, exists_sync), 1),
        ("readdirSync", function(fs, base, readdir_sync), 1),
        ("statSync", function(fs, base, stat_sync), 1),
        ("mkdirSync", function(fs, base, mkdir_sync), 1),
        ("unlinkSync", function(fs, base, unlink_sync), 1),
    ];

    let module = {
        let mut builder = ObjectInitializer::new(config.context);
        for (name, function, length) in functions {
            builder.function(function, js_string!(name), length);
        }
        builder.build()
    };

    config.provide_module("fs", module);
    Ok(())
}
