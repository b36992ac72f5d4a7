//! JSON bridging through the engine's own `JSON` global, so values serialize
//! exactly as scripts see them (toJSON, Dates, undefined members).

use boa_engine::{Context, JsNativeError, JsResult, JsValue, js_string};

fn json_method(name: &str, context: &mut Context) -> JsResult<(JsValue, boa_engine::JsObject)> {
    let json = context.global_object().get(js_string!("JSON"), context)?;
    let method = json
        .as_object()
        .map(|object| object.get(js_string!(name), context))
        .transpose()?
        .and_then(|value| value.as_callable().map(|f| f.clone()))
        .ok_or_else(|| JsNativeError::typ().with_message(format!("JSON.{name} is not available")))?;
    Ok((json, method))
}

/// `JSON.stringify(value)`; `None` when the value has no JSON form (undefined, functions)
pub(crate) fn stringify(value: &JsValue, context: &mut Context) -> JsResult<Option<String>> {
    let (json, stringify) = json_method("stringify", context)?;
    let result = stringify.call(&json, &[value.clone()], context)?;
    if result.is_undefined() {
        return Ok(None);
    }
    Ok(Some(result.to_string(context)?.to_std_string_escaped()))
}

/// `JSON.parse(text)`
pub(crate) fn parse(text: &str, context: &mut Context) -> JsResult<JsValue> {
    let (json, parse) = json_method("parse", context)?;
    parse.call(&json, &[js_string!(text).into()], context)
}

/// Convert a script value into a `serde_json::Value` (undefined becomes null)
pub(crate) fn to_serde(value: &JsValue, context: &mut Context) -> JsResult<serde_json::Value> {
    match stringify(value, context)? {
        Some(text) => serde_json::from_str(&text).map_err(|e| {
            JsNativeError::typ()
                .with_message(format!("value is not valid JSON: {e}"))
                .into()
        }),
        None => Ok(serde_json::Value::Null),
    }
}
