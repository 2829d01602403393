//! JSON <-> JavaScript value conversion

use rquickjs::{Array, Ctx, IntoJs, Object, Type, Value as JsValue};
use serde_json::{Map, Number, Value};

/// Deepest nesting accepted from a script
const MAX_DEPTH: usize = 64;

/// Upper bound on values visited in one conversion
const MAX_VALUES: usize = 1_000_000;

/// Convert a JavaScript value to JSON
///
/// `undefined`, functions and symbols become `null`. Cyclic or absurdly
/// deep values are rejected instead of being walked forever.
pub fn js_to_json<'js>(ctx: &Ctx<'js>, js: JsValue<'js>) -> rquickjs::Result<Value> {
    let mut budget = MAX_VALUES;
    walk(ctx, js, 0, &mut budget)
}

fn walk<'js>(ctx: &Ctx<'js>, js: JsValue<'js>, depth: usize, budget: &mut usize) -> rquickjs::Result<Value> {
    if depth > MAX_DEPTH {
        return Err(rquickjs::Error::new_from_js_message(
            "value",
            "json",
            format!("nested deeper than {} levels (cyclic value?)", MAX_DEPTH),
        ));
    }
    if *budget == 0 {
        return Err(rquickjs::Error::new_from_js_message(
            "value",
            "json",
            format!("more than {} values (cyclic value?)", MAX_VALUES),
        ));
    }
    *budget -= 1;

    match js.type_of() {
        Type::Undefined | Type::Null => Ok(Value::Null),
        Type::Bool => Ok(Value::Bool(js.get()?)),
        Type::Int => {
            let i: i32 = js.get()?;
            Ok(Value::Number(i.into()))
        }
        Type::Float => {
            let f: f64 = js.get()?;
            Ok(Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
        }
        Type::String => Ok(Value::String(js.get()?)),
        Type::Array => {
            let arr: Array = js.get()?;
            let mut values = Vec::with_capacity(arr.len());
            for i in 0..arr.len() {
                let item: JsValue = arr.get(i)?;
                values.push(walk(ctx, item, depth + 1, budget)?);
            }
            Ok(Value::Array(values))
        }
        Type::Object => {
            let obj: Object = js.get()?;
            let mut fields = Map::new();
            for prop in obj.props::<String, JsValue>() {
                let (key, val) = prop?;
                fields.insert(key, walk(ctx, val, depth + 1, budget)?);
            }
            Ok(Value::Object(fields))
        }
        _ => Ok(Value::Null),
    }
}

/// Convert JSON to a JavaScript value
pub fn json_to_js<'js>(ctx: &Ctx<'js>, json: &Value) -> rquickjs::Result<JsValue<'js>> {
    match json {
        Value::Null => Ok(JsValue::new_null(ctx.clone())),
        Value::Bool(b) => Ok(JsValue::new_bool(ctx.clone(), *b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Ok(JsValue::new_int(ctx.clone(), i))
            } else {
                Ok(JsValue::new_float(ctx.clone(), n.as_f64().unwrap_or(f64::NAN)))
            }
        }
        Value::String(s) => s.as_str().into_js(ctx),
        Value::Array(items) => {
            let arr = Array::new(ctx.clone())?;
            for (i, item) in items.iter().enumerate() {
                arr.set(i, json_to_js(ctx, item)?)?;
            }
            Ok(arr.into_value())
        }
        Value::Object(fields) => {
            let obj = Object::new(ctx.clone())?;
            for (key, val) in fields {
                obj.set(key.as_str(), json_to_js(ctx, val)?)?;
            }
            Ok(obj.into_value())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    #[test]
    fn test_round_trip_through_js() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let input = json!({
                "name": "echo",
                "count": 3,
                "ratio": 0.5,
                "big": 10_000_000_000i64,
                "tags": ["a", "b"],
                "nested": {"ok": true, "none": null}
            });
            let js = json_to_js(&ctx, &input).unwrap();
            let back = js_to_json(&ctx, js).unwrap();
            assert_eq!(back, json!({
                "name": "echo",
                "count": 3,
                "ratio": 0.5,
                "big": 10_000_000_000.0,
                "tags": ["a", "b"],
                "nested": {"ok": true, "none": null}
            }));
        });
    }

    #[test]
    fn test_functions_become_null() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let value: JsValue = ctx.eval("({ f: function() {}, n: undefined, s: 'x' })").unwrap();
            let json = js_to_json(&ctx, value).unwrap();
            assert_eq!(json, json!({"f": null, "n": null, "s": "x"}));
        });
    }

    #[test]
    fn test_cyclic_value_is_rejected() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let value: JsValue = ctx.eval("const o = { name: 'loop' }; o.self = o; o").unwrap();
            let err = js_to_json(&ctx, value).unwrap_err();
            assert!(err.to_string().contains("cyclic"), "{}", err);

            let fanned: JsValue = ctx
                .eval("const f = {}; f.a = f; f.b = f; f.c = f; f")
                .unwrap();
            assert!(js_to_json(&ctx, fanned).is_err());
        });
    }
}
