//! JSON ⇄ msgpack value conversion for the command line.

use rmpv::Value as MsgValue;
use serde_json::{Map, Number, Value};

/// Converts a JSON value to msgpack. Integral numbers stay integers.
pub fn json_to_msgpack(value: &Value) -> MsgValue {
    match value {
        Value::Null => MsgValue::Nil,
        Value::Bool(v) => MsgValue::Boolean(*v),
        Value::Number(v) => {
            if let Some(i) = v.as_i64() {
                MsgValue::from(i)
            } else if let Some(u) = v.as_u64() {
                MsgValue::from(u)
            } else {
                MsgValue::F64(v.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(v) => MsgValue::from(v.as_str()),
        Value::Array(v) => MsgValue::Array(v.iter().map(json_to_msgpack).collect()),
        Value::Object(v) => MsgValue::Map(
            v.iter()
                .map(|(k, v)| (MsgValue::from(k.as_str()), json_to_msgpack(v)))
                .collect(),
        ),
    }
}

/// Converts a msgpack value to JSON.
///
/// Binary becomes an array of bytes, non-string map keys are rendered as
/// their JSON text, and extension values (Neovim buffer, window and tabpage
/// handles) become `{"ext": <type>, "data": [..]}`.
pub fn msgpack_to_json(value: &MsgValue) -> Value {
    match value {
        MsgValue::Nil => Value::Null,
        MsgValue::Boolean(v) => Value::Bool(*v),
        MsgValue::Integer(v) => v
            .as_i64()
            .map(Number::from)
            .or_else(|| v.as_u64().map(Number::from))
            .map_or(Value::Null, Value::Number),
        MsgValue::F32(v) => float(f64::from(*v)),
        MsgValue::F64(v) => float(*v),
        MsgValue::String(v) => Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        MsgValue::Binary(v) => bytes(v),
        MsgValue::Array(v) => Value::Array(v.iter().map(msgpack_to_json).collect()),
        MsgValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (map_key(k), msgpack_to_json(v)))
                .collect::<Map<_, _>>(),
        ),
        MsgValue::Ext(kind, data) => {
            let mut object = Map::new();
            object.insert("ext".to_string(), Value::from(*kind));
            object.insert("data".to_string(), bytes(data));
            Value::Object(object)
        }
    }
}

/// Parses a command-line argument as JSON, falling back to a plain string.
pub fn parse_arg(arg: &str) -> MsgValue {
    match serde_json::from_str::<Value>(arg) {
        Ok(json) => json_to_msgpack(&json),
        Err(_) => MsgValue::from(arg),
    }
}

fn float(v: f64) -> Value {
    Number::from_f64(v).map_or(Value::Null, Value::Number)
}

fn bytes(data: &[u8]) -> Value {
    Value::Array(data.iter().map(|b| Value::from(*b)).collect())
}

fn map_key(key: &MsgValue) -> String {
    match key.as_str() {
        Some(s) => s.to_string(),
        None => msgpack_to_json(key).to_string(),
    }
}
