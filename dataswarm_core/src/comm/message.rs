//! JSON-RPC 2.0 envelopes exchanged between manager, workers and clients.

use serde_json::{Map, Value};

use super::result::ResultCode;
use crate::errors::Result;
use crate::mq::Connection;

pub const JSONRPC_VERSION: &str = "2.0";

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request {
        id: i64,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: i64,
        result: Value,
    },
    Error {
        id: i64,
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl Envelope {
    pub fn method(&self) -> Option<&str> {
        match *self {
            Envelope::Request { ref method, .. } | Envelope::Notification { ref method, .. } => {
                Some(method)
            }
            _ => None,
        }
    }

    pub fn id(&self) -> Option<i64> {
        match *self {
            Envelope::Request { id, .. }
            | Envelope::Response { id, .. }
            | Envelope::Error { id, .. } => Some(id),
            Envelope::Notification { .. } => None,
        }
    }
}

pub fn notification(method: &str, params: Value) -> Value {
    debug_assert!(params.is_object() || params.is_array() || params.is_null());
    let mut out = Map::new();
    out.insert("jsonrpc".into(), JSONRPC_VERSION.into());
    out.insert("method".into(), method.into());
    if !params.is_null() {
        out.insert("params".into(), params);
    }
    Value::Object(out)
}

pub fn request(method: &str, params: Value, id: i64) -> Value {
    let mut out = notification(method, params);
    out["id"] = id.into();
    out
}

/// Success responses carry `data` as the result (the integer code if absent);
/// failures carry an error object with the code, its text and optional data.
pub fn response(id: i64, code: ResultCode, data: Option<Value>) -> Value {
    if code.is_success() {
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "result": data.unwrap_or_else(|| code.code().into()),
        })
    } else {
        let mut error = json!({
            "code": code.code(),
            "message": code.as_str(),
        });
        if let Some(data) = data {
            error["data"] = data;
        }
        json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": error,
        })
    }
}

pub fn encode(msg: &Value) -> Vec<u8> {
    msg.to_string().into_bytes()
}

/// Parse and classify a message. Failures are reported as the code an error response
/// to the message would carry.
pub fn decode(bytes: &[u8]) -> ::std::result::Result<Envelope, ResultCode> {
    let value: Value = ::serde_json::from_slice(bytes).map_err(|_| ResultCode::BadMessage)?;
    classify(value)
}

pub fn classify(value: Value) -> ::std::result::Result<Envelope, ResultCode> {
    let obj = match value {
        Value::Object(obj) => obj,
        _ => return Err(ResultCode::BadMessage),
    };

    let mut has_version = false;
    let mut id = None;
    let mut method = None;
    let mut params = None;
    let mut result = None;
    let mut error = None;

    for (key, v) in obj {
        match key.as_str() {
            "jsonrpc" => {
                if v.as_str() != Some(JSONRPC_VERSION) {
                    return Err(ResultCode::BadMessage);
                }
                has_version = true;
            }
            "id" => id = Some(v.as_i64().ok_or(ResultCode::BadId)?),
            "method" => match v {
                Value::String(m) => method = Some(m),
                _ => return Err(ResultCode::BadMethod),
            },
            "params" => {
                if !v.is_object() && !v.is_array() {
                    return Err(ResultCode::BadParams);
                }
                params = Some(v);
            }
            "result" => result = Some(v),
            "error" => {
                if !v.is_object() {
                    return Err(ResultCode::BadMessage);
                }
                error = Some(v);
            }
            _ => return Err(ResultCode::BadMessage),
        }
    }
    if !has_version {
        return Err(ResultCode::BadMessage);
    }

    match (method, result, error) {
        (Some(method), None, None) => {
            let params = params.unwrap_or_else(|| Value::Object(Map::new()));
            Ok(match id {
                Some(id) => Envelope::Request { id, method, params },
                None => Envelope::Notification { method, params },
            })
        }
        (None, Some(result), None) if params.is_none() => Ok(Envelope::Response {
            id: id.ok_or(ResultCode::BadId)?,
            result,
        }),
        (None, None, Some(error)) if params.is_none() => {
            let id = id.ok_or(ResultCode::BadId)?;
            unpack_error(id, error)
        }
        _ => Err(ResultCode::BadMessage),
    }
}

fn unpack_error(id: i64, error: Value) -> ::std::result::Result<Envelope, ResultCode> {
    let obj = match error {
        Value::Object(obj) => obj,
        _ => return Err(ResultCode::BadMessage),
    };
    let mut code = None;
    let mut message = None;
    let mut data = None;
    for (key, v) in obj {
        match key.as_str() {
            "code" => code = v.as_i64(),
            "message" => message = v.as_str().map(String::from),
            "data" => data = Some(v),
            _ => return Err(ResultCode::BadMessage),
        }
    }
    match (code, message) {
        (Some(code), Some(message)) => Ok(Envelope::Error {
            id,
            code,
            message,
            data,
        }),
        _ => Err(ResultCode::BadMessage),
    }
}

/// Serialize `msg` and queue it on `conn`.
pub fn send_json<T>(conn: &mut Connection<T>, msg: &Value) -> Result<()> {
    let text = msg.to_string();
    debug!("json tx: {}", text);
    conn.send_buffer(text.into_bytes(), 0)
}

pub fn param_str<'a>(params: &'a Value, key: &str) -> ::std::result::Result<&'a str, ResultCode> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or(ResultCode::BadParams)
}

pub fn param_u64(params: &Value, key: &str) -> ::std::result::Result<u64, ResultCode> {
    params
        .get(key)
        .and_then(Value::as_u64)
        .ok_or(ResultCode::BadParams)
}

/// Deserialize one field of the params into `D`.
pub fn param_parse<D>(params: &Value, key: &str) -> ::std::result::Result<D, ResultCode>
where
    for<'de> D: ::serde::de::Deserialize<'de>,
{
    let v = params.get(key).ok_or(ResultCode::BadParams)?;
    ::serde_json::from_value(v.clone()).map_err(|_| ResultCode::BadParams)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shape() {
        let msg = request("blob-create", json!({"blob-id": "x", "size": 10}), 7);
        assert_eq!(msg["jsonrpc"], "2.0");
        assert_eq!(msg["id"], 7);
        assert_eq!(
            decode(&encode(&msg)),
            Ok(Envelope::Request {
                id: 7,
                method: "blob-create".into(),
                params: json!({"blob-id": "x", "size": 10}),
            })
        );
    }

    #[test]
    fn notification_without_params() {
        let msg = notification("status-report", Value::Null);
        assert!(msg.get("params").is_none());
        match decode(&encode(&msg)).unwrap() {
            Envelope::Notification { method, params } => {
                assert_eq!(method, "status-report");
                assert_eq!(params, json!({}));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn responses() {
        let ok = response(3, ResultCode::Success, None);
        assert_eq!(ok["result"], 0);
        assert_eq!(
            classify(ok).unwrap(),
            Envelope::Response {
                id: 3,
                result: json!(0)
            }
        );

        let err = response(4, ResultCode::NoSuchBlobId, Some(json!({"blob-id": "q"})));
        assert_eq!(err["error"]["message"], "requested blob-id does not exist");
        match classify(err).unwrap() {
            Envelope::Error { id, code, data, .. } => {
                assert_eq!(id, 4);
                assert_eq!(code, 6);
                assert_eq!(data, Some(json!({"blob-id": "q"})));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed() {
        assert_eq!(decode(b"not json"), Err(ResultCode::BadMessage));
        assert_eq!(decode(b"[1,2]"), Err(ResultCode::BadMessage));
        assert_eq!(
            classify(json!({"method": "x"})),
            Err(ResultCode::BadMessage)
        );
        assert_eq!(
            classify(json!({"jsonrpc": "1.0", "method": "x"})),
            Err(ResultCode::BadMessage)
        );
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "method": "x", "id": "a"})),
            Err(ResultCode::BadId)
        );
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "method": 5})),
            Err(ResultCode::BadMethod)
        );
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "method": "x", "params": 3})),
            Err(ResultCode::BadParams)
        );
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "method": "x", "extra": 1})),
            Err(ResultCode::BadMessage)
        );
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "result": 0})),
            Err(ResultCode::BadId)
        );
        assert_eq!(
            classify(json!({"jsonrpc": "2.0", "id": 1, "error": {"code": 1}})),
            Err(ResultCode::BadMessage)
        );
    }

    #[test]
    fn params_helpers() {
        let p = json!({"blob-id": "b", "size": 12, "flags": ["x"]});
        assert_eq!(param_str(&p, "blob-id"), Ok("b"));
        assert_eq!(param_str(&p, "size"), Err(ResultCode::BadParams));
        assert_eq!(param_u64(&p, "size"), Ok(12));
        let flags: Vec<String> = param_parse(&p, "flags").unwrap();
        assert_eq!(flags, vec!["x".to_string()]);
        assert!(param_parse::<Vec<u32>>(&p, "flags").is_err());
    }
}
