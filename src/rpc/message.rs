//! Logical message model shared by every msgpack-rpc frame.
//!
//! All three message kinds share one envelope: a msgpack array whose first
//! element is an integer type tag.
//!
//! | Tag | Kind         | Layout                         |
//! |-----|--------------|--------------------------------|
//! | 0   | Request      | `[0, id, method, args]`        |
//! | 1   | Response     | `[1, id, error, result]`       |
//! | 2   | Notification | `[2, name, args]`              |

use rmpv::Value;
use thiserror::Error;

use crate::error::Error;

/// Wire tag for [`Request`].
pub const REQUEST_TAG: u64 = 0;
/// Wire tag for [`Response`].
pub const RESPONSE_TAG: u64 = 1;
/// Wire tag for [`Notification`].
pub const NOTIFICATION_TAG: u64 = 2;

/// Category of an error reported by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic failure raised while executing the call (`0`).
    Exception,
    /// The call was rejected before execution, e.g. bad arguments (`1`).
    Validation,
    /// Any other peer-defined category.
    Other(i64),
}

impl ErrorKind {
    /// Integer identifier used on the wire.
    pub fn id(self) -> i64 {
        match self {
            Self::Exception => 0,
            Self::Validation => 1,
            Self::Other(n) => n,
        }
    }
}

impl From<i64> for ErrorKind {
    fn from(id: i64) -> Self {
        match id {
            0 => Self::Exception,
            1 => Self::Validation,
            n => Self::Other(n),
        }
    }
}

/// Application-level error carried inside a [`Response`].
///
/// This is not a transport fault: the peer understood the request and chose
/// to report a failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} error: {message}")]
pub struct RpcError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RpcError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an [`ErrorKind::Exception`] error.
    pub fn exception(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exception, message)
    }

    /// Shorthand for an [`ErrorKind::Validation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Encodes as `[kind_id, message]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.kind.id()),
            Value::from(self.message.as_str()),
        ])
    }

    /// Decodes the `error` slot of a response frame. `nil` means no error.
    ///
    /// Peers that report a bare string instead of `[kind, message]` are
    /// accepted as [`ErrorKind::Exception`].
    pub fn from_value(value: Value) -> Result<Option<Self>, Error> {
        match value {
            Value::Nil => Ok(None),
            Value::String(s) => Ok(Some(Self::exception(utf8(s, "error message")?))),
            Value::Array(parts) if parts.len() == 2 => {
                let mut parts = parts.into_iter();
                let kind = parts
                    .next()
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| Error::Codec("error kind is not an integer".to_string()))?;
                let message = match parts.next() {
                    Some(Value::String(s)) => utf8(s, "error message")?,
                    other => {
                        return Err(Error::Codec(format!(
                            "error message is not a string: {other:?}"
                        )))
                    }
                };
                Ok(Some(Self::new(ErrorKind::from(kind), message)))
            }
            other => Err(Error::Codec(format!("unrecognized error value: {other}"))),
        }
    }
}

/// A call that expects a [`Response`] with the same `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: u64,
    pub method: String,
    pub args: Vec<Value>,
}

/// The answer to a [`Request`]. `result` is `nil` when absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: u64,
    pub error: Option<RpcError>,
    pub result: Value,
}

impl Response {
    /// A successful response carrying `result`.
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            error: None,
            result,
        }
    }

    /// A failed response carrying `error` and a `nil` result.
    pub fn err(id: u64, error: RpcError) -> Self {
        Self {
            id,
            error: Some(error),
            result: Value::Nil,
        }
    }

    /// Converts into `Ok(result)` or `Err(error)`.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}

/// A fire-and-forget event; never answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub name: String,
    pub args: Vec<Value>,
}

impl Notification {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// One msgpack-rpc message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Human-readable kind, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Notification(_) => "notification",
        }
    }

    /// Builds the tagged wire array.
    pub fn into_value(self) -> Value {
        match self {
            Self::Request(req) => Value::Array(vec![
                Value::from(REQUEST_TAG),
                Value::from(req.id),
                Value::from(req.method),
                Value::Array(req.args),
            ]),
            Self::Response(resp) => Value::Array(vec![
                Value::from(RESPONSE_TAG),
                Value::from(resp.id),
                resp.error.as_ref().map_or(Value::Nil, RpcError::to_value),
                resp.result,
            ]),
            Self::Notification(note) => Value::Array(vec![
                Value::from(NOTIFICATION_TAG),
                Value::from(note.name),
                Value::Array(note.args),
            ]),
        }
    }

    /// Classifies and decodes a generic value into a message.
    ///
    /// Returns [`Error::MalformedFrame`] when the envelope itself is wrong
    /// (not an array, unknown tag, wrong arity) and [`Error::Codec`] when the
    /// envelope is fine but a field has the wrong type.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(Error::MalformedFrame(format!(
                    "expected array, got {other}"
                )))
            }
        };

        let tag = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::MalformedFrame("missing integer type tag".to_string()))?;

        let arity = match tag {
            REQUEST_TAG | RESPONSE_TAG => 4,
            NOTIFICATION_TAG => 3,
            other => return Err(Error::MalformedFrame(format!("unknown type tag {other}"))),
        };
        if items.len() != arity {
            return Err(Error::MalformedFrame(format!(
                "tag {tag} requires {arity} elements, got {}",
                items.len()
            )));
        }

        // Strip the tag and decode the remainder.
        let mut fields = items.into_iter().skip(1);
        let mut next = || fields.next().unwrap_or(Value::Nil);

        match tag {
            REQUEST_TAG => Ok(Self::Request(Request {
                id: msgid(next())?,
                method: string(next(), "method")?,
                args: array(next(), "args")?,
            })),
            RESPONSE_TAG => Ok(Self::Response(Response {
                id: msgid(next())?,
                error: RpcError::from_value(next())?,
                result: next(),
            })),
            _ => Ok(Self::Notification(Notification {
                name: string(next(), "name")?,
                args: array(next(), "args")?,
            })),
        }
    }
}

impl From<Request> for Message {
    fn from(req: Request) -> Self {
        Self::Request(req)
    }
}

impl From<Response> for Message {
    fn from(resp: Response) -> Self {
        Self::Response(resp)
    }
}

impl From<Notification> for Message {
    fn from(note: Notification) -> Self {
        Self::Notification(note)
    }
}

/// A request that has not been assigned an id yet.
///
/// The id is only known once the streamer decides to send, so callers hand
/// over a builder rather than a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBuilder {
    method: String,
    args: Vec<Value>,
}

impl RequestBuilder {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            args: Vec::new(),
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Appends every argument of `values`.
    pub fn args<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.args.extend(values.into_iter().map(Into::into));
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Finalizes the request with its correlation id.
    pub fn build(self, id: u64) -> Request {
        Request {
            id,
            method: self.method,
            args: self.args,
        }
    }
}

fn msgid(value: Value) -> Result<u64, Error> {
    value
        .as_u64()
        .ok_or_else(|| Error::Codec(format!("message id is not an unsigned integer: {value}")))
}

fn string(value: Value, field: &str) -> Result<String, Error> {
    match value {
        Value::String(s) => utf8(s, field),
        // Some peers send names as raw bytes.
        Value::Binary(bytes) => String::from_utf8(bytes)
            .map_err(|e| Error::Codec(format!("{field} is not valid UTF-8: {e}"))),
        other => Err(Error::Codec(format!("{field} is not a string: {other}"))),
    }
}

fn utf8(s: rmpv::Utf8String, field: &str) -> Result<String, Error> {
    s.into_str()
        .ok_or_else(|| Error::Codec(format!("{field} is not valid UTF-8")))
}

fn array(value: Value, field: &str) -> Result<Vec<Value>, Error> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::Codec(format!("{field} is not an array: {other}"))),
    }
}
