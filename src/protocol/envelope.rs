//! Array-encoded wire envelope.
//!
//! Every frame is a JSON array. Requests carry `[type, id, name, ...params]`,
//! responses `[type, id, result]` or `[type, id, code, description, details]`,
//! and pushes `[type, id, name, filter, data]`. The envelope is deliberately
//! codec-agnostic beyond this shape: transports move opaque byte frames, and
//! this module is the only place that interprets them.

use bytes::Bytes;
use serde_json::Value;

use crate::error::{ErrorBody, Result, RpcError};

/// Wire type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Invoke a named item and await its result.
    Call = 2,
    /// Successful response to a `Call`, `Get`, `Subscribe` or `Unsubscribe`.
    Result = 3,
    /// Failure response; carries code, description and optional details.
    Error = 4,
    /// Register interest in an item's value for a given filter.
    Subscribe = 11,
    /// Withdraw interest.
    Unsubscribe = 12,
    /// Server-initiated push carrying a fresh value for `(item, filter)`.
    Data = 13,
    /// One-shot fetch of an item's value for a filter, without subscribing.
    Get = 14,
}

impl MessageType {
    fn from_code(code: u64) -> Option<Self> {
        match code {
            2 => Some(Self::Call),
            3 => Some(Self::Result),
            4 => Some(Self::Error),
            11 => Some(Self::Subscribe),
            12 => Some(Self::Unsubscribe),
            13 => Some(Self::Data),
            14 => Some(Self::Get),
            _ => None,
        }
    }
}

/// One decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call {
        id: u64,
        name: String,
        params: Vec<Value>,
    },
    Get {
        id: u64,
        name: String,
        params: Vec<Value>,
    },
    Subscribe {
        id: u64,
        name: String,
        filter: Value,
    },
    Unsubscribe {
        id: u64,
        name: String,
        filter: Value,
    },
    Result {
        id: u64,
        data: Value,
    },
    Error {
        id: u64,
        body: ErrorBody,
    },
    Data {
        name: String,
        filter: Value,
        data: Value,
    },
}

impl Envelope {
    /// Encode the envelope into a wire frame.
    pub fn encode(&self) -> Result<Bytes> {
        let array = match self {
            Envelope::Call { id, name, params } => {
                request_array(MessageType::Call, *id, name, params)
            }
            Envelope::Get { id, name, params } => {
                request_array(MessageType::Get, *id, name, params)
            }
            Envelope::Subscribe { id, name, filter } => request_array(
                MessageType::Subscribe,
                *id,
                name,
                std::slice::from_ref(filter),
            ),
            Envelope::Unsubscribe { id, name, filter } => request_array(
                MessageType::Unsubscribe,
                *id,
                name,
                std::slice::from_ref(filter),
            ),
            Envelope::Result { id, data } => vec![
                Value::from(MessageType::Result as u8),
                Value::from(*id),
                data.clone(),
            ],
            Envelope::Error { id, body } => vec![
                Value::from(MessageType::Error as u8),
                Value::from(*id),
                Value::from(body.code),
                Value::from(body.message.clone()),
                body.details.clone().unwrap_or(Value::Null),
            ],
            Envelope::Data { name, filter, data } => vec![
                Value::from(MessageType::Data as u8),
                Value::from(0u64),
                Value::from(name.clone()),
                filter.clone(),
                data.clone(),
            ],
        };

        let bytes = serde_json::to_vec(&Value::Array(array))?;
        Ok(Bytes::from(bytes))
    }

    /// Decode a wire frame.
    ///
    /// Any malformation (not an array, unknown type code, missing fields)
    /// yields [`RpcError::ProtocolDecode`]; callers log and drop the single
    /// frame without closing the connection.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(frame)
            .map_err(|e| RpcError::ProtocolDecode(format!("invalid JSON: {e}")))?;

        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(RpcError::ProtocolDecode(format!(
                    "expected array frame, got {other}"
                )))
            }
        };

        if items.len() < 2 {
            return Err(RpcError::ProtocolDecode(format!(
                "frame too short: {} element(s)",
                items.len()
            )));
        }

        let code = items[0]
            .as_u64()
            .ok_or_else(|| RpcError::ProtocolDecode("type code is not a number".into()))?;
        let msg_type = MessageType::from_code(code)
            .ok_or_else(|| RpcError::ProtocolDecode(format!("unknown type code {code}")))?;
        let id = items[1]
            .as_u64()
            .ok_or_else(|| RpcError::ProtocolDecode("message id is not a number".into()))?;

        let mut rest = items.into_iter().skip(2);

        match msg_type {
            MessageType::Call | MessageType::Get => {
                let name = decode_name(rest.next())?;
                let params: Vec<Value> = rest.collect();
                if msg_type == MessageType::Call {
                    Ok(Envelope::Call { id, name, params })
                } else {
                    Ok(Envelope::Get { id, name, params })
                }
            }
            MessageType::Subscribe | MessageType::Unsubscribe => {
                let name = decode_name(rest.next())?;
                let filter = rest.next().unwrap_or(Value::Null);
                if msg_type == MessageType::Subscribe {
                    Ok(Envelope::Subscribe { id, name, filter })
                } else {
                    Ok(Envelope::Unsubscribe { id, name, filter })
                }
            }
            MessageType::Result => Ok(Envelope::Result {
                id,
                data: rest.next().unwrap_or(Value::Null),
            }),
            MessageType::Error => {
                let code = rest
                    .next()
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| RpcError::ProtocolDecode("error code missing".into()))?;
                let message = rest
                    .next()
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_default();
                let details = match rest.next() {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(v),
                };
                Ok(Envelope::Error {
                    id,
                    body: ErrorBody {
                        code: code.min(u16::MAX as u64) as u16,
                        message,
                        details,
                    },
                })
            }
            MessageType::Data => {
                let name = decode_name(rest.next())?;
                let filter = rest.next().unwrap_or(Value::Null);
                let data = rest.next().unwrap_or(Value::Null);
                Ok(Envelope::Data { name, filter, data })
            }
        }
    }
}

fn request_array(msg_type: MessageType, id: u64, name: &str, params: &[Value]) -> Vec<Value> {
    let mut array = Vec::with_capacity(3 + params.len());
    array.push(Value::from(msg_type as u8));
    array.push(Value::from(id));
    array.push(Value::from(name));
    array.extend(params.iter().cloned());
    array
}

fn decode_name(value: Option<Value>) -> Result<String> {
    match value {
        Some(Value::String(name)) => Ok(name),
        other => Err(RpcError::ProtocolDecode(format!(
            "item name missing or not a string: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_frame_shape() {
        // ---
        let env = Envelope::Call {
            id: 7,
            name: "math/add".into(),
            params: vec![json!(2), json!(3)],
        };
        let frame = env.encode().unwrap();

        let raw: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(raw, json!([2, 7, "math/add", 2, 3]));

        assert_eq!(Envelope::decode(&frame).unwrap(), env);
    }

    #[test]
    fn test_error_frame_preserves_details() {
        // ---
        let env = Envelope::Error {
            id: 3,
            body: ErrorBody {
                code: 422,
                message: "bad input".into(),
                details: Some(json!({"field": "name"})),
            },
        };
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_data_frame_carries_filter_and_value() {
        // ---
        let env = Envelope::Data {
            name: "todo/list".into(),
            filter: json!({"user": "u1"}),
            data: json!([{"id": 1}]),
        };
        let frame = env.encode().unwrap();
        let raw: Value = serde_json::from_slice(&frame).unwrap();
        assert_eq!(raw[0], json!(13));
        assert_eq!(Envelope::decode(&frame).unwrap(), env);
    }

    #[test]
    fn test_malformed_frames_are_decode_errors() {
        // ---
        for frame in [
            &b"not json"[..],
            br#"{"type": 2}"#,
            br#"[2]"#,
            br#"[99, 1, "x"]"#,
            br#"[2, 1, 42]"#,
        ] {
            assert!(matches!(
                Envelope::decode(frame),
                Err(RpcError::ProtocolDecode(_))
            ));
        }
    }
}
