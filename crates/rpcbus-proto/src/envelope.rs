//! Protocol envelopes.
//!
//! The five message kinds (`register`, `call`, `return`, `ack`, `exit`)
//! share one flat JSON shape; which optional fields are present depends on
//! the kind. The broker forwards `call`/`return` envelopes as raw bytes and
//! never re-encodes them.

use crate::format::{ArgFormat, RetFormat};
use crate::value::Value;
use crate::ProtoError;
use serde::{Deserialize, Serialize};

/// Maximum serialized envelope size. A message is never fragmented; one
/// socket read must contain exactly one envelope.
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// The node name the broker uses for envelopes it originates (acks and
/// synthetic call failures).
pub const DAEMON_NODE: &str = "rpcbusd";

/// The envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Api {
    Register,
    Call,
    Return,
    Ack,
    Exit,
}

/// A registered interface as it appears in a `register` envelope.
///
/// `args` and `ret` stay as raw format strings on the wire; [`validate`]
/// parses both and is what the broker runs at registration time.
///
/// [`validate`]: InterfaceDescriptor::validate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceDescriptor {
    #[serde(rename = "if")]
    pub name: String,
    #[serde(rename = "arg")]
    pub args: String,
    #[serde(rename = "ret")]
    pub ret: String,
}

impl InterfaceDescriptor {
    pub fn new(name: &str, args: &str, ret: &str) -> Self {
        Self {
            name: name.to_string(),
            args: args.to_string(),
            ret: ret.to_string(),
        }
    }

    /// Parse both format strings, rejecting malformed descriptors.
    pub fn validate(&self) -> Result<(ArgFormat, RetFormat), ProtoError> {
        Ok((ArgFormat::parse(&self.args)?, RetFormat::parse(&self.ret)?))
    }
}

/// One complete protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub api: Api,
    pub snode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dnode: Option<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ret: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<InterfaceDescriptor>>,
}

impl Envelope {
    /// A `register` envelope advertising a node's interfaces.
    pub fn register(snode: &str, interfaces: Vec<InterfaceDescriptor>) -> Self {
        Self {
            api: Api::Register,
            snode: snode.to_string(),
            dnode: None,
            interface: None,
            args: None,
            ret: None,
            interfaces: Some(interfaces),
        }
    }

    /// A `call` envelope invoking `interface` on `dnode`.
    pub fn call(snode: &str, dnode: &str, interface: &str, args: Vec<Value>) -> Self {
        Self {
            api: Api::Call,
            snode: snode.to_string(),
            dnode: Some(dnode.to_string()),
            interface: Some(interface.to_string()),
            args: Some(args),
            ret: None,
            interfaces: None,
        }
    }

    /// A `return` envelope carrying the result of a reverse call.
    pub fn ret(snode: &str, dnode: &str, interface: &str, value: Value) -> Self {
        Self {
            api: Api::Return,
            snode: snode.to_string(),
            dnode: Some(dnode.to_string()),
            interface: Some(interface.to_string()),
            args: None,
            ret: Some(value),
            interfaces: None,
        }
    }

    /// The broker's registration acknowledgement: `0` on success, `-1` on
    /// any parse failure.
    pub fn ack(dnode: &str, status: i64) -> Self {
        Self {
            api: Api::Ack,
            snode: DAEMON_NODE.to_string(),
            dnode: Some(dnode.to_string()),
            interface: Some("register".to_string()),
            args: None,
            ret: Some(Value::Int(status)),
            interfaces: None,
        }
    }

    /// The broker's synthetic failure for an unroutable `call`: delivered
    /// back to the caller with `ret.val == -1` and no argument array.
    pub fn call_error(dnode: &str, interface: &str) -> Self {
        Self {
            api: Api::Call,
            snode: DAEMON_NODE.to_string(),
            dnode: Some(dnode.to_string()),
            interface: Some(interface.to_string()),
            args: None,
            ret: Some(Value::Int(-1)),
            interfaces: None,
        }
    }

    /// An `exit` envelope asking the broker to drop this node.
    pub fn exit(snode: &str) -> Self {
        Self {
            api: Api::Exit,
            snode: snode.to_string(),
            dnode: None,
            interface: None,
            args: None,
            ret: None,
            interfaces: None,
        }
    }

    /// True for the broker's synthetic call failure: a `call` envelope that
    /// carries a return record but no arguments.
    pub fn is_call_failure(&self) -> bool {
        self.api == Api::Call && self.ret.is_some() && self.args.is_none()
    }

    /// Serialize to wire bytes, enforcing the size limit.
    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(bytes)
    }

    /// Parse one envelope from a received buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_encode_decode() {
        let env = Envelope::call(
            "app_avg",
            "app_sum",
            "add2",
            vec![Value::Int(108), Value::Int(27)],
        );
        let bytes = env.encode().unwrap();
        let back = Envelope::decode(&bytes).unwrap();
        assert_eq!(back, env);
        assert_eq!(back.api, Api::Call);
        assert_eq!(back.interface.as_deref(), Some("add2"));
    }

    #[test]
    fn test_register_wire_field_names() {
        let env = Envelope::register(
            "app_sum",
            vec![InterfaceDescriptor::new("add2", "%d%d", "%d")],
        );
        let json = String::from_utf8(env.encode().unwrap()).unwrap();
        assert!(json.contains(r#""api":"register""#));
        assert!(json.contains(r#""if":"add2""#));
        assert!(json.contains(r#""arg":"%d%d""#));
        assert!(json.contains(r#""ret":"%d""#));
        assert!(!json.contains("dnode"));
    }

    #[test]
    fn test_ack_shape() {
        let env = Envelope::ack("app_sum", 0);
        assert_eq!(env.snode, DAEMON_NODE);
        assert_eq!(env.ret, Some(Value::Int(0)));
        let json = String::from_utf8(env.encode().unwrap()).unwrap();
        assert!(json.contains(r#""api":"ack""#));
        assert!(json.contains(r#""if":"register""#));
    }

    #[test]
    fn test_call_failure_detection() {
        let err = Envelope::call_error("app_avg", "add2");
        assert!(err.is_call_failure());
        assert_eq!(err.ret, Some(Value::Int(-1)));

        let real = Envelope::call("a", "b", "add2", vec![Value::Int(1)]);
        assert!(!real.is_call_failure());
    }

    #[test]
    fn test_return_keyword_api() {
        // "return" is a keyword; make sure the serde rename holds.
        let env = Envelope::ret("app_sum", "app_avg", "add2", Value::Int(135));
        let json = String::from_utf8(env.encode().unwrap()).unwrap();
        assert!(json.contains(r#""api":"return""#));
        let back = Envelope::decode(json.as_bytes()).unwrap();
        assert_eq!(back.api, Api::Return);
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let big = "x".repeat(MAX_MESSAGE_SIZE);
        let env = Envelope::call("a", "b", "f", vec![Value::Str(big)]);
        match env.encode() {
            Err(ProtoError::MessageTooLarge { size, max }) => {
                assert!(size > max);
                assert_eq!(max, MAX_MESSAGE_SIZE);
            }
            other => panic!("expected MessageTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_garbage() {
        assert!(Envelope::decode(b"not json").is_err());
        assert!(Envelope::decode(br#"{"api":"bogus","snode":"x"}"#).is_err());
    }
}
