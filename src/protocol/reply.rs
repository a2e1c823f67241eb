use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, RpcError};

const TAG_OK: u8 = b'+';
const TAG_ERR: u8 = b'-';

/// Outcome of one executed call, as pushed onto a rendezvous list.
///
/// Framed as a single tag byte followed by the body:
///
/// - `+<payload>`: handler succeeded, body is the encoded result
/// - `-<utf-8 text>`: handler failed, body is the error message
///
/// Carrying failures in-band lets a waiting caller tell "the handler said
/// no" ([`RpcError::Remote`]) apart from "nobody answered"
/// ([`RpcError::Timeout`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Encoded handler result.
    Ok(Bytes),
    /// Handler error text.
    Err(String),
}

impl Reply {
    // ---
    /// Build a reply from a handler outcome.
    pub fn from_result(result: Result<Bytes>) -> Self {
        match result {
            Ok(bytes) => Reply::Ok(bytes),
            Err(err) => Reply::Err(err.to_string()),
        }
    }

    /// Frame the reply for the broker.
    pub fn encode(&self) -> Bytes {
        // ---
        match self {
            Reply::Ok(payload) => {
                let mut buf = BytesMut::with_capacity(payload.len() + 1);
                buf.put_u8(TAG_OK);
                buf.put_slice(payload);
                buf.freeze()
            }
            Reply::Err(text) => {
                let mut buf = BytesMut::with_capacity(text.len() + 1);
                buf.put_u8(TAG_ERR);
                buf.put_slice(text.as_bytes());
                buf.freeze()
            }
        }
    }

    /// Parse a framed reply.
    pub fn decode(mut raw: Bytes) -> Result<Self> {
        // ---
        if raw.is_empty() {
            return Err(RpcError::Transport("empty reply frame".into()));
        }
        let tag = raw[0];
        let body = raw.split_off(1);

        match tag {
            TAG_OK => Ok(Reply::Ok(body)),
            TAG_ERR => Ok(Reply::Err(String::from_utf8_lossy(&body).into_owned())),
            other => Err(RpcError::Transport(format!(
                "unknown reply tag 0x{other:02x}"
            ))),
        }
    }

    /// Turn the reply into the caller-facing result.
    pub fn into_result(self) -> Result<Bytes> {
        match self {
            Reply::Ok(bytes) => Ok(bytes),
            Reply::Err(text) => Err(RpcError::Remote(text)),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_error_reply_surfaces_as_remote() {
        // ---
        let reply = Reply::from_result(Err(RpcError::Handler("n must be positive".into())));
        let decoded = Reply::decode(reply.encode()).unwrap();

        match decoded.into_result() {
            Err(RpcError::Remote(text)) => assert!(text.contains("n must be positive")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_empty_ok_payload_is_valid() {
        // ---
        let decoded = Reply::decode(Reply::Ok(Bytes::new()).encode()).unwrap();
        assert_eq!(decoded, Reply::Ok(Bytes::new()));
    }

    #[test]
    fn test_rejects_garbage() {
        // ---
        assert!(Reply::decode(Bytes::new()).is_err());
        assert!(Reply::decode(Bytes::from_static(b"?x")).is_err());
    }
}
