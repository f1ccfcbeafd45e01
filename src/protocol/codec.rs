use crate::error::Error;
use crate::types::Value;
use bytes::{Bytes, BytesMut};
use bytes_utils::Str;
use redis_protocol::resp2::decode::decode as resp2_decode;
use redis_protocol::resp2::types::Frame as Resp2Frame;
use tokio_util::codec::Decoder;

/// Streaming RESP2 decoder for the read half of the socket.
///
/// This is the seam to the response parser: everything below it comes from
/// `redis-protocol`. Errors surfaced through `decode` are hard errors that
/// invalidate the session; an `Error` frame decoded successfully is a soft,
/// per-request error and flows through [frame_to_value].
pub struct RespCodec {
  pub addr: String,
}

impl Decoder for RespCodec {
  type Item = Resp2Frame;
  type Error = Error;

  fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Resp2Frame>, Error> {
    if src.is_empty() {
      return Ok(None);
    }

    let buf = src.clone().freeze();
    if let Some((frame, amt)) = resp2_decode(&buf)? {
      trace!("{}: parsed {} byte frame", self.addr, amt);
      let _ = src.split_to(amt);
      Ok(Some(frame))
    } else {
      Ok(None)
    }
  }
}

/// Convert a decoded frame into the value delivered to a callback.
///
/// A top-level `Error` frame becomes a soft error result. Error frames nested
/// inside arrays (per-command failures in an EXEC reply) stay embedded as
/// [Value::Error] elements.
pub fn frame_to_value(frame: Resp2Frame) -> Result<Value, Error> {
  Ok(match frame {
    Resp2Frame::SimpleString(s) => {
      Value::String(Str::from(String::from_utf8_lossy(&s).into_owned()))
    },
    Resp2Frame::Error(message) => return Err(Error::server(message.to_string())),
    Resp2Frame::Integer(i) => Value::Integer(i),
    Resp2Frame::BulkString(b) => Value::Bytes(Bytes::from(b)),
    Resp2Frame::Null => Value::Null,
    Resp2Frame::Array(frames) => Value::Array(frames.into_iter().map(nested_value).collect()),
  })
}

fn nested_value(frame: Resp2Frame) -> Value {
  match frame_to_value(frame) {
    Ok(value) => value,
    Err(error) => Value::Error(error),
  }
}
