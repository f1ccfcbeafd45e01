use crate::error::{Error, ErrorCode, ErrorKind};
use crate::types::Value;
use bytes::{Bytes, BytesMut};
use bytes_utils::Str;
use std::borrow::Cow;
use std::fmt::Write;

/// A single Redis command and its arguments.
///
/// A command name containing a space, such as `CLIENT LIST`, is split at the
/// first space into two bulk strings when serialized.
#[derive(Clone, Debug)]
pub struct Request {
  cmd: Str,
  args: Vec<Value>,
}

impl Request {
  pub fn new<C: Into<Str>>(cmd: C, args: Vec<Value>) -> Request {
    Request {
      cmd: cmd.into(),
      args,
    }
  }

  pub fn cmd(&self) -> &str {
    &self.cmd
  }

  pub fn args(&self) -> &[Value] {
    &self.args
  }
}

/// The payload bytes one argument contributes to its bulk string, without
/// framing. `None` marks an argument that cannot be serialized.
///
/// Both the serializer and the routing-key projection go through this
/// function, so a change to any textual rendering stays consistent between
/// the wire format and cluster key routing.
fn arg_payload(arg: &Value) -> Option<Cow<'_, [u8]>> {
  match *arg {
    Value::String(ref s) => Some(Cow::Borrowed(s.as_bytes())),
    Value::Bytes(ref b) => Some(Cow::Borrowed(&b[..])),
    Value::Integer(i) => Some(Cow::Owned(i.to_string().into_bytes())),
    Value::Double(f) => Some(Cow::Owned(f.to_string().into_bytes())),
    Value::Boolean(true) => Some(Cow::Borrowed(&b"1"[..])),
    Value::Boolean(false) => Some(Cow::Borrowed(&b"0"[..])),
    Value::Null => Some(Cow::Borrowed(&b""[..])),
    Value::Array(_) | Value::Error(_) => None,
  }
}

/// Convert a single argument to the exact bytes the serializer would place
/// inside its bulk string. Layers above use this to compute cluster routing
/// keys, so it must stay bit-identical with [append_request].
pub fn arg_to_key(arg: &Value) -> Option<Bytes> {
  match *arg {
    Value::String(ref s) => Some(s.clone().into_inner()),
    Value::Bytes(ref b) => Some(b.clone()),
    ref other => arg_payload(other).map(|payload| match payload {
      Cow::Borrowed(b) => Bytes::copy_from_slice(b),
      Cow::Owned(v) => Bytes::from(v),
    }),
  }
}

fn argument_type_error(arg: &Value, req: &Request) -> Error {
  Error::new(ErrorKind::Request, ErrorCode::ArgumentType)
    .with("argument", arg.type_name())
    .with("request", req.cmd())
}

/// Verify that every argument of a request can be serialized.
///
/// The submit paths call this before enqueueing so a malformed request is
/// rejected without ever reaching the writer.
pub(crate) fn check_args(req: &Request) -> Result<(), Error> {
  for arg in req.args() {
    if arg_payload(arg).is_none() {
      return Err(argument_type_error(arg, req));
    }
  }
  Ok(())
}

fn write_bulk(buf: &mut BytesMut, payload: &[u8]) {
  let _ = write!(buf, "${}\r\n", payload.len());
  buf.extend_from_slice(payload);
  buf.extend_from_slice(b"\r\n");
}

/// Serialize a request onto the end of `buf` as a RESP array of bulk strings.
///
/// On failure the buffer is restored to its prior length so one malformed
/// request never corrupts a packet that already holds serialized neighbors.
pub(crate) fn append_request(buf: &mut BytesMut, req: &Request) -> Result<(), Error> {
  let checkpoint = buf.len();
  let cmd = req.cmd();

  match cmd.find(' ') {
    None => {
      let _ = write!(buf, "*{}\r\n", req.args.len() + 1);
      write_bulk(buf, cmd.as_bytes());
    },
    Some(space) => {
      let _ = write!(buf, "*{}\r\n", req.args.len() + 2);
      write_bulk(buf, cmd[..space].as_bytes());
      write_bulk(buf, cmd[space + 1..].as_bytes());
    },
  }

  for arg in req.args() {
    match arg_payload(arg) {
      Some(payload) => write_bulk(buf, &payload),
      None => {
        buf.truncate(checkpoint);
        return Err(argument_type_error(arg, req));
      },
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn serialized(req: &Request) -> Vec<u8> {
    let mut buf = BytesMut::new();
    append_request(&mut buf, req).unwrap();
    buf.to_vec()
  }

  #[test]
  fn should_serialize_ping() {
    let req = Request::new("PING", vec![]);
    assert_eq!(serialized(&req), b"*1\r\n$4\r\nPING\r\n");
  }

  #[test]
  fn should_serialize_mixed_args() {
    let req = Request::new("SET", vec!["k".into(), 42.into(), Value::Null]);
    assert_eq!(
      serialized(&req),
      b"*4\r\n$3\r\nSET\r\n$1\r\nk\r\n$2\r\n42\r\n$0\r\n\r\n"
    );
  }

  #[test]
  fn should_split_two_word_commands() {
    let req = Request::new("CLIENT LIST", vec![]);
    assert_eq!(serialized(&req), b"*2\r\n$6\r\nCLIENT\r\n$4\r\nLIST\r\n");
  }

  #[test]
  fn should_render_booleans_and_floats() {
    let req = Request::new(
      "X",
      vec![true.into(), false.into(), 0.25f64.into(), 0.1f32.into()],
    );
    assert_eq!(
      serialized(&req),
      b"*5\r\n$1\r\nX\r\n$1\r\n1\r\n$1\r\n0\r\n$4\r\n0.25\r\n$3\r\n0.1\r\n"
    );
  }

  #[test]
  fn should_render_wide_unsigned_as_decimal() {
    let req = Request::new("X", vec![u64::MAX.into()]);
    assert_eq!(serialized(&req), b"*2\r\n$1\r\nX\r\n$20\r\n18446744073709551615\r\n");
  }

  #[test]
  fn should_reject_array_arguments() {
    let req = Request::new("GET", vec![Value::Array(vec![Value::Integer(1)])]);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"prior");

    let error = append_request(&mut buf, &req).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Request);
    assert_eq!(error.code(), ErrorCode::ArgumentType);
    // the packet is restored to its previous contents
    assert_eq!(&buf[..], b"prior");

    assert_eq!(check_args(&req).unwrap_err().code(), ErrorCode::ArgumentType);
  }

  #[test]
  fn should_project_the_same_bytes_the_serializer_emits() {
    let args: Vec<Value> = vec![
      "text".into(),
      Value::Bytes(Bytes::from_static(b"\x00\xffraw")),
      (-42i64).into(),
      7u64.into(),
      u64::MAX.into(),
      true.into(),
      false.into(),
      1.5f64.into(),
      0.1f32.into(),
      Value::Null,
    ];

    for arg in args {
      let key = arg_to_key(&arg).unwrap();
      let req = Request::new("X", vec![arg.clone()]);
      let expected = {
        let mut buf = BytesMut::new();
        let _ = write!(buf, "*2\r\n$1\r\nX\r\n${}\r\n", key.len());
        buf.extend_from_slice(&key);
        buf.extend_from_slice(b"\r\n");
        buf.to_vec()
      };
      assert_eq!(serialized(&req), expected, "argument {:?}", arg);
    }
  }

  #[test]
  fn should_project_nothing_for_arrays() {
    assert!(arg_to_key(&Value::Array(vec![])).is_none());
  }
}
