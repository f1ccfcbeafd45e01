use std::borrow::Cow;
use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;
use std::sync::Arc;

use redis_protocol::types::RedisProtocolError;

/// The broad category of an error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
  /// An invalid set of connection options.
  Opts,
  /// An error with a single request, such as an argument that cannot be serialized.
  Request,
  /// An error establishing or maintaining the connection.
  Connection,
  /// The connection was closed for good.
  Context,
  /// A response that does not meet expectations, including error replies from the server.
  Response,
  /// An IO error on the underlying socket.
  IO,
}

impl ErrorKind {
  pub fn to_str(&self) -> &'static str {
    match *self {
      ErrorKind::Opts => "Options Error",
      ErrorKind::Request => "Request Error",
      ErrorKind::Connection => "Connection Error",
      ErrorKind::Context => "Context Error",
      ErrorKind::Response => "Response Error",
      ErrorKind::IO => "IO Error",
    }
  }
}

/// The specific error condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCode {
  /// No address was provided to the constructor.
  NoAddressProvided,
  /// A request argument has a type that cannot be serialized.
  ArgumentType,
  /// A batch contains a malformed request; no request in the batch was sent.
  BatchFormat,
  /// The callback reported itself cancelled before the request was enqueued.
  RequestCancelled,
  /// The connection is not established and the request cannot be queued.
  NotConnected,
  /// The connection was closed forever.
  ContextClosed,
  /// Dialing the server failed.
  Dial,
  /// The connection handshake failed.
  ConnSetup,
  /// The server rejected the AUTH command.
  Auth,
  /// The keepalive PING returned something other than PONG.
  Ping,
  /// A socket or framing failure.
  IO,
  /// An error reply from the server, delivered as the result of one request.
  ServerError,
}

impl ErrorCode {
  pub fn to_str(&self) -> &'static str {
    match *self {
      ErrorCode::NoAddressProvided => "no address provided",
      ErrorCode::ArgumentType => "command argument type not supported",
      ErrorCode::BatchFormat => "one request in batch is malformed",
      ErrorCode::RequestCancelled => "request was already cancelled",
      ErrorCode::NotConnected => "connection is not established",
      ErrorCode::ContextClosed => "connection was closed",
      ErrorCode::Dial => "could not connect",
      ErrorCode::ConnSetup => "connection setup unsuccessful",
      ErrorCode::Auth => "authentication failed",
      ErrorCode::Ping => "ping response mismatch",
      ErrorCode::IO => "io error",
      ErrorCode::ServerError => "error reply from server",
    }
  }
}

/// An error from the connection or from Redis.
///
/// Errors are cheap to clone so a single connection failure can resolve every
/// in-flight callback.
#[derive(Clone)]
pub struct Error {
  kind: ErrorKind,
  code: ErrorCode,
  details: Cow<'static, str>,
  context: Vec<(&'static str, String)>,
  cause: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
  pub fn new(kind: ErrorKind, code: ErrorCode) -> Error {
    Error {
      kind,
      code,
      details: Cow::Borrowed(""),
      context: Vec::new(),
      cause: None,
    }
  }

  /// Create an error from an error reply sent by the server.
  ///
  /// The raw message is preserved so layers above can inspect MOVED/ASK
  /// redirections.
  pub(crate) fn server(message: String) -> Error {
    Error::new(ErrorKind::Response, ErrorCode::ServerError).with_details(message)
  }

  /// Replace the default message for the error code.
  pub fn with_details<T>(mut self, details: T) -> Error
  where
    T: Into<Cow<'static, str>>,
  {
    self.details = details.into();
    self
  }

  /// Attach a key-value pair to the error context.
  pub fn with<V: fmt::Display>(mut self, key: &'static str, value: V) -> Error {
    self.context.push((key, value.to_string()));
    self
  }

  /// Attach an underlying cause.
  pub fn wrap<E>(mut self, cause: E) -> Error
  where
    E: StdError + Send + Sync + 'static,
  {
    self.cause = Some(Arc::new(cause));
    self
  }

  pub fn kind(&self) -> ErrorKind {
    self.kind
  }

  pub fn code(&self) -> ErrorCode {
    self.code
  }

  /// The error message, falling back to the code description.
  pub fn details(&self) -> &str {
    if self.details.is_empty() {
      self.code.to_str()
    } else {
      &self.details
    }
  }

  /// The attached context pairs, in insertion order.
  pub fn context(&self) -> &[(&'static str, String)] {
    &self.context
  }

  /// Whether the error invalidates the connection it came from.
  ///
  /// Error replies from the server only fail the request they answer; every
  /// other error observed by the reader tears the connection down.
  pub fn is_hard(&self) -> bool {
    self.kind != ErrorKind::Response
  }
}

impl PartialEq for Error {
  fn eq(&self, other: &Self) -> bool {
    self.kind == other.kind && self.code == other.code && self.details == other.details
  }
}

impl Eq for Error {}

impl fmt::Debug for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(
      f,
      "Error {{ kind: {:?}, code: {:?}, details: {} }}",
      self.kind,
      self.code,
      self.details()
    )
  }
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}: {}", self.kind.to_str(), self.details())?;
    if !self.context.is_empty() {
      write!(f, " (")?;
      for (idx, (key, value)) in self.context.iter().enumerate() {
        if idx > 0 {
          write!(f, ", ")?;
        }
        write!(f, "{}={}", key, value)?;
      }
      write!(f, ")")?;
    }
    if let Some(ref cause) = self.cause {
      write!(f, ": {}", cause)?;
    }
    Ok(())
  }
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    self.cause.as_ref().map(|c| &**c as &(dyn StdError + 'static))
  }
}

impl From<IoError> for Error {
  fn from(e: IoError) -> Self {
    Error::new(ErrorKind::IO, ErrorCode::IO).wrap(e)
  }
}

/// `redis-protocol`'s error type implements `Display`/`Debug` but not
/// `std::error::Error`; this adapter lets it satisfy [Error::wrap]'s bound.
#[derive(Debug)]
struct ProtocolError(RedisProtocolError);

impl fmt::Display for ProtocolError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    fmt::Display::fmt(&self.0, f)
  }
}

impl StdError for ProtocolError {}

impl From<RedisProtocolError> for Error {
  fn from(e: RedisProtocolError) -> Self {
    Error::new(ErrorKind::IO, ErrorCode::IO)
      .with_details("invalid response framing")
      .wrap(ProtocolError(e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn should_format_error_with_context() {
    let error = Error::new(ErrorKind::Connection, ErrorCode::NotConnected)
      .with("connection", "127.0.0.1:6379")
      .with("shard", 3);

    assert_eq!(
      error.to_string(),
      "Connection Error: connection is not established (connection=127.0.0.1:6379, shard=3)"
    );
  }

  #[test]
  fn should_expose_wrapped_cause() {
    let io = IoError::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
    let error = Error::new(ErrorKind::IO, ErrorCode::IO).wrap(io);

    assert!(error.source().is_some());
    assert!(error.to_string().contains("reset by peer"));
  }

  #[test]
  fn should_classify_server_errors_as_soft() {
    let soft = Error::server("WRONGTYPE Operation against a key holding the wrong kind of value".into());
    let hard = Error::new(ErrorKind::IO, ErrorCode::IO);

    assert!(!soft.is_hard());
    assert!(hard.is_hard());
    assert_eq!(soft.code(), ErrorCode::ServerError);
  }

  #[test]
  fn should_compare_by_kind_code_and_details() {
    let a = Error::new(ErrorKind::Request, ErrorCode::ArgumentType).with("argument", "array");
    let b = Error::new(ErrorKind::Request, ErrorCode::ArgumentType);

    assert_eq!(a, b);
  }
}
