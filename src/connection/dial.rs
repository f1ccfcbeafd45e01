use crate::config::Opts;
use crate::error::{Error, ErrorCode, ErrorKind};
use crate::protocol::codec::RespCodec;
use crate::protocol::request::{append_request, Request};
use crate::types::Value;
use crate::utils;
use bytes::BytesMut;
use futures::{Stream, StreamExt};
use redis_protocol::resp2::types::Frame as Resp2Frame;
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, tcp, unix, TcpStream, UnixStream};
use tokio_util::codec::FramedRead;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Scheme {
  Tcp,
  Unix,
}

/// Split an address into its scheme and dial target.
///
/// A leading `.` or `/` selects a UNIX socket path; `unix://` and `tcp://`
/// prefixes are stripped and select the scheme; everything else dials TCP.
pub(crate) fn parse_address(addr: &str) -> (Scheme, &str) {
  if addr.starts_with('.') || addr.starts_with('/') {
    (Scheme::Unix, addr)
  } else if let Some(path) = addr.strip_prefix("unix://") {
    (Scheme::Unix, path)
  } else if let Some(rest) = addr.strip_prefix("tcp://") {
    (Scheme::Tcp, rest)
  } else {
    (Scheme::Tcp, addr)
  }
}

/// The read half of a dialed socket, framed with the response decoder.
pub(crate) enum ReadHalfKind {
  Tcp(FramedRead<tcp::OwnedReadHalf, RespCodec>),
  Unix(FramedRead<unix::OwnedReadHalf, RespCodec>),
}

impl Stream for ReadHalfKind {
  type Item = Result<Resp2Frame, Error>;

  fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    match self.get_mut() {
      ReadHalfKind::Tcp(ref mut conn) => Pin::new(conn).poll_next(cx),
      ReadHalfKind::Unix(ref mut conn) => Pin::new(conn).poll_next(cx),
    }
  }
}

/// The write half of a dialed socket. Only the writer task touches this.
pub(crate) enum WriteHalfKind {
  Tcp(tcp::OwnedWriteHalf),
  Unix(unix::OwnedWriteHalf),
}

impl WriteHalfKind {
  pub(crate) async fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
    let result = match *self {
      WriteHalfKind::Tcp(ref mut w) => w.write_all(buf).await,
      WriteHalfKind::Unix(ref mut w) => w.write_all(buf).await,
    };
    result.map_err(Error::from)
  }
}

fn dial_error(cause: Error) -> Error {
  Error::new(ErrorKind::Connection, ErrorCode::Dial).wrap(cause)
}

fn setup_error(cause: Error) -> Error {
  Error::new(ErrorKind::Connection, ErrorCode::ConnSetup).wrap(cause)
}

/// Connect to the first reachable resolved address.
///
/// With more than one candidate each attempt gets half the dial deadline so a
/// dead address family can fall back to the other one in time.
async fn tcp_connect_any(target: &str, timeout: Duration) -> Result<TcpStream, Error> {
  let addrs: Vec<SocketAddr> = lookup_host(target).await.map_err(Error::from)?.collect();
  if addrs.is_empty() {
    return Err(Error::new(ErrorKind::Connection, ErrorCode::Dial).with_details("address resolved to nothing"));
  }
  let attempt_timeout = if addrs.len() > 1 { timeout / 2 } else { timeout };

  let mut last_error = None;
  for addr in addrs.iter() {
    trace!("{}: dialing {}", target, addr);
    match tokio::time::timeout(attempt_timeout, TcpStream::connect(addr)).await {
      Ok(Ok(socket)) => return Ok(socket),
      Ok(Err(e)) => last_error = Some(Error::from(e)),
      Err(_) => {
        last_error = Some(Error::new(ErrorKind::IO, ErrorCode::IO).with_details("dial deadline exceeded"))
      },
    }
  }
  Err(last_error.unwrap_or_else(|| Error::new(ErrorKind::Connection, ErrorCode::Dial)))
}

async fn read_reply(framed: &mut ReadHalfKind, io_timeout: Option<Duration>) -> Result<Value, Error> {
  let frame = utils::timeout(async { framed.next().await.transpose() }, io_timeout).await?;
  match frame {
    Some(frame) => crate::protocol::codec::frame_to_value(frame),
    None => Err(
      Error::new(ErrorKind::IO, ErrorCode::IO).with_details("connection closed during handshake"),
    ),
  }
}

/// Dial the configured address and run the AUTH / PING / SELECT handshake.
///
/// Returns the framed read half, the write half, and the local/remote address
/// strings for the connected event. Any failure drops the socket.
pub(crate) async fn dial_and_handshake(
  addr: &str,
  opts: &Opts,
) -> Result<(ReadHalfKind, WriteHalfKind, String, String), Error> {
  let (scheme, target) = parse_address(addr);
  let dial_timeout = opts.effective_dial_timeout();

  let (mut framed, mut write, local, remote) = match scheme {
    Scheme::Tcp => {
      let socket = tokio::time::timeout(dial_timeout, tcp_connect_any(target, dial_timeout))
        .await
        .map_err(|_| Error::new(ErrorKind::Connection, ErrorCode::Dial).with_details("dial deadline exceeded"))?
        .map_err(dial_error)?;

      if let Some(interval) = opts.tcp_keepalive {
        let keepalive = TcpKeepalive::new().with_time(interval);
        SockRef::from(&socket)
          .set_tcp_keepalive(&keepalive)
          .map_err(|e| dial_error(Error::from(e)))?;
      }

      let local = socket.local_addr().map(|a| a.to_string()).unwrap_or_default();
      let remote = socket.peer_addr().map(|a| a.to_string()).unwrap_or_default();
      let (read, write) = socket.into_split();
      let framed = FramedRead::new(read, RespCodec { addr: addr.to_owned() });
      (ReadHalfKind::Tcp(framed), WriteHalfKind::Tcp(write), local, remote)
    },
    Scheme::Unix => {
      let socket = tokio::time::timeout(dial_timeout, UnixStream::connect(target))
        .await
        .map_err(|_| Error::new(ErrorKind::Connection, ErrorCode::Dial).with_details("dial deadline exceeded"))?
        .map_err(|e| dial_error(Error::from(e)))?;

      let (read, write) = socket.into_split();
      let framed = FramedRead::new(read, RespCodec { addr: addr.to_owned() });
      (
        ReadHalfKind::Unix(framed),
        WriteHalfKind::Unix(write),
        String::new(),
        target.to_owned(),
      )
    },
  };

  // the handshake goes out as one write: optional AUTH, PING, optional SELECT
  let mut handshake = BytesMut::new();
  if let Some(ref password) = opts.password {
    append_request(&mut handshake, &Request::new("AUTH", vec![password.clone().into()]))?;
  }
  append_request(&mut handshake, &Request::new("PING", vec![]))?;
  if opts.db != 0 {
    append_request(&mut handshake, &Request::new("SELECT", vec![opts.db.into()]))?;
  }

  utils::timeout(write.write_all(&handshake), opts.io_timeout)
    .await
    .map_err(setup_error)?;

  if opts.password.is_some() {
    if let Err(e) = read_reply(&mut framed, opts.io_timeout).await {
      return Err(if e.details().contains("password") {
        Error::new(ErrorKind::Connection, ErrorCode::Auth).wrap(e)
      } else {
        setup_error(e)
      });
    }
  }

  let pong = read_reply(&mut framed, opts.io_timeout).await.map_err(setup_error)?;
  if pong.as_str().as_deref() != Some("PONG") {
    return Err(
      Error::new(ErrorKind::Connection, ErrorCode::ConnSetup)
        .with_details("ping response mismatch")
        .with("response", format!("{:?}", pong)),
    );
  }

  if opts.db != 0 {
    let selected = read_reply(&mut framed, opts.io_timeout).await.map_err(setup_error)?;
    if selected.as_str().as_deref() != Some("OK") {
      return Err(
        Error::new(ErrorKind::Connection, ErrorCode::ConnSetup)
          .with_details("SELECT response mismatch")
          .with("db", opts.db)
          .with("response", format!("{:?}", selected)),
      );
    }
  }

  Ok((framed, write, local, remote))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn should_parse_address_forms() {
    assert_eq!(parse_address("127.0.0.1:6379"), (Scheme::Tcp, "127.0.0.1:6379"));
    assert_eq!(parse_address("tcp://redis.internal:6380"), (Scheme::Tcp, "redis.internal:6380"));
    assert_eq!(parse_address("unix:///var/run/redis.sock"), (Scheme::Unix, "/var/run/redis.sock"));
    assert_eq!(parse_address("/var/run/redis.sock"), (Scheme::Unix, "/var/run/redis.sock"));
    assert_eq!(parse_address("./redis.sock"), (Scheme::Unix, "./redis.sock"));
  }
}
