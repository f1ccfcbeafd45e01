use crate::error::{Error, ErrorCode, ErrorKind};
use std::future::Future;
use std::time::Duration;

/// Run a fallible future under an optional deadline.
///
/// Socket reads and writes call this once per operation so the deadline resets
/// on each round of IO. `None` disables the deadline entirely.
pub async fn timeout<T, F>(ft: F, deadline: Option<Duration>) -> Result<T, Error>
where
  F: Future<Output = Result<T, Error>>,
{
  match deadline {
    Some(dur) if !dur.is_zero() => match tokio::time::timeout(dur, ft).await {
      Ok(result) => result,
      Err(_) => Err(
        Error::new(ErrorKind::IO, ErrorCode::IO)
          .with_details("i/o deadline exceeded")
          .with("timeout_ms", dur.as_millis()),
      ),
    },
    _ => ft.await,
  }
}
