use crate::error::Error;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);
pub(crate) const DEFAULT_WRITE_PAUSE: Duration = Duration::from_micros(10);
/// Hard cap on the dial timeout, matching the common dialer default.
pub(crate) const MAX_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
/// Shard counts above `cores * MAX_CONCURRENCY_FACTOR` fall back to the core count.
pub(crate) const MAX_CONCURRENCY_FACTOR: u32 = 128;

/// A lifecycle event reported to the configured [Logger].
#[derive(Debug)]
pub enum LogEvent<'a> {
  /// A dial attempt is starting.
  Connecting,
  /// The handshake finished and the pipeline is running.
  Connected { local: String, remote: String },
  /// A dial or handshake attempt failed.
  ConnectFailed(&'a Error),
  /// An established connection was lost.
  Disconnected(&'a Error),
  /// The connection was closed forever.
  ContextClosed,
}

/// Sink for connection lifecycle events.
pub trait Logger: Send + Sync + 'static {
  fn report(&self, addr: &str, event: LogEvent<'_>);
}

/// Default sink that forwards lifecycle events to the `log` crate.
pub(crate) struct DefaultLogger;

impl Logger for DefaultLogger {
  fn report(&self, addr: &str, event: LogEvent<'_>) {
    match event {
      LogEvent::Connecting => debug!("{}: connecting", addr),
      LogEvent::Connected { local, remote } => info!("{}: connected {} -> {}", addr, local, remote),
      LogEvent::ConnectFailed(err) => error!("{}: connection failed: {}", addr, err),
      LogEvent::Disconnected(err) => warn!("{}: disconnected: {}", addr, err),
      LogEvent::ContextClosed => info!("{}: closed", addr),
    }
  }
}

/// Options for a [Connection](crate::Connection).
///
/// Duration fields follow one convention: `None` disables the feature,
/// `Some(Duration::ZERO)` (the `Default` value) selects the documented
/// default, and any other value is used as given.
#[derive(Clone)]
pub struct Opts {
  /// Database to SELECT after the handshake PING. 0 skips SELECT.
  pub db: u32,
  /// Password sent via AUTH during the handshake. `None` skips AUTH.
  pub password: Option<String>,
  /// Deadline applied to each socket read and write. Zero defaults to 1
  /// second; `None` disables deadlines.
  pub io_timeout: Option<Duration>,
  /// Deadline for dialing. Zero or values above `io_timeout` fall back to
  /// `io_timeout`; the effective value is always capped at 5 seconds.
  pub dial_timeout: Option<Duration>,
  /// Minimum wall-clock interval between dial attempts. Zero defaults to
  /// `2 * dial_timeout`; `None` disables reconnection so the first failure is
  /// final.
  pub reconnect_pause: Option<Duration>,
  /// TCP keep-alive interval. Zero defaults to `io_timeout / 3`; `None`
  /// disables keep-alive.
  pub tcp_keepalive: Option<Duration>,
  /// Number of submission shards. 0 or anything above `128 * cores` falls
  /// back to the core count.
  pub concurrency: u32,
  /// How long the writer sleeps after its first wakeup to collect more
  /// requests into one syscall. Zero defaults to 10 microseconds; `None`
  /// disables the pause. Values above ~100 microseconds buy nothing.
  pub write_pause: Option<Duration>,
  /// Opaque caller token returned verbatim from `Connection::handle`.
  pub handle: Option<Arc<dyn Any + Send + Sync>>,
  /// Return from the constructor as soon as the connection starts accepting
  /// requests, without waiting for the first dial to finish.
  pub async_connect: bool,
  /// Sink for lifecycle events. `None` uses a `log`-crate backed default.
  pub logger: Option<Arc<dyn Logger>>,
}

impl Default for Opts {
  fn default() -> Self {
    Opts {
      db: 0,
      password: None,
      io_timeout: Some(Duration::ZERO),
      dial_timeout: Some(Duration::ZERO),
      reconnect_pause: Some(Duration::ZERO),
      tcp_keepalive: Some(Duration::ZERO),
      concurrency: 0,
      write_pause: Some(Duration::ZERO),
      handle: None,
      async_connect: false,
      logger: None,
    }
  }
}

impl fmt::Debug for Opts {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Opts")
      .field("db", &self.db)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("io_timeout", &self.io_timeout)
      .field("dial_timeout", &self.dial_timeout)
      .field("reconnect_pause", &self.reconnect_pause)
      .field("tcp_keepalive", &self.tcp_keepalive)
      .field("concurrency", &self.concurrency)
      .field("write_pause", &self.write_pause)
      .field("async_connect", &self.async_connect)
      .finish()
  }
}

impl Opts {
  /// Resolve zero placeholders into their documented defaults.
  pub(crate) fn normalize(&mut self) {
    let cores = std::thread::available_parallelism()
      .map(|n| n.get() as u32)
      .unwrap_or(1);

    self.io_timeout = match self.io_timeout {
      Some(d) if d.is_zero() => Some(DEFAULT_IO_TIMEOUT),
      other => other,
    };

    self.dial_timeout = match (self.dial_timeout, self.io_timeout) {
      (Some(d), Some(io)) if !d.is_zero() && d <= io => Some(d),
      (Some(d), None) if !d.is_zero() => Some(d),
      (_, io) => io,
    };

    self.reconnect_pause = match self.reconnect_pause {
      Some(d) if d.is_zero() => Some(self.dial_timeout.unwrap_or(Duration::ZERO) * 2),
      other => other,
    };

    self.tcp_keepalive = match (self.tcp_keepalive, self.io_timeout) {
      (Some(d), Some(io)) if d.is_zero() => Some(io / 3),
      (Some(d), None) if d.is_zero() => None,
      (other, _) => other,
    };

    if self.concurrency == 0 || self.concurrency > cores * MAX_CONCURRENCY_FACTOR {
      self.concurrency = cores;
    }

    self.write_pause = match self.write_pause {
      Some(d) if d.is_zero() => Some(DEFAULT_WRITE_PAUSE),
      other => other,
    };
  }

  /// The effective dial deadline: the configured value capped at 5 seconds,
  /// with 5 seconds standing in when deadlines are disabled.
  pub(crate) fn effective_dial_timeout(&self) -> Duration {
    match self.dial_timeout {
      Some(d) if !d.is_zero() && d < MAX_DIAL_TIMEOUT => d,
      _ => MAX_DIAL_TIMEOUT,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn should_apply_documented_defaults() {
    let mut opts = Opts::default();
    opts.normalize();

    assert_eq!(opts.io_timeout, Some(DEFAULT_IO_TIMEOUT));
    assert_eq!(opts.dial_timeout, Some(DEFAULT_IO_TIMEOUT));
    assert_eq!(opts.reconnect_pause, Some(DEFAULT_IO_TIMEOUT * 2));
    assert_eq!(opts.tcp_keepalive, Some(DEFAULT_IO_TIMEOUT / 3));
    assert_eq!(opts.write_pause, Some(DEFAULT_WRITE_PAUSE));
    assert!(opts.concurrency > 0);
  }

  #[test]
  fn should_clamp_dial_timeout_to_io_timeout() {
    let mut opts = Opts {
      io_timeout: Some(Duration::from_secs(2)),
      dial_timeout: Some(Duration::from_secs(30)),
      ..Opts::default()
    };
    opts.normalize();

    assert_eq!(opts.dial_timeout, Some(Duration::from_secs(2)));
  }

  #[test]
  fn should_cap_effective_dial_timeout() {
    let mut opts = Opts {
      io_timeout: None,
      dial_timeout: None,
      ..Opts::default()
    };
    opts.normalize();

    assert_eq!(opts.effective_dial_timeout(), MAX_DIAL_TIMEOUT);
  }

  #[test]
  fn should_preserve_disabled_reconnect() {
    let mut opts = Opts {
      reconnect_pause: None,
      ..Opts::default()
    };
    opts.normalize();

    assert_eq!(opts.reconnect_pause, None);
  }

  #[test]
  fn should_fall_back_to_core_count_for_wild_concurrency() {
    let cores = std::thread::available_parallelism().unwrap().get() as u32;

    let mut zero = Opts::default();
    zero.normalize();
    assert_eq!(zero.concurrency, cores);

    let mut wild = Opts {
      concurrency: cores * MAX_CONCURRENCY_FACTOR + 1,
      ..Opts::default()
    };
    wild.normalize();
    assert_eq!(wild.concurrency, cores);
  }
}
