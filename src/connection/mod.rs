use crate::config::{DefaultLogger, LogEvent, Logger, Opts};
use crate::error::{Error, ErrorCode, ErrorKind};
use crate::promise::{Promise, TransactionPromise, DUMB};
use crate::protocol::request::{self, Request};
use crate::types::Value;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

pub(crate) mod dial;
pub(crate) mod pipeline;

use pipeline::Session;

/// The connection lifecycle state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum State {
  Disconnected = 0,
  Connecting = 1,
  Connected = 2,
  /// Terminal; entered once on close and never left.
  Closed = 3,
}

impl State {
  fn from_u8(value: u8) -> State {
    match value {
      0 => State::Disconnected,
      1 => State::Connecting,
      2 => State::Connected,
      _ => State::Closed,
    }
  }
}

/// Additions applied around a batch submission.
///
/// `asking` prepends an ASKING marker; `transaction` wraps the batch in
/// MULTI/EXEC and delivers the EXEC reply at `start + requests.len()`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchFlags {
  pub asking: bool,
  pub transaction: bool,
}

/// One queued request waiting for the writer.
pub(crate) struct Entry {
  pub promise: Arc<dyn Promise>,
  pub index: u64,
  pub queued_at: Instant,
  pub request: Request,
}

/// A submission queue, padded so neighboring shards do not share cache lines.
#[repr(align(128))]
pub(crate) struct Shard {
  pub queue: Mutex<VecDeque<Entry>>,
}

pub(crate) struct ConnectionInner {
  pub addr: String,
  pub opts: Opts,
  pub logger: Arc<dyn Logger>,
  state: AtomicU8,
  shard_counter: AtomicU32,
  session_counter: AtomicU64,
  pub shards: Box<[Shard]>,
  dirty_tx: mpsc::Sender<u32>,
  /// The dirty receiver outlives any single socket. The active writer locks
  /// it for one session; the slot is emptied once, on terminal close.
  pub dirty_rx: AsyncMutex<Option<mpsc::Receiver<u32>>>,
  /// Serializes dial, reconnect and close. Held across the handshake, but
  /// released before the reconnect pause so producers and close can proceed.
  conn_lock: AsyncMutex<()>,
  pub session: Mutex<Option<Arc<Session>>>,
  /// Cancelled by [Connection::close]; observed by the supervisor.
  ctx: CancellationToken,
  runtime: tokio::runtime::Handle,
}

impl ConnectionInner {
  pub(crate) fn state(&self) -> State {
    State::from_u8(self.state.load(Ordering::SeqCst))
  }

  fn set_state(&self, state: State) {
    self.state.store(state as u8, Ordering::SeqCst);
  }

  pub(crate) fn next_session_id(&self) -> u64 {
    self.session_counter.fetch_add(1, Ordering::Relaxed)
  }

  fn next_shard(&self) -> u32 {
    self.shard_counter.fetch_add(1, Ordering::Relaxed) % self.opts.concurrency
  }

  fn report(&self, event: LogEvent<'_>) {
    self.logger.report(&self.addr, event);
  }

  /// Post the idle→nonempty notification for a shard.
  ///
  /// Called under the shard lock, before the entries are appended. The
  /// channel has room for two notifications per shard so the fallback path
  /// is never expected to run; it exists so a wakeup cannot be lost.
  fn mark_dirty(&self, shardn: u32) {
    if self.dirty_tx.try_send(shardn).is_err() {
      let tx = self.dirty_tx.clone();
      self.runtime.spawn(async move {
        let _ = tx.send(shardn).await;
      });
    }
  }
}

/// Resolve every entry with the same error.
pub(crate) fn fail_entries(entries: VecDeque<Entry>, error: Error) {
  for entry in entries {
    entry.promise.resolve(Err(error.clone()), entry.index);
  }
}

/// A pipelined connection to a single Redis server.
///
/// The handle is cheap to clone. The socket is re-established as necessary
/// until [close](Connection::close) is called.
#[derive(Clone)]
pub struct Connection {
  inner: Arc<ConnectionInner>,
}

impl fmt::Display for Connection {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "Connection{{addr: {}}}", self.inner.addr)
  }
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Connection")
      .field("addr", &self.inner.addr)
      .field("state", &self.inner.state())
      .finish()
  }
}

impl Connection {
  /// Connect to a single Redis server.
  ///
  /// With `async_connect` the method returns as soon as the connection starts
  /// accepting submissions, before the first dial finishes. Otherwise a dial
  /// failure is returned directly when reconnection is disabled or the server
  /// rejected authentication; any other initial failure leaves a background
  /// task retrying and still returns a usable connection.
  pub async fn connect(addr: &str, mut opts: Opts) -> Result<Connection, Error> {
    if addr.is_empty() {
      return Err(Error::new(ErrorKind::Opts, ErrorCode::NoAddressProvided));
    }
    opts.normalize();
    let logger = opts
      .logger
      .take()
      .unwrap_or_else(|| Arc::new(DefaultLogger));

    let concurrency = opts.concurrency as usize;
    let (dirty_tx, dirty_rx) = mpsc::channel(concurrency * 2);
    let shards = (0..concurrency)
      .map(|_| Shard {
        queue: Mutex::new(VecDeque::new()),
      })
      .collect::<Vec<_>>()
      .into_boxed_slice();

    let inner = Arc::new(ConnectionInner {
      addr: addr.to_owned(),
      opts,
      logger,
      state: AtomicU8::new(State::Disconnected as u8),
      shard_counter: AtomicU32::new(0),
      session_counter: AtomicU64::new(0),
      shards,
      dirty_tx,
      dirty_rx: AsyncMutex::new(Some(dirty_rx)),
      conn_lock: AsyncMutex::new(()),
      session: Mutex::new(None),
      ctx: CancellationToken::new(),
      runtime: tokio::runtime::Handle::current(),
    });

    let mut first_error = None;
    if !inner.opts.async_connect {
      if let Err(e) = create_connection(&inner, false, None).await {
        if inner.opts.reconnect_pause.is_none() || e.code() == ErrorCode::Auth {
          return Err(e);
        }
        first_error = Some(e);
      }
    }

    if inner.opts.async_connect || first_error.is_some() {
      let (ready_tx, ready_rx) = oneshot::channel();
      let background = inner.clone();
      tokio::spawn(async move {
        let _ = create_connection(&background, true, Some(ready_tx)).await;
      });
      // wait for the state to reach Connecting so submissions are accepted
      if inner.opts.async_connect {
        let _ = ready_rx.await;
      }
    }

    tokio::spawn(supervise(inner.clone()));
    Ok(Connection { inner })
  }

  /// The configured address.
  pub fn addr(&self) -> &str {
    &self.inner.addr
  }

  /// The caller token from [Opts::handle].
  pub fn handle(&self) -> Option<Arc<dyn Any + Send + Sync>> {
    self.inner.opts.handle.clone()
  }

  /// Whether the connection is certainly established at this moment.
  pub fn connected_now(&self) -> bool {
    self.inner.state() == State::Connected
  }

  /// Whether the connection is established or being established. Submissions
  /// are accepted in both states.
  pub fn may_be_connected(&self) -> bool {
    matches!(self.inner.state(), State::Connected | State::Connecting)
  }

  /// The local address of the current socket, if any.
  pub fn local_addr(&self) -> Option<String> {
    self.inner.session.lock().as_ref().map(|s| s.local.clone())
  }

  /// The remote address of the current socket, if any.
  pub fn remote_addr(&self) -> Option<String> {
    self.inner.session.lock().as_ref().map(|s| s.remote.clone())
  }

  /// Close the connection forever. Outstanding and future submissions resolve
  /// with a [ContextClosed](ErrorCode::ContextClosed) error.
  pub fn close(&self) {
    self.inner.ctx.cancel();
  }

  /// Submit one request. The promise resolves at `index` once the response
  /// arrives, or immediately on a submission error.
  pub fn send(&self, req: Request, promise: Arc<dyn Promise>, index: u64) {
    self.send_ask(req, promise, index, false);
  }

  /// Submit one request, optionally preceded by an ASKING marker. Used by
  /// cluster layers chasing an ASK redirection.
  pub fn send_ask(&self, req: Request, promise: Arc<dyn Promise>, index: u64, asking: bool) {
    if let Err(e) = self.do_send(req, promise.clone(), index, asking) {
      promise.resolve(Err(e.with("connection", &self.inner.addr)), index);
    }
  }

  fn do_send(&self, req: Request, promise: Arc<dyn Promise>, index: u64, asking: bool) -> Result<(), Error> {
    let inner = &self.inner;
    if promise.is_cancelled() {
      return Err(Error::new(ErrorKind::Request, ErrorCode::RequestCancelled));
    }
    // requests are serialized later, on the writer; reject anything that
    // could not be packed while the submitter can still be told directly
    request::check_args(&req)?;

    let shardn = inner.next_shard();
    let mut queue = inner.shards[shardn as usize].queue.lock();

    // producers never take the connection mutex, so the state is re-checked
    // under the shard lock. Connecting is accepted: the request is queued and
    // flushed once the writer starts.
    match inner.state() {
      State::Closed => return Err(Error::new(ErrorKind::Context, ErrorCode::ContextClosed)),
      State::Disconnected => return Err(Error::new(ErrorKind::Connection, ErrorCode::NotConnected)),
      State::Connecting | State::Connected => {},
    }

    if queue.is_empty() {
      inner.mark_dirty(shardn);
    }
    let now = Instant::now();
    if asking {
      queue.push_back(Entry {
        promise: DUMB.clone(),
        index: 0,
        queued_at: now,
        request: Request::new("ASKING", vec![]),
      });
    }
    queue.push_back(Entry {
      promise,
      index,
      queued_at: now,
      request: req,
    });
    Ok(())
  }

  /// Submit several requests in preserved order on one shard. The promise
  /// resolves at `start`, `start + 1`, … as the responses arrive.
  pub fn send_batch(&self, requests: Vec<Request>, promise: Arc<dyn Promise>, start: u64) {
    self.send_batch_flags(requests, promise, start, BatchFlags::default());
  }

  /// Submit a batch with ASKING or MULTI/EXEC additions.
  ///
  /// Since the whole batch shares one wire sequence, a single malformed
  /// request aborts every request in it: the offender resolves with the
  /// argument error, the rest with a BatchFormat error naming it, and
  /// nothing is written.
  pub fn send_batch_flags(&self, requests: Vec<Request>, promise: Arc<dyn Promise>, start: u64, flags: BatchFlags) {
    let count = requests.len();
    let mut offender: Option<(usize, Error)> = None;
    for (idx, req) in requests.iter().enumerate() {
      if let Err(e) = request::check_args(req) {
        offender = Some((idx, e.with("connection", &self.inner.addr)));
        break;
      }
    }

    let common = match offender {
      Some((idx, ref e)) => Some(
        Error::new(ErrorKind::Request, ErrorCode::BatchFormat)
          .with("request_index", idx)
          .with("connection", &self.inner.addr)
          .wrap(e.clone()),
      ),
      None => self.do_send_batch(requests, promise.clone(), start, flags).err(),
    };

    if let Some(common) = common {
      for idx in 0..count {
        let error = match offender {
          Some((bad, ref e)) if bad == idx => e.clone(),
          _ => common.clone(),
        };
        promise.resolve(Err(error), start + idx as u64);
      }
      if flags.transaction {
        // the EXEC reply slot fails as well
        promise.resolve(Err(common), start + count as u64);
      }
    }
  }

  fn do_send_batch(
    &self,
    requests: Vec<Request>,
    promise: Arc<dyn Promise>,
    start: u64,
    flags: BatchFlags,
  ) -> Result<(), Error> {
    let inner = &self.inner;
    if requests.is_empty() {
      if flags.transaction {
        promise.resolve(Ok(Value::Array(Vec::new())), start);
      }
      return Ok(());
    }
    if promise.is_cancelled() {
      return Err(Error::new(ErrorKind::Request, ErrorCode::RequestCancelled));
    }

    let shardn = inner.next_shard();
    let mut queue = inner.shards[shardn as usize].queue.lock();

    match inner.state() {
      State::Closed => return Err(Error::new(ErrorKind::Context, ErrorCode::ContextClosed)),
      State::Disconnected => return Err(Error::new(ErrorKind::Connection, ErrorCode::NotConnected)),
      State::Connecting | State::Connected => {},
    }

    if queue.is_empty() {
      inner.mark_dirty(shardn);
    }
    let now = Instant::now();
    if flags.asking {
      queue.push_back(Entry {
        promise: DUMB.clone(),
        index: 0,
        queued_at: now,
        request: Request::new("ASKING", vec![]),
      });
    }
    if flags.transaction {
      queue.push_back(Entry {
        promise: DUMB.clone(),
        index: 0,
        queued_at: now,
        request: Request::new("MULTI", vec![]),
      });
    }
    let count = requests.len() as u64;
    for (idx, req) in requests.into_iter().enumerate() {
      queue.push_back(Entry {
        promise: promise.clone(),
        index: start + idx as u64,
        queued_at: now,
        request: req,
      });
    }
    if flags.transaction {
      queue.push_back(Entry {
        promise,
        index: start + count,
        queued_at: now,
        request: Request::new("EXEC", vec![]),
      });
    }
    Ok(())
  }

  /// Submit requests as a MULTI/EXEC transaction. The promise resolves
  /// exactly once, at `offset`, with the EXEC reply; the marker and QUEUED
  /// replies are discarded.
  pub fn send_transaction(&self, requests: Vec<Request>, promise: Arc<dyn Promise>, offset: u64) {
    if promise.is_cancelled() {
      promise.resolve(
        Err(
          Error::new(ErrorKind::Request, ErrorCode::RequestCancelled).with("connection", &self.inner.addr),
        ),
        offset,
      );
      return;
    }
    let len = requests.len() as u64;
    let wrapped: Arc<dyn Promise> = Arc::new(TransactionPromise::new(promise, len, offset));
    self.send_batch_flags(
      requests,
      wrapped,
      0,
      BatchFlags {
        asking: false,
        transaction: true,
      },
    );
  }

  /// Send a PING and wait for its reply.
  pub async fn ping(&self) -> Result<(), Error> {
    let (promise, response) = crate::promise::OneshotPromise::new();
    self.send(Request::new("PING", vec![]), promise, 0);

    let (result, _) = response.await.map_err(|_| {
      Error::new(ErrorKind::Connection, ErrorCode::IO).with_details("ping dropped without response")
    })?;
    let value = result?;
    if value.as_str().as_deref() == Some("PONG") {
      Ok(())
    } else {
      Err(
        Error::new(ErrorKind::Response, ErrorCode::Ping)
          .with("connection", &self.inner.addr)
          .with("response", format!("{:?}", value)),
      )
    }
  }
}

/// Dial until connected, the state machine leaves `Disconnected`, or (without
/// reconnection) the first attempt fails.
///
/// `ready` fires as soon as the state reaches `Connecting`, which is when
/// submissions start being accepted. The connection mutex is held around each
/// attempt and released during the reconnect pause.
pub(crate) async fn create_connection(
  inner: &Arc<ConnectionInner>,
  reconnect: bool,
  mut ready: Option<oneshot::Sender<()>>,
) -> Result<(), Error> {
  loop {
    let guard = inner.conn_lock.lock().await;
    if inner.session.lock().is_some() || inner.state() != State::Disconnected {
      break;
    }

    inner.report(LogEvent::Connecting);
    let started = tokio::time::Instant::now();
    inner.set_state(State::Connecting);
    if let Some(tx) = ready.take() {
      let _ = tx.send(());
    }

    match dial::dial_and_handshake(&inner.addr, &inner.opts).await {
      Ok((read, write, local, remote)) => {
        let session = pipeline::spawn(inner, read, write, local.clone(), remote.clone());
        *inner.session.lock() = Some(session);
        inner.set_state(State::Connected);
        inner.report(LogEvent::Connected { local, remote });
        return Ok(());
      },
      Err(e) => {
        inner.report(LogEvent::ConnectFailed(&e));
        inner.set_state(State::Disconnected);
        drop_shard_futures(inner, &e, false).await;

        if !reconnect || inner.opts.reconnect_pause.is_none() {
          return Err(e);
        }
        // the pause must not block submissions or close
        drop(guard);
        let pause = inner.opts.reconnect_pause.unwrap_or_default();
        tokio::time::sleep_until(started + pause).await;
      },
    }
  }

  if inner.state() == State::Closed {
    return Err(Error::new(ErrorKind::Context, ErrorCode::ContextClosed));
  }
  Ok(())
}

/// Revoke every queued entry with `error`.
///
/// Stale dirty notifications are drained first so the channel never
/// accumulates indices across reconnect cycles; on terminal close the
/// receiver slot is emptied for good, which is what closes the channel.
pub(crate) async fn drop_shard_futures(inner: &Arc<ConnectionInner>, error: &Error, forever: bool) {
  {
    let mut slot = inner.dirty_rx.lock().await;
    if let Some(rx) = slot.as_mut() {
      while rx.try_recv().is_ok() {}
    }
    if forever {
      *slot = None;
    }
  }

  // shard locks are taken in index order and never nested; a producer that
  // already passed its state check finishes appending before its shard is
  // drained, so its entry is revoked rather than stranded
  for shard in inner.shards.iter() {
    let drained = {
      let mut queue = shard.queue.lock();
      std::mem::take(&mut *queue)
    };
    fail_entries(drained, error.clone());
  }
}

/// Tear down the current session.
///
/// With `forever` the connection enters its terminal state; otherwise it goes
/// back to `Disconnected` for a redial. Callers hold the connection mutex.
pub(crate) async fn close_connection(inner: &Arc<ConnectionInner>, error: Error, forever: bool) {
  if forever {
    inner.set_state(State::Closed);
    inner.report(LogEvent::ContextClosed);
  } else {
    inner.set_state(State::Disconnected);
    inner.report(LogEvent::Disconnected(&error));
  }

  let session = inner.session.lock().take();
  if let Some(session) = session {
    // stopping the io tasks drops both socket halves, which closes the socket
    session.shutdown(error.clone());
  }
  drop_shard_futures(inner, &error, forever).await;
}

/// Handle a session fault: close the failed socket and dial again.
///
/// Spawned at most once per session by the fault latch. The session identity
/// check skips the teardown when the failed socket was already replaced.
pub(crate) async fn reconnect(inner: Arc<ConnectionInner>, error: Error, session_id: u64) {
  {
    let _guard = inner.conn_lock.lock().await;
    if inner.state() == State::Closed {
      return;
    }
    if inner.opts.reconnect_pause.is_none() {
      // reconnection disabled: the first fault is final
      inner.ctx.cancel();
      return;
    }
    let current = inner.session.lock().as_ref().map(|s| s.id);
    if current != Some(session_id) {
      return;
    }
    close_connection(&inner, error, false).await;
  }
  let _ = create_connection(&inner, true, None).await;
}

/// The per-connection supervisor task.
///
/// Pings the server on a fraction of the IO deadline so an unresponsive
/// socket is noticed between submissions, and runs terminal teardown when the
/// connection is closed.
async fn supervise(inner: Arc<ConnectionInner>) {
  let mut period = match inner.opts.io_timeout {
    Some(t) => t / 3,
    None => Duration::ZERO,
  };
  if period.is_zero() {
    period = Duration::from_secs(1);
  }
  let mut ticker = tokio::time::interval(period);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
  ticker.tick().await;

  let conn = Connection {
    inner: inner.clone(),
  };
  loop {
    tokio::select! {
      _ = inner.ctx.cancelled() => {
        let _guard = inner.conn_lock.lock().await;
        let error = Error::new(ErrorKind::Context, ErrorCode::ContextClosed);
        close_connection(&inner, error, true).await;
        return;
      },
      _ = ticker.tick() => {},
    }

    if let Err(e) = conn.ping().await {
      if e.code() == ErrorCode::Ping {
        // a non-PONG reply to the keepalive means request/response pairing is
        // broken; recovering would deliver responses to the wrong callers
        panic!("{}", e);
      }
      _debug!(inner, "keepalive ping failed: {}", e);
    }
  }
}
