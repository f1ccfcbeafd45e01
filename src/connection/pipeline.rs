use crate::connection::dial::{ReadHalfKind, WriteHalfKind};
use crate::connection::{fail_entries, ConnectionInner, Entry};
use crate::error::{Error, ErrorCode, ErrorKind};
use crate::protocol::{codec, request};
use bytes::BytesMut;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio_util::sync::CancellationToken;

/// Flush the packet to the socket once it grows past this many bytes, even if
/// the reader is keeping up.
const PACKET_FLUSH_THRESHOLD: usize = 64 * 1024;
/// Capacity above which the packet buffer is released during the periodic
/// shrink check.
const PACKET_RELEASE_THRESHOLD: usize = 128 * 1024;
/// How many write cycles pass between shrink checks.
const PACKET_RELEASE_CYCLES: u32 = 1024;

/// State shared by one writer/reader pair for the lifetime of one socket.
pub(crate) struct Session {
  /// Socket identity, checked before a fault handler closes and redials.
  pub id: u64,
  /// Closed to stop both IO tasks, either deliberately or after a fault.
  pub control: CancellationToken,
  /// The first error observed on this socket. Set at most once.
  fault: OnceLock<Error>,
  pub local: String,
  pub remote: String,
}

impl Session {
  /// The error used to fail futures owed a response on this session.
  pub(crate) fn error(&self) -> Error {
    self
      .fault
      .get()
      .cloned()
      .unwrap_or_else(|| Error::new(ErrorKind::Context, ErrorCode::ContextClosed))
  }

  /// Report an IO fault. The first reporter stops both tasks and schedules a
  /// reconnect; later reporters are ignored.
  pub(crate) fn fail(&self, inner: &Arc<ConnectionInner>, error: Error) {
    if self.fault.set(error.clone()).is_ok() {
      _debug!(inner, "session {} failed: {}", self.id, error);
      self.control.cancel();

      let inner = inner.clone();
      let session_id = self.id;
      tokio::spawn(async move {
        crate::connection::reconnect(inner, error, session_id).await;
      });
    }
  }

  /// Stop the session deliberately, without scheduling a reconnect.
  pub(crate) fn shutdown(&self, error: Error) {
    let _ = self.fault.set(error);
    self.control.cancel();
  }
}

/// Spawn the writer/reader pair for a freshly dialed socket.
pub(crate) fn spawn(
  inner: &Arc<ConnectionInner>,
  read: ReadHalfKind,
  write: WriteHalfKind,
  local: String,
  remote: String,
) -> Arc<Session> {
  let capacity = inner.opts.concurrency as usize / 2 + 1;
  let (batch_tx, batch_rx) = mpsc::channel(capacity);
  let (pool_tx, pool_rx) = mpsc::channel(capacity);

  let session = Arc::new(Session {
    id: inner.next_session_id(),
    control: CancellationToken::new(),
    fault: OnceLock::new(),
    local,
    remote,
  });

  tokio::spawn(writer_task(inner.clone(), session.clone(), write, batch_tx, pool_rx));
  tokio::spawn(reader_task(inner.clone(), session.clone(), read, batch_rx, pool_tx));
  session
}

/// Write the packet buffer to the socket, clearing it on success.
///
/// Every [PACKET_RELEASE_CYCLES] writes the buffer is released if a burst
/// left it holding more than [PACKET_RELEASE_THRESHOLD] bytes of capacity.
/// Returns false when the writer should exit.
async fn flush_packet(
  inner: &Arc<ConnectionInner>,
  session: &Arc<Session>,
  socket: &mut WriteHalfKind,
  packet: &mut BytesMut,
  round: &mut u32,
) -> bool {
  let result = tokio::select! {
    _ = session.control.cancelled() => return false,
    result = crate::utils::timeout(socket.write_all(packet), inner.opts.io_timeout) => result,
  };
  if let Err(e) = result {
    session.fail(inner, e);
    return false;
  }

  *round -= 1;
  if *round == 0 {
    *round = PACKET_RELEASE_CYCLES;
    if packet.capacity() > PACKET_RELEASE_THRESHOLD {
      *packet = BytesMut::new();
    }
  }
  packet.clear();
  true
}

/// The writer half of the pipeline.
///
/// Parks on the dirty-shard channel, swaps out dirty queues, serializes them
/// into the packet buffer and hands the matching entries to the reader in
/// write order. The dirty receiver outlives any one socket, so the task locks
/// its slot for the span of this session and releases it on exit.
async fn writer_task(
  inner: Arc<ConnectionInner>,
  session: Arc<Session>,
  mut socket: WriteHalfKind,
  batch_tx: mpsc::Sender<VecDeque<Entry>>,
  mut pool_rx: mpsc::Receiver<VecDeque<Entry>>,
) {
  let mut slot = tokio::select! {
    guard = inner.dirty_rx.lock() => guard,
    _ = session.control.cancelled() => return,
  };
  let rx = match slot.as_mut() {
    Some(rx) => rx,
    None => return,
  };

  let mut packet = BytesMut::new();
  let mut batch: VecDeque<Entry> = VecDeque::new();
  let mut round = PACKET_RELEASE_CYCLES;

  'park: loop {
    let mut shardn = tokio::select! {
      _ = session.control.cancelled() => break 'park,
      n = rx.recv() => match n {
        Some(n) => n,
        None => break 'park,
      },
    };

    // collect a burst of submissions into one packet
    if let Some(pause) = inner.opts.write_pause {
      tokio::time::sleep(pause).await;
    }

    loop {
      {
        let mut queue = inner.shards[shardn as usize].queue.lock();
        std::mem::swap(&mut *queue, &mut batch);
      }

      // serialize in order; a malformed entry resolves here and is dropped
      // from the batch handed to the reader since nothing was written for it
      let mut idx = 0;
      while idx < batch.len() {
        match request::append_request(&mut packet, &batch[idx].request) {
          Ok(()) => idx += 1,
          Err(e) => {
            if let Some(entry) = batch.remove(idx) {
              entry.promise.resolve(Err(e), entry.index);
            }
          },
        }
      }

      if !batch.is_empty() {
        let handed = std::mem::take(&mut batch);
        match batch_tx.try_send(handed) {
          Ok(()) => {
            if packet.len() > PACKET_FLUSH_THRESHOLD
              && !flush_packet(&inner, &session, &mut socket, &mut packet, &mut round).await
            {
              break 'park;
            }
          },
          Err(TrySendError::Full(handed)) => {
            // the reader is behind; make the bytes visible before blocking
            if !flush_packet(&inner, &session, &mut socket, &mut packet, &mut round).await {
              fail_entries(handed, session.error());
              break 'park;
            }
            let permit = tokio::select! {
              _ = session.control.cancelled() => None,
              permit = batch_tx.reserve() => permit.ok(),
            };
            match permit {
              Some(permit) => permit.send(handed),
              None => {
                fail_entries(handed, session.error());
                break 'park;
              },
            }
          },
          Err(TrySendError::Closed(handed)) => {
            fail_entries(handed, session.error());
            break 'park;
          },
        }
        batch = pool_rx.try_recv().unwrap_or_default();
      }

      if session.control.is_cancelled() {
        break 'park;
      }
      match rx.try_recv() {
        Ok(n) => shardn = n,
        Err(TryRecvError::Empty) => {
          if !packet.is_empty()
            && !flush_packet(&inner, &session, &mut socket, &mut packet, &mut round).await
          {
            break 'park;
          }
          continue 'park;
        },
        Err(TryRecvError::Disconnected) => break 'park,
      }
    }
  }

  // entries swapped out but never handed to the reader fail here; dropping
  // the batch sender lets the reader drain and exit
  fail_entries(batch, session.error());
  _trace!(inner, "writer for session {} exiting", session.id);
}

/// The reader half of the pipeline.
///
/// Consumes responses in wire order and resolves the head of the current
/// batch for each one. Server error replies resolve the individual entry;
/// anything else that goes wrong here invalidates the session.
async fn reader_task(
  inner: Arc<ConnectionInner>,
  session: Arc<Session>,
  mut socket: ReadHalfKind,
  mut batch_rx: mpsc::Receiver<VecDeque<Entry>>,
  pool_tx: mpsc::Sender<VecDeque<Entry>>,
) {
  let mut batch: VecDeque<Entry> = VecDeque::new();

  loop {
    let frame = tokio::select! {
      _ = session.control.cancelled() => break,
      frame = crate::utils::timeout(
        async { socket.next().await.transpose() },
        inner.opts.io_timeout,
      ) => frame,
    };

    let result = match frame {
      Ok(Some(frame)) => codec::frame_to_value(frame),
      Ok(None) => {
        session.fail(
          &inner,
          Error::new(ErrorKind::IO, ErrorCode::IO).with_details("connection closed by server"),
        );
        break;
      },
      Err(e) => {
        session.fail(&inner, e);
        break;
      },
    };
    let result = result.map_err(|e| e.with("connection", &inner.addr));

    if batch.is_empty() {
      // recycle the spent buffer before parking for the next batch
      let spent = std::mem::take(&mut batch);
      let _ = pool_tx.try_send(spent);

      batch = tokio::select! {
        _ = session.control.cancelled() => break,
        next = batch_rx.recv() => match next {
          Some(next) => next,
          None => break,
        },
      };
    }

    let entry = match batch.pop_front() {
      Some(entry) => entry,
      // the writer never hands off an empty batch
      None => continue,
    };
    _trace!(inner, "resolving index {} after {:?}", entry.index, entry.queued_at.elapsed());
    entry.promise.resolve(result, entry.index);
  }

  // fail everything still owed a response on this socket
  let error = session.error();
  fail_entries(batch, error.clone());

  batch_rx.close();
  while let Some(orphaned) = batch_rx.recv().await {
    fail_entries(orphaned, error.clone());
  }
  _trace!(inner, "reader for session {} exiting", session.id);
}
