use std::{
  collections::VecDeque,
  sync::atomic::{AtomicBool, Ordering},
  time::Duration,
};

use bytes::Bytes;
use derive_more::Display;
use parking_lot::{Condvar, Mutex};

use crate::data::log_record::{LogRecord, LogRecordType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WatchAction {
  Put,

  Delete,
}

/// A committed change. Deletes carry an empty value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
  pub action: WatchAction,
  pub key: Bytes,
  pub value: Bytes,
  pub batch_id: u64,
}

impl Event {
  pub(crate) fn from_record(record: &LogRecord) -> Self {
    let action = match record.rec_type {
      LogRecordType::Deleted => WatchAction::Delete,
      _ => WatchAction::Put,
    };
    Self {
      action,
      key: Bytes::copy_from_slice(&record.key),
      value: Bytes::copy_from_slice(&record.value),
      batch_id: record.batch_id,
    }
  }
}

/// Bounded queue of committed changes.
///
/// When the queue is full the oldest event is dropped, even if nobody has
/// read it yet.
pub struct Watcher {
  queue: Mutex<VecDeque<Event>>,
  capacity: usize,
  ready: Condvar,
  closed: AtomicBool,
}

impl Watcher {
  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      queue: Mutex::new(VecDeque::with_capacity(capacity)),
      capacity,
      ready: Condvar::new(),
      closed: AtomicBool::new(false),
    }
  }

  pub(crate) fn put_events(&self, events: Vec<Event>) {
    if events.is_empty() {
      return;
    }
    let mut queue = self.queue.lock();
    for event in events {
      if queue.len() == self.capacity {
        queue.pop_front();
      }
      queue.push_back(event);
    }
    self.ready.notify_all();
  }

  /// Wakes every blocked receiver. Events already queued can still be read.
  pub(crate) fn close(&self) {
    let _queue = self.queue.lock();
    self.closed.store(true, Ordering::SeqCst);
    self.ready.notify_all();
  }

  /// Blocks until an event arrives. Returns `None` once the engine is
  /// closed and the queue is drained.
  pub fn recv(&self) -> Option<Event> {
    let mut queue = self.queue.lock();
    loop {
      if let Some(event) = queue.pop_front() {
        return Some(event);
      }
      if self.closed.load(Ordering::SeqCst) {
        return None;
      }
      self.ready.wait(&mut queue);
    }
  }

  pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
    let mut queue = self.queue.lock();
    if queue.is_empty() && !self.closed.load(Ordering::SeqCst) {
      self.ready.wait_for(&mut queue, timeout);
    }
    queue.pop_front()
  }

  pub fn try_recv(&self) -> Option<Event> {
    self.queue.lock().pop_front()
  }

  pub fn len(&self) -> usize {
    self.queue.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
