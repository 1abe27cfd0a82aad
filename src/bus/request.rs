//! Outstanding request records and the registry that correlates replies
//! with them.
//!
//! A request is "tracked" while a reply is still expected; only tracked
//! records are visible to [`RequestTable::find`]. Records stay in storage
//! past untracking while a data delivery is in progress (`blocked`), so the
//! delivery loop can observe a terminal status or a cancellation that
//! happened inside one of its own callbacks.

use std::{collections::VecDeque, os::fd::OwnedFd};

use bytes::Bytes;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::context::BusContext;
use crate::{
  blob::Blob,
  messages::{AttrTable, MessageType},
};

/// Size of the notify fan-out bitset minus one: the daemon slot is bit 0,
/// subscriber replies occupy bits `1..=MAX_NOTIFY_PEERS`.
pub const MAX_NOTIFY_PEERS: usize = 31;

pub type DataHandler = Box<dyn FnMut(&mut BusContext, MessageType, Option<&Blob>)>;
pub type RawDataHandler = Box<dyn FnMut(&mut BusContext, MessageType, &Blob)>;
pub type CompleteHandler = Box<dyn FnOnce(&mut BusContext, i32)>;
pub type FdHandler = Box<dyn FnMut(&mut BusContext, OwnedFd)>;
pub type NotifyStatusHandler = Box<dyn FnMut(&mut BusContext, usize, i32)>;
pub type NotifyCompleteHandler = Box<dyn FnOnce(&mut BusContext, u32, i32)>;

/// Copyable identity of a started request, valid for the owning context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
  pub(crate) seq: u32,
}

impl RequestHandle {
  pub fn seq(&self) -> u32 {
    self.seq
  }
}

/// DATA that arrived for a request while a delivery to the same request was
/// already on the stack. Replayed, oldest first, when the delivery unwinds.
#[derive(Debug)]
pub(crate) struct PendingData {
  pub msg_type: MessageType,
  pub payload: Bytes,
}

/// Fan-out state of a notify request.
///
/// Bit 0 of `pending` is the daemon's own acknowledgement; its STATUS reply
/// enumerates the current subscribers, which claim bits `1..`. A bit clears
/// when the matching peer answers, and the request completes when the mask
/// empties.
pub(crate) struct NotifyState {
  pub pending: u32,
  pub ids: [u32; MAX_NOTIFY_PEERS + 1],
  pub on_status: Option<NotifyStatusHandler>,
  pub on_complete: Option<NotifyCompleteHandler>,
}

impl NotifyState {
  pub(crate) fn new(daemon_id: u32) -> Self {
    let mut ids = [0u32; MAX_NOTIFY_PEERS + 1];
    ids[0] = daemon_id;
    Self {
      pending: 1,
      ids,
      on_status: None,
      on_complete: None,
    }
  }

  /// Index of the pending peer `objid` answered for, scanning set bits
  /// lowest first.
  pub(crate) fn notify_id(&self, objid: u32) -> Option<usize> {
    let mut pending = self.pending;
    let mut i = 0;
    while pending != 0 {
      if pending & 1 == 1 && self.ids[i] == objid {
        return Some(i);
      }
      pending >>= 1;
      i += 1;
    }
    None
  }
}

/// One outbound call awaiting its reply.
///
/// Constructed by the `*_async` operations on [`BusContext`]; the caller
/// attaches handlers and then either hands the request back for tracking
/// ([`BusContext::complete_request_async`]) or drives it to completion
/// synchronously ([`BusContext::complete_request`]).
pub struct Request {
  pub(crate) seq: u32,
  pub(crate) peer: u32,
  pub(crate) tracked: bool,
  pub(crate) cancelled: bool,
  pub(crate) blocked: bool,
  pub(crate) status_msg: bool,
  pub(crate) status_code: i32,
  pub(crate) attrs: AttrTable,
  pub(crate) pending_data: VecDeque<PendingData>,
  pub(crate) on_data: Option<DataHandler>,
  pub(crate) on_raw_data: Option<RawDataHandler>,
  pub(crate) on_complete: Option<CompleteHandler>,
  pub(crate) on_fd: Option<FdHandler>,
  pub(crate) notify: Option<NotifyState>,
}

impl Request {
  pub(crate) fn new(seq: u32, peer: u32) -> Self {
    Self {
      seq,
      peer,
      tracked: false,
      cancelled: false,
      blocked: false,
      status_msg: false,
      status_code: 0,
      attrs: AttrTable::new(),
      pending_data: VecDeque::new(),
      on_data: None,
      on_raw_data: None,
      on_complete: None,
      on_fd: None,
      notify: None,
    }
  }

  pub fn seq(&self) -> u32 {
    self.seq
  }

  pub fn peer(&self) -> u32 {
    self.peer
  }

  pub fn handle(&self) -> RequestHandle {
    RequestHandle { seq: self.seq }
  }

  pub fn is_notify(&self) -> bool {
    self.notify.is_some()
  }

  /// Called once per DATA reply with the extracted DATA slot.
  pub fn set_data_handler(
    &mut self,
    cb: impl FnMut(&mut BusContext, MessageType, Option<&Blob>) + 'static,
  ) {
    self.on_data = Some(Box::new(cb));
  }

  /// Called once per DATA reply with the whole payload root, before the
  /// data handler.
  pub fn set_raw_data_handler(
    &mut self,
    cb: impl FnMut(&mut BusContext, MessageType, &Blob) + 'static,
  ) {
    self.on_raw_data = Some(Box::new(cb));
  }

  /// Called at most once, with the terminal status.
  pub fn set_complete_handler(&mut self, cb: impl FnOnce(&mut BusContext, i32) + 'static) {
    self.on_complete = Some(Box::new(cb));
  }

  /// Receives an ancillary descriptor delivered with a STATUS reply;
  /// without a handler the descriptor is closed.
  pub fn set_fd_handler(&mut self, cb: impl FnMut(&mut BusContext, OwnedFd) + 'static) {
    self.on_fd = Some(Box::new(cb));
  }

  /// Per-subscriber status of a notify request: `(index, status)`. Ignored
  /// on non-notify requests.
  pub fn set_notify_status_handler(
    &mut self,
    cb: impl FnMut(&mut BusContext, usize, i32) + 'static,
  ) {
    if let Some(n) = self.notify.as_mut() {
      n.on_status = Some(Box::new(cb));
    }
  }

  /// Completion of a notify request, fired when the pending mask empties or
  /// the synchronous bridge unwinds. Ignored on non-notify requests.
  pub fn set_notify_complete_handler(
    &mut self,
    cb: impl FnOnce(&mut BusContext, u32, i32) + 'static,
  ) {
    if let Some(n) = self.notify.as_mut() {
      n.on_complete = Some(Box::new(cb));
    }
  }
}

impl std::fmt::Debug for Request {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("seq", &self.seq)
      .field("peer", &self.peer)
      .field("tracked", &self.tracked)
      .field("cancelled", &self.cancelled)
      .field("blocked", &self.blocked)
      .field("status_msg", &self.status_msg)
      .field("status_code", &self.status_code)
      .field("is_notify", &self.notify.is_some())
      .finish_non_exhaustive()
  }
}

/// The user-visible completion of a request, taken out of the record before
/// it can fire so a reentrant callback cannot fire it again.
pub(crate) enum SavedCompletion {
  None,
  Plain(CompleteHandler),
  Notify(NotifyCompleteHandler),
}

pub(crate) fn take_completion(req: &mut Request) -> SavedCompletion {
  if let Some(cb) = req.on_complete.take() {
    return SavedCompletion::Plain(cb);
  }
  if let Some(cb) = req.notify.as_mut().and_then(|n| n.on_complete.take()) {
    return SavedCompletion::Notify(cb);
  }
  SavedCompletion::None
}

/// Insertion-ordered store of request records.
#[derive(Default)]
pub(crate) struct RequestTable {
  entries: Vec<Request>,
}

impl RequestTable {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  /// Tracks a record. Idempotent: a record whose sequence number is already
  /// stored is left alone.
  pub(crate) fn insert(&mut self, mut req: Request) {
    if self.position(req.seq).is_some() {
      return;
    }
    req.tracked = true;
    self.entries.push(req);
  }

  /// Index of the stored record with this sequence number, tracked or not.
  pub(crate) fn position(&self, seq: u32) -> Option<usize> {
    self.entries.iter().position(|r| r.seq == seq)
  }

  pub(crate) fn get(&self, idx: usize) -> &Request {
    &self.entries[idx]
  }

  pub(crate) fn get_mut(&mut self, idx: usize) -> &mut Request {
    &mut self.entries[idx]
  }

  /// First tracked record matching a reply addressed `(seq, peer)`, in
  /// insertion order. For a notify record the peer must be one of the still
  /// pending subscribers; the matched slot index comes back alongside.
  pub(crate) fn find(&self, seq: u32, peer: u32) -> Option<(usize, Option<usize>)> {
    for (idx, req) in self.entries.iter().enumerate() {
      if !req.tracked || req.seq != seq {
        continue;
      }
      match &req.notify {
        Some(n) => {
          if n.pending == 0 {
            continue;
          }
          if let Some(id) = n.notify_id(peer) {
            return Some((idx, Some(id)));
          }
        }
        None => {
          if req.peer == peer {
            return Some((idx, None));
          }
        }
      }
    }
    None
  }

  /// Takes a record off the list without dropping it. Idempotent.
  pub(crate) fn untrack(&mut self, seq: u32) {
    if let Some(idx) = self.position(seq) {
      self.entries[idx].tracked = false;
    }
  }

  pub(crate) fn remove(&mut self, seq: u32) -> Option<Request> {
    self.position(seq).map(|idx| self.entries.remove(idx))
  }

  pub(crate) fn is_tracked(&self, seq: u32) -> bool {
    self.position(seq).is_some_and(|idx| self.entries[idx].tracked)
  }

  #[cfg(test)]
  pub(crate) fn tracked_count(&self) -> usize {
    self.entries.iter().filter(|r| r.tracked).count()
  }

  #[cfg(test)]
  pub(crate) fn stored_count(&self) -> usize {
    self.entries.len()
  }
}
