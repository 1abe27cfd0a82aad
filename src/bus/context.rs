//! The client context: inbound dispatch, reply routing, the synchronous
//! bridge and the public bus operations.

use std::{
  cell::Cell,
  collections::VecDeque,
  os::fd::OwnedFd,
  rc::Rc,
  time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use super::{
  object::{BusObject, EventHandler, ObjectData, RequestData},
  request::{
    take_completion, DataHandler, FdHandler, NotifyState, NotifyStatusHandler, PendingData,
    RawDataHandler, Request, RequestHandle, RequestTable, SavedCompletion, MAX_NOTIFY_PEERS,
  },
};
use crate::{
  blob::Blob,
  messages::{parse_message, AttrId, AttrTable, MessageHeader, MessageType, MAX_MSGLEN},
  status::StatusCode,
  transport::{MessageFrame, Transport, TransportResult},
};

/// Well-known id of the daemon's event broker object.
pub const SYSTEM_OBJECT_EVENT: u32 = 1;

/// Server-side collaborator: receives inbound INVOKE, NOTIFY and
/// UNSUBSCRIBE messages addressed to local objects. Handlers may call back
/// into the context, including starting synchronous requests.
pub trait ObjectDispatcher {
  fn process_obj_msg(
    &mut self,
    ctx: &mut BusContext,
    hdr: &MessageHeader,
    payload: &Blob,
    attrs: &AttrTable,
  );
}

/// An inbound call copied aside because a synchronous bridge was active
/// when it arrived.
struct PendingInbound {
  hdr: MessageHeader,
  payload: Bytes,
}

/// Client connection state. One context is owned by one thread; handlers
/// run on whichever call pumps the transport.
pub struct BusContext {
  transport: Box<dyn Transport>,
  /// Reusable outbound encode buffer, reset at the start of every send.
  buf: BytesMut,
  requests: RequestTable,
  pending_inbound: VecDeque<PendingInbound>,
  request_seq: u32,
  /// Number of synchronous bridges currently on the call stack. While
  /// nonzero, inbound calls are deferred instead of dispatched.
  stack_depth: u32,
  local_id: u32,
  dispatcher: Option<Box<dyn ObjectDispatcher>>,
}

impl BusContext {
  pub fn new(transport: impl Transport + 'static) -> Self {
    Self {
      transport: Box::new(transport),
      buf: BytesMut::new(),
      requests: RequestTable::new(),
      pending_inbound: VecDeque::new(),
      request_seq: 0,
      stack_depth: 0,
      local_id: 0,
      dispatcher: None,
    }
  }

  pub fn set_dispatcher(&mut self, dispatcher: impl ObjectDispatcher + 'static) {
    self.dispatcher = Some(Box::new(dispatcher));
  }

  /// Our own peer id, as announced by the daemon's HELLO. Zero until the
  /// greeting has been pumped.
  pub fn local_id(&self) -> u32 {
    self.local_id
  }

  pub fn stack_depth(&self) -> u32 {
    self.stack_depth
  }

  /// Whether deferred inbound calls are waiting for the next drain.
  pub fn pending_dispatch(&self) -> bool {
    !self.pending_inbound.is_empty()
  }

  /// Marks the transport as driven by the owner's event loop.
  pub fn register_transport(&mut self) {
    self.transport.register();
  }

  pub fn unregister_transport(&mut self) {
    self.transport.unregister();
  }

  // ---------------------------------------------------------------------
  // dispatch loop

  /// Processes every frame the transport has ready, without blocking, then
  /// drains deferred inbound calls if no synchronous bridge is active.
  /// This is the entry point for owners pumping the context from their own
  /// event loop.
  pub fn handle_event(&mut self) -> TransportResult<()> {
    loop {
      match self.transport.recv(Some(Duration::ZERO))? {
        Some(frame) => self.process_msg(frame),
        None => break,
      }
    }
    if self.stack_depth == 0 {
      self.drain_deferred();
    }
    Ok(())
  }

  fn poll_data(&mut self, timeout: Option<Duration>) -> TransportResult<()> {
    if let Some(frame) = self.transport.recv(timeout)? {
      self.process_msg(frame);
    }
    Ok(())
  }

  fn process_msg(&mut self, frame: MessageFrame) {
    let MessageFrame { hdr, payload, fd } = frame;
    let Some(msg_type) = hdr.message_type() else {
      warn!("dropping frame with unknown type tag {}", hdr.msg_type);
      return;
    };
    let root = if payload.is_empty() {
      Blob::Table(Vec::new())
    } else {
      match Blob::parse(&payload) {
        Ok(root) => root,
        Err(e) => {
          warn!("dropping undecodable {:?} frame: {}", msg_type, e);
          return;
        }
      }
    };
    let mut attrs = AttrTable::new();
    parse_message(msg_type, &root, &mut attrs);
    trace!("in {:?} seq={} peer={:#010x}", msg_type, hdr.seq, hdr.peer);

    match msg_type {
      MessageType::Hello => {
        if let Some(id) = attrs.get(AttrId::ObjId).and_then(Blob::as_u32) {
          debug!("connected, local id {:#010x}", id);
          self.local_id = id;
        }
      }
      MessageType::Status | MessageType::Data => {
        self.process_reply(&hdr, msg_type, &root, &payload, fd, &attrs);
      }
      MessageType::Invoke | MessageType::Notify | MessageType::Unsubscribe => {
        if self.stack_depth > 0 {
          trace!(
            "deferring {:?} seq={}, {} synchronous calls active",
            msg_type,
            hdr.seq,
            self.stack_depth
          );
          self.pending_inbound.push_back(PendingInbound { hdr, payload });
        } else {
          self.dispatch_obj_msg(&hdr, &root, &attrs);
        }
      }
      MessageType::Ping
      | MessageType::Lookup
      | MessageType::AddObject
      | MessageType::RemoveObject
      | MessageType::Subscribe => {}
    }
  }

  fn dispatch_obj_msg(&mut self, hdr: &MessageHeader, payload: &Blob, attrs: &AttrTable) {
    let Some(mut dispatcher) = self.dispatcher.take() else {
      debug!("no object dispatcher, dropping seq={} peer={:#010x}", hdr.seq, hdr.peer);
      return;
    };
    dispatcher.process_obj_msg(self, hdr, payload, attrs);
    if self.dispatcher.is_none() {
      self.dispatcher = Some(dispatcher);
    }
  }

  fn drain_deferred(&mut self) {
    while self.stack_depth == 0 {
      let Some(pending) = self.pending_inbound.pop_front() else {
        break;
      };
      let Some(msg_type) = pending.hdr.message_type() else {
        continue;
      };
      let root = if pending.payload.is_empty() {
        Blob::Table(Vec::new())
      } else {
        match Blob::parse(&pending.payload) {
          Ok(root) => root,
          Err(e) => {
            warn!("dropping deferred {:?}: {}", msg_type, e);
            continue;
          }
        }
      };
      let mut attrs = AttrTable::new();
      parse_message(msg_type, &root, &mut attrs);
      self.dispatch_obj_msg(&pending.hdr, &root, &attrs);
    }
  }

  // ---------------------------------------------------------------------
  // reply routing

  fn process_reply(
    &mut self,
    hdr: &MessageHeader,
    msg_type: MessageType,
    root: &Blob,
    raw: &Bytes,
    fd: Option<OwnedFd>,
    attrs: &AttrTable,
  ) {
    let Some((idx, notify_id)) = self.requests.find(hdr.seq, hdr.peer) else {
      // unmatched reply: dropped, and an attached descriptor closes with it
      debug!(
        "no request matches seq={} peer={:#010x}, dropping {:?}",
        hdr.seq, hdr.peer, msg_type
      );
      return;
    };
    self.requests.get_mut(idx).attrs = attrs.clone();

    match msg_type {
      MessageType::Status => {
        if let Some(fd) = fd {
          self.deliver_fd(hdr.seq, fd);
        }
        match notify_id {
          Some(id) => self.process_notify_status(hdr.seq, id),
          None => self.process_req_status(hdr.seq, hdr.peer),
        }
      }
      MessageType::Data => {
        // the fd handler or a nested pump may have dropped the request
        // between the lookup above and this dispatch
        let Some((idx, _)) = self.requests.find(hdr.seq, hdr.peer) else {
          return;
        };
        let req = self.requests.get(idx);
        if !req.blocked && req.on_data.is_none() && req.on_raw_data.is_none() {
          return;
        }
        self.process_req_data(hdr.seq, msg_type, root, raw, attrs);
      }
      _ => {}
    }
  }

  fn process_req_status(&mut self, seq: u32, peer: u32) {
    let Some(idx) = self.requests.position(seq) else {
      return;
    };
    let req = self.requests.get_mut(idx);
    req.peer = peer;
    let ret = req.attrs.status().unwrap_or(StatusCode::InvalidArgument.raw());
    self.set_status_inner(seq, ret);
  }

  fn process_notify_status(&mut self, seq: u32, id: usize) {
    {
      let Some(idx) = self.requests.position(seq) else {
        return;
      };
      let Some(notify) = self.requests.get_mut(idx).notify.as_mut() else {
        return;
      };
      notify.pending &= !(1u32 << id);
    }
    if id == 0 {
      // the daemon's own acknowledgement carries the expanded subscriber
      // list; each one claims a slot and a pending bit
      let Some(idx) = self.requests.position(seq) else {
        return;
      };
      let subscribers: Vec<u32> = self
        .requests
        .get(idx)
        .attrs
        .get(AttrId::Subscribers)
        .and_then(Blob::children)
        .map(|children| children.iter().filter_map(Blob::as_u32).collect())
        .unwrap_or_default();
      if let Some(notify) = self.requests.get_mut(idx).notify.as_mut() {
        let mut slot = 1;
        for peer_id in subscribers {
          notify.pending |= 1 << slot;
          notify.ids[slot] = peer_id;
          slot += 1;
          if slot == MAX_NOTIFY_PEERS + 1 {
            break;
          }
        }
      }
    } else {
      let Some(idx) = self.requests.position(seq) else {
        return;
      };
      let status = self
        .requests
        .get(idx)
        .attrs
        .status()
        .unwrap_or(StatusCode::InvalidArgument.raw());
      if let Some(mut cb) = self.take_notify_status_cb(seq) {
        cb(self, id, status);
        self.restore_notify_status_cb(seq, cb);
      }
    }
    // the per-peer handler may have aborted the request
    let Some(idx) = self.requests.position(seq) else {
      return;
    };
    let done = self
      .requests
      .get(idx)
      .notify
      .as_ref()
      .is_some_and(|n| n.pending == 0);
    if done {
      self.set_status_inner(seq, StatusCode::Ok.raw());
    }
  }

  fn process_req_data(
    &mut self,
    seq: u32,
    msg_type: MessageType,
    root: &Blob,
    raw: &Bytes,
    attrs: &AttrTable,
  ) {
    let Some(idx) = self.requests.position(seq) else {
      return;
    };
    if self.requests.get(idx).blocked {
      // reentrant arrival while a delivery for this request is on the
      // stack: replay it when the delivery unwinds
      trace!("queueing reentrant DATA for seq={}", seq);
      self.requests.get_mut(idx).pending_data.push_back(PendingData {
        msg_type,
        payload: raw.clone(),
      });
      return;
    }
    self.requests.get_mut(idx).blocked = true;
    self.deliver_data(seq, msg_type, root, attrs.get(AttrId::Data));
    self.drain_pending_data(seq);

    let Some(idx) = self.requests.position(seq) else {
      return;
    };
    let req = self.requests.get_mut(idx);
    req.blocked = false;
    if req.cancelled {
      self.requests.remove(seq);
    } else if req.status_msg {
      self.finish_request(seq);
    }
  }

  fn drain_pending_data(&mut self, seq: u32) {
    loop {
      let Some(idx) = self.requests.position(seq) else {
        return;
      };
      let req = self.requests.get_mut(idx);
      if req.cancelled {
        return;
      }
      let Some(entry) = req.pending_data.pop_front() else {
        return;
      };
      let root = if entry.payload.is_empty() {
        Blob::Table(Vec::new())
      } else {
        match Blob::parse(&entry.payload) {
          Ok(root) => root,
          Err(e) => {
            warn!("dropping queued reply for seq={}: {}", seq, e);
            continue;
          }
        }
      };
      let mut attrs = AttrTable::new();
      parse_message(entry.msg_type, &root, &mut attrs);
      self.requests.get_mut(idx).attrs = attrs.clone();
      self.deliver_data(seq, entry.msg_type, &root, attrs.get(AttrId::Data));
    }
  }

  fn deliver_data(&mut self, seq: u32, msg_type: MessageType, root: &Blob, data: Option<&Blob>) {
    if let Some(mut cb) = self.take_raw_data_cb(seq) {
      cb(self, msg_type, root);
      self.restore_raw_data_cb(seq, cb);
    }
    if let Some(mut cb) = self.take_data_cb(seq) {
      cb(self, msg_type, data);
      self.restore_data_cb(seq, cb);
    }
  }

  fn deliver_fd(&mut self, seq: u32, fd: OwnedFd) {
    if let Some(mut cb) = self.take_fd_cb(seq) {
      cb(self, fd);
      self.restore_fd_cb(seq, cb);
    }
    // without a handler the descriptor drops here, which closes it
  }

  // ---------------------------------------------------------------------
  // request state machine

  /// Terminates a tracked request with `status`, firing its completion
  /// unless a delivery for it is still on the stack (the delivery loop
  /// fires it when it unwinds).
  pub fn set_request_status(&mut self, handle: &RequestHandle, status: StatusCode) {
    self.set_status_inner(handle.seq, status.raw());
  }

  fn set_status_inner(&mut self, seq: u32, ret: i32) {
    let Some(idx) = self.requests.position(seq) else {
      return;
    };
    let req = self.requests.get_mut(idx);
    req.tracked = false;
    req.status_msg = true;
    req.status_code = ret;
    if !req.blocked {
      self.finish_request(seq);
    }
  }

  fn finish_request(&mut self, seq: u32) {
    let Some(mut req) = self.requests.remove(seq) else {
      return;
    };
    let status = req.status_code;
    match take_completion(&mut req) {
      SavedCompletion::Plain(cb) => cb(self, status),
      SavedCompletion::Notify(cb) => cb(self, 0, 0),
      SavedCompletion::None => {}
    }
  }

  /// Starts tracking a request: replies can now reach its handlers. The
  /// returned handle identifies the request for abort and status queries.
  pub fn complete_request_async(&mut self, req: Request) -> RequestHandle {
    let handle = req.handle();
    self.requests.insert(req);
    handle
  }

  /// Cancels an outstanding request. Idempotent; after this returns no
  /// handler of the request fires again, and queued replies are discarded.
  pub fn abort_request(&mut self, handle: &RequestHandle) {
    let Some(idx) = self.requests.position(handle.seq) else {
      return;
    };
    let req = self.requests.get_mut(idx);
    if !req.tracked {
      return;
    }
    req.cancelled = true;
    req.tracked = false;
    req.pending_data.clear();
    if !req.blocked {
      self.requests.remove(handle.seq);
    }
  }

  /// Whether a reply is still expected for this request.
  pub fn request_pending(&self, handle: &RequestHandle) -> bool {
    self.requests.is_tracked(handle.seq)
  }

  // ---------------------------------------------------------------------
  // synchronous bridge

  /// Tracks `req` and pumps the transport until it completes or
  /// `timeout_ms` expires (`0` waits indefinitely). The request's own
  /// completion handler fires with the terminal status before this
  /// returns.
  ///
  /// While the pump runs, replies for other requests are processed inline,
  /// but inbound calls to local objects are deferred until the outermost
  /// bridge unwinds: their handlers may mutate the object registry, which
  /// must not happen under a live callback frame.
  pub fn complete_request(&mut self, mut req: Request, timeout_ms: i32) -> StatusCode {
    let seq = req.seq;
    let saved = take_completion(&mut req);
    let done: Rc<Cell<Option<i32>>> = Rc::new(Cell::new(None));
    let recorder = Rc::clone(&done);
    req.on_complete = Some(Box::new(move |_ctx: &mut BusContext, ret: i32| {
      recorder.set(Some(ret));
    }));
    self.complete_request_async(req);

    let registered = self.transport.registered();
    let deadline =
      (timeout_ms > 0).then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));

    self.stack_depth += 1;
    while done.get().is_none() {
      let wait = match deadline {
        Some(end) => {
          let left = end.saturating_duration_since(Instant::now());
          if left.is_zero() {
            self.set_status_inner(seq, StatusCode::Timeout.raw());
            break;
          }
          Some(left)
        }
        None => None,
      };
      if let Err(e) = self.poll_data(wait) {
        warn!("transport failed while waiting for seq={}: {}", seq, e);
        self.set_status_inner(seq, StatusCode::ConnectionFailed.raw());
        break;
      }
    }
    self.stack_depth -= 1;

    let status = done.get().unwrap_or(StatusCode::NoData.raw());
    match saved {
      SavedCompletion::Plain(cb) => cb(self, status),
      SavedCompletion::Notify(cb) => cb(self, 0, 0),
      SavedCompletion::None => {}
    }
    if !registered {
      self.transport.unregister();
      if self.stack_depth == 0 {
        self.drain_deferred();
      }
    }
    StatusCode::from_raw(status)
  }

  // ---------------------------------------------------------------------
  // send path

  fn send_msg(
    &mut self,
    seq: u32,
    payload: &Blob,
    msg_type: MessageType,
    peer: u32,
    fd: Option<OwnedFd>,
  ) -> Result<(), StatusCode> {
    if payload.padded_len() > MAX_MSGLEN {
      warn!(
        "outbound {:?} payload of {} bytes exceeds the maximum message length",
        msg_type,
        payload.padded_len()
      );
      return Err(StatusCode::InvalidArgument);
    }
    self.buf.clear();
    payload.encode_into(&mut self.buf);
    let hdr = MessageHeader::new(msg_type, seq, peer);
    self.transport.send(hdr, &self.buf, fd).map_err(|e| {
      warn!("transport send failed: {}", e);
      StatusCode::InvalidArgument
    })
  }

  /// Assigns the next sequence number and sends the frame. The returned
  /// request is not yet tracked; replies only reach it after
  /// [`complete_request_async`](Self::complete_request_async).
  fn start_request(
    &mut self,
    payload: &Blob,
    msg_type: MessageType,
    peer: u32,
  ) -> Result<Request, StatusCode> {
    if payload.padded_len() > MAX_MSGLEN {
      return Err(StatusCode::InvalidArgument);
    }
    self.request_seq = self.request_seq.wrapping_add(1);
    let seq = self.request_seq;
    self.send_msg(seq, payload, msg_type, peer, None)?;
    Ok(Request::new(seq, peer))
  }

  // ---------------------------------------------------------------------
  // public operations

  /// Starts a method invocation on object `obj`. Attach handlers to the
  /// returned request, then track or complete it.
  pub fn invoke_async(
    &mut self,
    obj: u32,
    method: &str,
    msg: Option<&Blob>,
  ) -> Result<Request, StatusCode> {
    let mut args = vec![Blob::u32(obj), Blob::string(method)];
    if let Some(msg) = msg {
      args.push(msg.clone());
    }
    self.start_request(&Blob::Table(args), MessageType::Invoke, obj)
  }

  /// Invokes `method` on `obj` and blocks until the reply status arrives
  /// or `timeout_ms` expires.
  pub fn invoke(
    &mut self,
    obj: u32,
    method: &str,
    msg: Option<&Blob>,
    on_data: Option<DataHandler>,
    timeout_ms: i32,
  ) -> StatusCode {
    let mut req = match self.invoke_async(obj, method, msg) {
      Ok(req) => req,
      Err(status) => return status,
    };
    req.on_data = on_data;
    self.complete_request(req, timeout_ms)
  }

  /// Starts a notification on `obj` to its current subscribers, expecting
  /// one status per subscriber. The daemon answers first with the expanded
  /// subscriber list.
  pub fn notify_async(
    &mut self,
    obj: &BusObject,
    ty: &str,
    msg: Option<&Blob>,
  ) -> Result<Request, StatusCode> {
    self.notify_start(obj.id, ty, msg, true)
  }

  fn notify_start(
    &mut self,
    obj_id: u32,
    ty: &str,
    msg: Option<&Blob>,
    reply: bool,
  ) -> Result<Request, StatusCode> {
    let mut args = vec![Blob::u32(obj_id), Blob::string(ty)];
    if reply {
      args.push(Blob::bool(true));
    }
    if let Some(msg) = msg {
      args.push(msg.clone());
    }
    let mut req = self.start_request(&Blob::Table(args), MessageType::Notify, obj_id)?;
    // the daemon's status comes first and owns bit 0 of the mask
    req.notify = Some(NotifyState::new(obj_id));
    Ok(req)
  }

  /// Notifies subscribers of `obj`. With `timeout_ms < 0` this is fire and
  /// forget: no reply is requested and the request is abandoned
  /// immediately. Otherwise blocks until every subscriber answered or the
  /// timeout expires.
  pub fn notify(
    &mut self,
    obj: &BusObject,
    ty: &str,
    msg: Option<&Blob>,
    timeout_ms: i32,
  ) -> StatusCode {
    if timeout_ms < 0 {
      // never tracked: replies, if any, will not match anything
      return match self.notify_start(obj.id, ty, msg, false) {
        Ok(_req) => StatusCode::Ok,
        Err(status) => status,
      };
    }
    match self.notify_start(obj.id, ty, msg, true) {
      Ok(req) => self.complete_request(req, timeout_ms),
      Err(status) => status,
    }
  }

  /// Enumerates objects registered on the bus, optionally below `path`.
  /// `cb` runs once per complete object record.
  pub fn lookup(
    &mut self,
    path: Option<&str>,
    cb: impl FnMut(&mut BusContext, &ObjectData) + 'static,
  ) -> StatusCode {
    let mut req = match self.lookup_start(path) {
      Ok(req) => req,
      Err(status) => return status,
    };
    let mut cb = cb;
    req.set_raw_data_handler(move |ctx, _msg_type, payload| {
      if let Some(obj) = ObjectData::from_reply(payload) {
        cb(ctx, &obj);
      }
    });
    self.complete_request(req, 0)
  }

  /// Resolves the id of the object registered at `path`.
  pub fn lookup_id(&mut self, path: Option<&str>) -> Result<u32, StatusCode> {
    let mut req = self.lookup_start(path)?;
    let found: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    let slot = Rc::clone(&found);
    req.set_raw_data_handler(move |_ctx, _msg_type, payload| {
      // the record is the root's first child; its second entry is the id
      let id = payload
        .children()
        .and_then(<[Blob]>::first)
        .and_then(Blob::children)
        .and_then(|fields| fields.get(1))
        .and_then(Blob::as_u32);
      if let Some(id) = id {
        slot.set(id);
      }
    });
    let status = self.complete_request(req, 0);
    if status.is_ok() {
      Ok(found.get())
    } else {
      Err(status)
    }
  }

  fn lookup_start(&mut self, path: Option<&str>) -> Result<Request, StatusCode> {
    let args = match path {
      Some(path) => vec![Blob::string(path)],
      None => Vec::new(),
    };
    self.start_request(&Blob::Table(args), MessageType::Lookup, 0)
  }

  /// Registers a local object under `path` and returns the id the daemon
  /// assigned.
  pub fn add_object(
    &mut self,
    path: &str,
    signature: Option<&Blob>,
  ) -> Result<u32, StatusCode> {
    let mut args = vec![Blob::string(path)];
    if let Some(signature) = signature {
      args.push(signature.clone());
    }
    let mut req = self.start_request(&Blob::Table(args), MessageType::AddObject, 0)?;
    let assigned: Rc<Cell<u32>> = Rc::new(Cell::new(0));
    let record = Rc::clone(&assigned);
    req.set_raw_data_handler(move |_ctx, _msg_type, payload| {
      if let Some(id) = payload.children().and_then(<[Blob]>::first).and_then(Blob::as_u32) {
        record.set(id);
      }
    });
    let status = self.complete_request(req, 0);
    if !status.is_ok() {
      return Err(status);
    }
    let id = assigned.get();
    if id == 0 {
      return Err(StatusCode::NoData);
    }
    Ok(id)
  }

  /// Drops a local object registration.
  pub fn remove_object(&mut self, id: u32) -> StatusCode {
    self.simple_request(MessageType::RemoveObject, id, 0)
  }

  /// Starts watching notifications of the object `target`.
  pub fn subscribe(&mut self, target: u32) -> StatusCode {
    self.simple_request(MessageType::Subscribe, target, target)
  }

  pub fn unsubscribe(&mut self, target: u32) -> StatusCode {
    self.simple_request(MessageType::Unsubscribe, target, target)
  }

  fn simple_request(&mut self, msg_type: MessageType, target: u32, peer: u32) -> StatusCode {
    match self.start_request(&Blob::table(vec![Blob::u32(target)]), msg_type, peer) {
      Ok(req) => self.complete_request(req, 0),
      Err(status) => status,
    }
  }

  /// Broadcasts an event through the daemon's event broker.
  pub fn send_event(&mut self, id: &str, data: &Blob) -> StatusCode {
    let payload = Blob::table(vec![
      Blob::u32(SYSTEM_OBJECT_EVENT),
      Blob::string("send"),
      Blob::table(vec![
        Blob::string("id"),
        Blob::string(id),
        Blob::string("data"),
        data.clone(),
      ]),
    ]);
    match self.start_request(&payload, MessageType::Invoke, SYSTEM_OBJECT_EVENT) {
      Ok(req) => self.complete_request(req, 0),
      Err(status) => status,
    }
  }

  /// Subscribes `ev` to broadcast events, registering its object first if
  /// it has no id yet. `pattern` filters event ids on the daemon side.
  pub fn register_event_handler(
    &mut self,
    ev: &mut EventHandler,
    pattern: Option<&str>,
  ) -> StatusCode {
    if ev.obj.id == 0 {
      match self.add_object(&ev.obj.path, ev.obj.signature.as_ref()) {
        Ok(id) => ev.obj.id = id,
        Err(status) => return status,
      }
    }
    let mut args = vec![Blob::string("object"), Blob::u32(ev.obj.id)];
    if let Some(pattern) = pattern {
      args.push(Blob::string("pattern"));
      args.push(Blob::string(pattern));
    }
    self.invoke(
      SYSTEM_OBJECT_EVENT,
      "register",
      Some(&Blob::Table(args)),
      None,
      0,
    )
  }

  /// Streams a DATA reply to a deferred inbound request.
  pub fn send_reply(&mut self, req: &RequestData, msg: &Blob) -> StatusCode {
    let payload = Blob::table(vec![Blob::u32(req.object), msg.clone()]);
    match self.send_msg(req.seq, &payload, MessageType::Data, req.peer, None) {
      Ok(()) => StatusCode::Ok,
      Err(status) => status,
    }
  }

  /// Sends the final STATUS of a deferred inbound request back to its
  /// caller, consuming the token.
  pub fn complete_deferred_request(&mut self, req: RequestData, ret: i32) -> StatusCode {
    let payload = Blob::table(vec![Blob::i32(ret), Blob::u32(req.object)]);
    match self.send_msg(req.seq, &payload, MessageType::Status, req.peer, req.fd) {
      Ok(()) => StatusCode::Ok,
      Err(status) => status,
    }
  }

  // ---------------------------------------------------------------------
  // handler take/restore
  //
  // Handlers are moved out of the record for the duration of a call so a
  // reentrant pump can neither run them twice nor observe them missing as
  // a cancellation. Restore keeps a handler the callback installed itself
  // and never resurrects one on a cancelled request.

  fn take_raw_data_cb(&mut self, seq: u32) -> Option<RawDataHandler> {
    let idx = self.requests.position(seq)?;
    let req = self.requests.get_mut(idx);
    if req.cancelled {
      return None;
    }
    req.on_raw_data.take()
  }

  fn restore_raw_data_cb(&mut self, seq: u32, cb: RawDataHandler) {
    if let Some(idx) = self.requests.position(seq) {
      let req = self.requests.get_mut(idx);
      if !req.cancelled && req.on_raw_data.is_none() {
        req.on_raw_data = Some(cb);
      }
    }
  }

  fn take_data_cb(&mut self, seq: u32) -> Option<DataHandler> {
    let idx = self.requests.position(seq)?;
    let req = self.requests.get_mut(idx);
    if req.cancelled {
      return None;
    }
    req.on_data.take()
  }

  fn restore_data_cb(&mut self, seq: u32, cb: DataHandler) {
    if let Some(idx) = self.requests.position(seq) {
      let req = self.requests.get_mut(idx);
      if !req.cancelled && req.on_data.is_none() {
        req.on_data = Some(cb);
      }
    }
  }

  fn take_fd_cb(&mut self, seq: u32) -> Option<FdHandler> {
    let idx = self.requests.position(seq)?;
    let req = self.requests.get_mut(idx);
    if req.cancelled {
      return None;
    }
    req.on_fd.take()
  }

  fn restore_fd_cb(&mut self, seq: u32, cb: FdHandler) {
    if let Some(idx) = self.requests.position(seq) {
      let req = self.requests.get_mut(idx);
      if !req.cancelled && req.on_fd.is_none() {
        req.on_fd = Some(cb);
      }
    }
  }

  fn take_notify_status_cb(&mut self, seq: u32) -> Option<NotifyStatusHandler> {
    let idx = self.requests.position(seq)?;
    let req = self.requests.get_mut(idx);
    if req.cancelled {
      return None;
    }
    req.notify.as_mut().and_then(|n| n.on_status.take())
  }

  fn restore_notify_status_cb(&mut self, seq: u32, cb: NotifyStatusHandler) {
    if let Some(idx) = self.requests.position(seq) {
      let req = self.requests.get_mut(idx);
      if req.cancelled {
        return;
      }
      if let Some(n) = req.notify.as_mut() {
        if n.on_status.is_none() {
          n.on_status = Some(cb);
        }
      }
    }
  }

  #[cfg(test)]
  pub(crate) fn requests(&self) -> &RequestTable {
    &self.requests
  }
}
