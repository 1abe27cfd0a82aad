//! End-to-end scenarios driving a full client context against a scripted
//! peer.

use std::{
  cell::{Cell, RefCell},
  collections::VecDeque,
  os::fd::{AsRawFd, OwnedFd},
  rc::Rc,
  time::Duration,
};

use bytes::Bytes;
use microbus::{
  AttrTable, Blob, BusContext, BusObject, MessageFrame, MessageHeader, MessageType,
  ObjectDispatcher, StatusCode, Transport, TransportResult,
};

type Script = Rc<RefCell<VecDeque<MessageFrame>>>;
type Sent = Rc<RefCell<Vec<(MessageHeader, Vec<u8>)>>>;

struct ScriptedPeer {
  script: Script,
  sent: Sent,
}

impl Transport for ScriptedPeer {
  fn send(
    &mut self,
    hdr: MessageHeader,
    payload: &[u8],
    _fd: Option<OwnedFd>,
  ) -> TransportResult<()> {
    self.sent.borrow_mut().push((hdr, payload.to_vec()));
    Ok(())
  }

  fn recv(&mut self, timeout: Option<Duration>) -> TransportResult<Option<MessageFrame>> {
    if let Some(frame) = self.script.borrow_mut().pop_front() {
      return Ok(Some(frame));
    }
    if let Some(t) = timeout {
      if !t.is_zero() {
        std::thread::sleep(t.min(Duration::from_millis(2)));
      }
    }
    Ok(None)
  }

  fn registered(&self) -> bool {
    false
  }

  fn register(&mut self) {}

  fn unregister(&mut self) {}
}

fn scripted_context() -> (BusContext, Script, Sent) {
  let script: Script = Rc::new(RefCell::new(VecDeque::new()));
  let sent: Sent = Rc::new(RefCell::new(Vec::new()));
  let ctx = BusContext::new(ScriptedPeer {
    script: Rc::clone(&script),
    sent: Rc::clone(&sent),
  });
  (ctx, script, sent)
}

fn frame(msg_type: MessageType, seq: u32, peer: u32, payload: Blob) -> MessageFrame {
  MessageFrame {
    hdr: MessageHeader::new(msg_type, seq, peer),
    payload: Bytes::from(payload.encode()),
    fd: None,
  }
}

fn status(seq: u32, peer: u32, code: i32) -> MessageFrame {
  frame(MessageType::Status, seq, peer, Blob::table(vec![Blob::i32(code)]))
}

fn data(seq: u32, peer: u32, payload: Blob) -> MessageFrame {
  frame(
    MessageType::Data,
    seq,
    peer,
    Blob::table(vec![Blob::u32(peer), payload]),
  )
}

/// Scenario 1: a plain invoke answered with STATUS 0.
#[test]
fn simple_invoke_completes_with_zero() {
  let (mut ctx, script, sent) = scripted_context();
  script.borrow_mut().push_back(status(1, 0x10, 0));

  let completions = Rc::new(RefCell::new(Vec::new()));
  let seen = Rc::clone(&completions);
  let mut req = ctx.invoke_async(0x10, "ping", None).unwrap();
  req.set_complete_handler(move |_ctx, ret| seen.borrow_mut().push(ret));

  assert_eq!(ctx.complete_request(req, 1000), StatusCode::Ok);
  assert_eq!(*completions.borrow(), vec![0]);

  let sent = sent.borrow();
  assert_eq!(sent.len(), 1);
  assert_eq!(sent[0].0.message_type(), Some(MessageType::Invoke));
  assert_eq!(sent[0].0.seq, 1);
  assert_eq!(sent[0].0.peer, 0x10);
}

/// Scenario 2: DATA precedes STATUS; the data handler runs exactly once,
/// before completion.
#[test]
fn invoke_with_data_then_status() {
  let (mut ctx, script, _sent) = scripted_context();
  script
    .borrow_mut()
    .push_back(data(1, 0x10, Blob::table(vec![Blob::string("v"), Blob::u32(9)])));
  script.borrow_mut().push_back(status(1, 0x10, 0));

  let events = Rc::new(RefCell::new(Vec::new()));
  let mut req = ctx.invoke_async(0x10, "get", None).unwrap();
  let ev = Rc::clone(&events);
  req.set_data_handler(move |_ctx, _t, payload| {
    assert!(payload.is_some());
    ev.borrow_mut().push("data");
  });
  let ev = Rc::clone(&events);
  req.set_complete_handler(move |_ctx, ret| {
    assert_eq!(ret, 0);
    ev.borrow_mut().push("complete");
  });

  assert_eq!(ctx.complete_request(req, 1000), StatusCode::Ok);
  assert_eq!(*events.borrow(), vec!["data", "complete"]);
}

/// Scenario 3: nothing answers; the bridge returns TIMEOUT and the request
/// is gone.
#[test]
fn invoke_timeout_unlists_the_request() {
  let (mut ctx, _script, _sent) = scripted_context();
  let req = ctx.invoke_async(0x10, "ping", None).unwrap();
  let handle = req.handle();
  assert_eq!(ctx.complete_request(req, 30), StatusCode::Timeout);
  assert!(!ctx.request_pending(&handle));
}

/// Scenario 4: notify fan-out over two subscribers with per-peer statuses.
#[test]
fn notify_fanout_tracks_each_subscriber() {
  let (mut ctx, script, _sent) = scripted_context();
  let obj = BusObject {
    id: 0x20,
    path: "demo".into(),
    signature: None,
  };

  let statuses = Rc::new(RefCell::new(Vec::new()));
  let completed = Rc::new(RefCell::new(Vec::new()));
  let mut req = ctx.notify_async(&obj, "x", None).unwrap();
  let s = Rc::clone(&statuses);
  req.set_notify_status_handler(move |_ctx, id, code| s.borrow_mut().push((id, code)));
  let c = Rc::clone(&completed);
  req.set_notify_complete_handler(move |_ctx, id, ret| c.borrow_mut().push((id, ret)));
  let handle = ctx.complete_request_async(req);

  script.borrow_mut().push_back(frame(
    MessageType::Status,
    1,
    0x20,
    Blob::table(vec![
      Blob::i32(0),
      Blob::Array(vec![Blob::i32(0x21), Blob::i32(0x22)]),
    ]),
  ));
  ctx.handle_event().unwrap();
  assert!(statuses.borrow().is_empty());
  assert!(completed.borrow().is_empty());
  assert!(ctx.request_pending(&handle));

  script.borrow_mut().push_back(status(1, 0x21, 0));
  ctx.handle_event().unwrap();
  assert_eq!(*statuses.borrow(), vec![(1, 0)]);
  assert!(completed.borrow().is_empty());

  script.borrow_mut().push_back(status(1, 0x22, 7));
  ctx.handle_event().unwrap();
  assert_eq!(*statuses.borrow(), vec![(1, 0), (2, 7)]);
  assert_eq!(*completed.borrow(), vec![(0, 0)]);
  assert!(!ctx.request_pending(&handle));
}

struct CountingDispatcher {
  calls: Rc<RefCell<Vec<u32>>>,
}

impl ObjectDispatcher for CountingDispatcher {
  fn process_obj_msg(
    &mut self,
    _ctx: &mut BusContext,
    hdr: &MessageHeader,
    _payload: &Blob,
    _attrs: &AttrTable,
  ) {
    self.calls.borrow_mut().push(hdr.seq);
  }
}

/// Scenario 5: a synchronous invoke issued from inside a data handler
/// processes its own replies inline while an inbound invoke stays deferred
/// until the outer bridge returns.
#[test]
fn reentrant_invoke_inside_data_handler() {
  let (mut ctx, script, _sent) = scripted_context();
  let dispatched = Rc::new(RefCell::new(Vec::new()));
  ctx.set_dispatcher(CountingDispatcher {
    calls: Rc::clone(&dispatched),
  });

  let inner_status = Rc::new(Cell::new(StatusCode::UnknownError));
  let mut outer = ctx.invoke_async(0x10, "outer", None).unwrap();
  let script2 = Rc::clone(&script);
  let inner_seen = Rc::clone(&inner_status);
  let dispatched2 = Rc::clone(&dispatched);
  outer.set_data_handler(move |ctx, _t, _payload| {
    // while the nested call pumps: an inbound invoke for a local object
    // arrives first, then the nested reply
    script2.borrow_mut().push_back(frame(
      MessageType::Invoke,
      88,
      0x99,
      Blob::table(vec![Blob::u32(0x30), Blob::string("m")]),
    ));
    script2.borrow_mut().push_back(status(2, 0x40, 0));
    inner_seen.set(ctx.invoke(0x40, "inner", None, None, 1000));
    // still deferred: the outer bridge has not unwound yet
    assert!(dispatched2.borrow().is_empty());
    assert!(ctx.pending_dispatch());
  });

  script.borrow_mut().push_back(data(1, 0x10, Blob::table(vec![])));
  script.borrow_mut().push_back(status(1, 0x10, 0));
  assert_eq!(ctx.complete_request(outer, 1000), StatusCode::Ok);

  assert_eq!(inner_status.get(), StatusCode::Ok);
  assert_eq!(*dispatched.borrow(), vec![88]);
  assert!(!ctx.pending_dispatch());
}

/// Scenario 6: abort while the dispatcher is inside the data handler; no
/// further callbacks, queued entries discarded.
#[test]
fn abort_during_blocked_delivery() {
  let (mut ctx, script, _sent) = scripted_context();
  let data_calls = Rc::new(Cell::new(0u32));
  let completed = Rc::new(Cell::new(false));

  let mut req = ctx.invoke_async(0x10, "stream", None).unwrap();
  let handle = req.handle();
  let script2 = Rc::clone(&script);
  let calls = Rc::clone(&data_calls);
  req.set_data_handler(move |ctx, _t, _payload| {
    calls.set(calls.get() + 1);
    // queue more data behind our back, then abort: nothing of it may be
    // delivered
    script2.borrow_mut().push_back(data(1, 0x10, Blob::u32(2)));
    ctx.handle_event().unwrap();
    ctx.abort_request(&handle);
  });
  let done = Rc::clone(&completed);
  req.set_complete_handler(move |_ctx, _ret| done.set(true));
  let handle = ctx.complete_request_async(req);

  script.borrow_mut().push_back(data(1, 0x10, Blob::u32(1)));
  ctx.handle_event().unwrap();

  assert_eq!(data_calls.get(), 1);
  assert!(!completed.get());
  assert!(!ctx.request_pending(&handle));
  // abort is idempotent after the fact
  ctx.abort_request(&handle);
}

/// Deferral correctness across multiple deferred messages: each is
/// delivered exactly once, in arrival order, only at depth zero.
#[test]
fn deferred_inbound_preserves_order_and_multiplicity() {
  let (mut ctx, script, _sent) = scripted_context();
  let dispatched = Rc::new(RefCell::new(Vec::new()));
  ctx.set_dispatcher(CountingDispatcher {
    calls: Rc::clone(&dispatched),
  });

  script.borrow_mut().push_back(frame(
    MessageType::Invoke,
    10,
    0x99,
    Blob::table(vec![Blob::u32(0x30), Blob::string("a")]),
  ));
  script.borrow_mut().push_back(frame(
    MessageType::Unsubscribe,
    11,
    0x99,
    Blob::table(vec![]),
  ));
  script.borrow_mut().push_back(frame(
    MessageType::Notify,
    12,
    0x99,
    Blob::table(vec![]),
  ));
  script.borrow_mut().push_back(status(1, 0x10, 0));

  let req = ctx.invoke_async(0x10, "ping", None).unwrap();
  assert_eq!(ctx.complete_request(req, 1000), StatusCode::Ok);

  assert_eq!(*dispatched.borrow(), vec![10, 11, 12]);
}

/// An ancillary descriptor on STATUS is handed over exactly once; without
/// a handler it is closed rather than leaked.
#[test]
fn fd_ownership_transfers_to_the_handler() {
  let (mut ctx, script, _sent) = scripted_context();
  let received: Rc<RefCell<Vec<OwnedFd>>> = Rc::new(RefCell::new(Vec::new()));

  let mut req = ctx.invoke_async(0x10, "open", None).unwrap();
  let sink = Rc::clone(&received);
  req.set_fd_handler(move |_ctx, fd| sink.borrow_mut().push(fd));
  ctx.complete_request_async(req);

  let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
  let raw = fd.as_raw_fd();
  let mut f = status(1, 0x10, 0);
  f.fd = Some(fd);
  script.borrow_mut().push_back(f);
  ctx.handle_event().unwrap();

  let received = received.borrow();
  assert_eq!(received.len(), 1);
  assert_eq!(received[0].as_raw_fd(), raw);

  // unmatched status carrying a descriptor: dropped and closed with the
  // frame, nothing to observe beyond not panicking
  let fd: OwnedFd = std::fs::File::open("/dev/null").unwrap().into();
  let mut f = status(99, 0x10, 0);
  f.fd = Some(fd);
  script.borrow_mut().push_back(f);
  ctx.handle_event().unwrap();
}

/// At-most-one completion across a data delivery racing a status: the
/// status lands while the request is blocked and completion fires only
/// after the delivery unwinds.
#[test]
fn status_during_blocked_delivery_completes_after_unwind() {
  let (mut ctx, script, _sent) = scripted_context();
  let order = Rc::new(RefCell::new(Vec::new()));

  let mut req = ctx.invoke_async(0x10, "get", None).unwrap();
  let script2 = Rc::clone(&script);
  let ev = Rc::clone(&order);
  req.set_data_handler(move |ctx, _t, _payload| {
    ev.borrow_mut().push("data".to_string());
    script2.borrow_mut().push_back(status(1, 0x10, 0));
    ctx.handle_event().unwrap();
    // the status was processed inline but completion must wait for us
    ev.borrow_mut().push("after-nested-pump".to_string());
  });
  let ev = Rc::clone(&order);
  req.set_complete_handler(move |_ctx, ret| ev.borrow_mut().push(format!("complete:{ret}")));
  ctx.complete_request_async(req);

  script.borrow_mut().push_back(data(1, 0x10, Blob::table(vec![])));
  ctx.handle_event().unwrap();

  assert_eq!(
    *order.borrow(),
    vec!["data", "after-nested-pump", "complete:0"]
  );
}
