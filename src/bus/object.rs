//! Object descriptions and the deferred-request token.

use std::os::fd::OwnedFd;

use crate::blob::Blob;

/// A local object as registered (or about to be registered) on the bus.
/// `id` is zero until the daemon assigns one.
#[derive(Debug, Clone, Default)]
pub struct BusObject {
  pub id: u32,
  pub path: String,
  pub signature: Option<Blob>,
}

impl BusObject {
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      id: 0,
      path: path.into(),
      signature: None,
    }
  }
}

/// A local object registered to receive broadcast events. Event delivery
/// itself arrives through the server-side dispatcher like any other
/// invocation; this only carries the registration state.
#[derive(Debug, Clone, Default)]
pub struct EventHandler {
  pub obj: BusObject,
}

impl EventHandler {
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      obj: BusObject::new(path),
    }
  }
}

/// One object record from a lookup reply.
#[derive(Debug, Clone)]
pub struct ObjectData {
  pub id: u32,
  pub path: String,
  pub type_id: u32,
  pub signature: Option<Blob>,
  pub client_id: u32,
}

impl ObjectData {
  /// Parses a lookup DATA payload: the root's first child is a record of
  /// alternating keys and values. Returns `None` unless the record carries
  /// the mandatory `id`, `path` and `type` fields.
  pub(crate) fn from_reply(payload: &Blob) -> Option<ObjectData> {
    let record = payload.children()?.first()?;
    let mut id = 0u32;
    let mut path = None;
    let mut type_id = 0u32;
    let mut signature = None;
    let mut client_id = 0u32;
    for (key, value) in record.pairs() {
      match key {
        "id" => id = value.as_u32().unwrap_or(0),
        "path" => path = value.as_str().map(str::to_owned),
        "type" => type_id = value.as_u32().unwrap_or(0),
        "methods" => signature = Some(value.clone()),
        "client" => client_id = value.as_u32().unwrap_or(0),
        _ => {}
      }
    }
    let path = path.filter(|p| !p.is_empty())?;
    if id == 0 || type_id == 0 {
      return None;
    }
    Some(ObjectData {
      id,
      path,
      type_id,
      signature,
      client_id,
    })
  }
}

/// Identity of an inbound request whose reply was deferred by its handler.
/// `send_reply` streams DATA back on the original sequence number;
/// `complete_deferred_request` consumes the token and sends the final
/// STATUS (passing `fd` along when the transport supports it).
#[derive(Debug)]
pub struct RequestData {
  pub object: u32,
  pub peer: u32,
  pub seq: u32,
  pub fd: Option<OwnedFd>,
}

impl RequestData {
  pub fn new(object: u32, peer: u32, seq: u32) -> Self {
    Self {
      object,
      peer,
      seq,
      fd: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(fields: Vec<Blob>) -> Blob {
    Blob::table(vec![Blob::table(fields)])
  }

  #[test]
  fn from_reply_parses_complete_record() {
    let payload = record(vec![
      Blob::string("id"),
      Blob::u32(0x42),
      Blob::string("path"),
      Blob::string("network.interface"),
      Blob::string("type"),
      Blob::u32(3),
      Blob::string("methods"),
      Blob::table(vec![]),
      Blob::string("client"),
      Blob::u32(0x77),
    ]);
    let obj = ObjectData::from_reply(&payload).expect("complete record");
    assert_eq!(obj.id, 0x42);
    assert_eq!(obj.path, "network.interface");
    assert_eq!(obj.type_id, 3);
    assert!(obj.signature.is_some());
    assert_eq!(obj.client_id, 0x77);
  }

  #[test]
  fn from_reply_requires_id_path_and_type() {
    let missing_type = record(vec![
      Blob::string("id"),
      Blob::u32(0x42),
      Blob::string("path"),
      Blob::string("x"),
    ]);
    assert!(ObjectData::from_reply(&missing_type).is_none());

    let zero_id = record(vec![
      Blob::string("id"),
      Blob::u32(0),
      Blob::string("path"),
      Blob::string("x"),
      Blob::string("type"),
      Blob::u32(1),
    ]);
    assert!(ObjectData::from_reply(&zero_id).is_none());

    assert!(ObjectData::from_reply(&Blob::table(vec![])).is_none());
    assert!(ObjectData::from_reply(&Blob::i32(1)).is_none());
  }

  #[test]
  fn from_reply_ignores_unknown_keys() {
    let payload = record(vec![
      Blob::string("id"),
      Blob::u32(1),
      Blob::string("path"),
      Blob::string("p"),
      Blob::string("type"),
      Blob::u32(1),
      Blob::string("future-field"),
      Blob::string("whatever"),
    ]);
    assert!(ObjectData::from_reply(&payload).is_some());
  }
}
