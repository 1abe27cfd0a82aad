use num_derive::{FromPrimitive, ToPrimitive};
use static_assertions::const_assert_eq;

use super::MessageType;
use crate::blob::Blob;

/// Attribute slots a reply or an inbound call can carry. Each message type
/// populates a fixed subset, see [`parse_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(usize)]
pub enum AttrId {
  ObjId = 0,
  ObjPath = 1,
  Status = 2,
  Data = 3,
  Method = 4,
  Signature = 5,
  Subscribers = 6,
  ObjType = 7,
}

/// Size of the attribute slot table.
pub const ATTR_MAX: usize = 8;

const_assert_eq!(AttrId::ObjType as usize + 1, ATTR_MAX);

/// Fixed-slot attribute table filled once per inbound message and copied
/// into the matched request's scratch slots.
#[derive(Debug, Clone, Default)]
pub struct AttrTable {
  slots: [Option<Blob>; ATTR_MAX],
}

impl AttrTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, id: AttrId) -> Option<&Blob> {
    self.slots[id as usize].as_ref()
  }

  pub fn set(&mut self, id: AttrId, attr: Blob) {
    self.slots[id as usize] = Some(attr);
  }

  pub fn clear(&mut self) {
    self.slots = Default::default();
  }

  /// STATUS slot as a wire status, if present and of integer type.
  pub fn status(&self) -> Option<i32> {
    self.get(AttrId::Status).and_then(Blob::as_i32)
  }
}

/// Fills `table` from the children of the payload root, strictly
/// positionally per message type. Missing children leave their slots empty;
/// consumers treat an absent required slot as "not provided".
///
/// A STATUS reply to a NOTIFY additionally carries the expanded subscriber
/// list as its second child, which is how the daemon seeds the per-peer
/// fan-out tracking.
pub fn parse_message(msg_type: MessageType, payload: &Blob, table: &mut AttrTable) {
  table.clear();
  let children = payload.children().unwrap_or(&[]);
  let mut assign = |n: usize, id: AttrId| {
    if let Some(child) = children.get(n) {
      table.set(id, child.clone());
    }
  };
  match msg_type {
    MessageType::Hello => assign(0, AttrId::ObjId),
    MessageType::Status => {
      assign(0, AttrId::Status);
      assign(1, AttrId::Subscribers);
    }
    MessageType::Data => {
      assign(0, AttrId::ObjId);
      assign(1, AttrId::Data);
    }
    MessageType::Lookup => assign(0, AttrId::ObjPath),
    MessageType::Invoke => {
      assign(0, AttrId::ObjId);
      assign(1, AttrId::Method);
      assign(2, AttrId::Data);
    }
    MessageType::AddObject => {
      assign(0, AttrId::ObjPath);
      assign(1, AttrId::Signature);
    }
    MessageType::Ping
    | MessageType::RemoveObject
    | MessageType::Subscribe
    | MessageType::Unsubscribe
    | MessageType::Notify => {}
  }
}
