use num_traits::{FromPrimitive, ToPrimitive};
use speedy::{Readable, Writable};

use super::MessageType;

/// Fixed message header preceding every payload on the wire.
///
/// `msg_type` stays a raw byte here so that a frame with an unknown tag can
/// still be read and then dropped by the dispatch loop; [`message_type`]
/// maps it into the closed enum.
///
/// [`message_type`]: MessageHeader::message_type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Readable, Writable)]
pub struct MessageHeader {
  pub msg_type: u8,
  pub seq: u32,
  pub peer: u32,
}

impl MessageHeader {
  /// Encoded size: type byte plus two ids.
  pub const WIRE_LEN: usize = 9;

  pub fn new(msg_type: MessageType, seq: u32, peer: u32) -> Self {
    Self {
      // the enum is #[repr(u8)], to_u8 cannot fail
      msg_type: msg_type.to_u8().unwrap_or_default(),
      seq,
      peer,
    }
  }

  pub fn message_type(&self) -> Option<MessageType> {
    MessageType::from_u8(self.msg_type)
  }
}
