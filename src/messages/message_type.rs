use num_derive::{FromPrimitive, ToPrimitive};

/// Message type tags carried in the frame header.
///
/// STATUS and DATA are replies routed to outstanding requests; INVOKE,
/// NOTIFY and UNSUBSCRIBE address local objects and go through the
/// server-side dispatcher. The rest are connection and registry management.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum MessageType {
  Hello = 0,
  Status = 1,
  Data = 2,
  Ping = 3,
  Lookup = 4,
  Invoke = 5,
  AddObject = 6,
  RemoveObject = 7,
  Subscribe = 8,
  Unsubscribe = 9,
  Notify = 10,
}

#[cfg(test)]
mod tests {
  use num_traits::{FromPrimitive, ToPrimitive};

  use super::*;

  #[test]
  fn tag_values_are_stable() {
    assert_eq!(MessageType::Hello.to_u8(), Some(0));
    assert_eq!(MessageType::Status.to_u8(), Some(1));
    assert_eq!(MessageType::Data.to_u8(), Some(2));
    assert_eq!(MessageType::Notify.to_u8(), Some(10));
    assert_eq!(MessageType::from_u8(4), Some(MessageType::Lookup));
    assert_eq!(MessageType::from_u8(11), None);
  }
}
