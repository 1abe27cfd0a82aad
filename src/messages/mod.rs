//! Wire-level message definitions: the fixed frame header, the closed
//! message type enum and the per-type attribute slot extraction.

mod attr;
mod header;
mod message_type;

pub use attr::{parse_message, AttrId, AttrTable, ATTR_MAX};
pub use header::MessageHeader;
pub use message_type::MessageType;

/// Upper bound on the padded length of one encoded message payload.
pub const MAX_MSGLEN: usize = 1_048_576;
