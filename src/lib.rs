//! Client runtime for the microbus local IPC protocol.
//!
//! A [`BusContext`] multiplexes many outstanding requests — method
//! invocations, object lookups, event subscriptions and multi-peer
//! notifications — over a single transport connection to the bus daemon.
//! The context is single-threaded and externally pumped: the owner drives
//! [`BusContext::handle_event`] from its own event loop, or lets the
//! synchronous operations pump the transport themselves.
//!
//! Replies are correlated with outstanding requests by sequence number and
//! sender id. Handlers registered on a request run on the pumping thread and
//! may freely issue further requests, including nested synchronous calls;
//! inbound method invocations arriving while a synchronous call is in
//! progress are deferred until the call stack unwinds.
//!
//! The wire payloads are self-describing TLV trees, see [`Blob`]. Socket
//! framing is behind the [`Transport`] trait; [`UnixTransport`] provides the
//! standard Unix stream socket implementation.

pub mod blob;
pub mod bus;
pub mod messages;
pub mod status;
pub mod transport;

pub use blob::{Blob, BlobError};
pub use bus::context::{BusContext, ObjectDispatcher, SYSTEM_OBJECT_EVENT};
pub use bus::object::{BusObject, EventHandler, ObjectData, RequestData};
pub use bus::request::{
  CompleteHandler, DataHandler, FdHandler, NotifyCompleteHandler, NotifyStatusHandler,
  RawDataHandler, Request, RequestHandle, MAX_NOTIFY_PEERS,
};
pub use messages::{
  parse_message, AttrId, AttrTable, MessageHeader, MessageType, ATTR_MAX, MAX_MSGLEN,
};
pub use status::StatusCode;
pub use transport::{MessageFrame, Transport, TransportError, TransportResult, UnixTransport};
