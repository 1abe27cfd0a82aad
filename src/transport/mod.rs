//! The transport seam between the client context and the socket.
//!
//! The context never touches the socket itself: it hands fully framed
//! messages to a [`Transport`] and pulls decoded [`MessageFrame`]s back out,
//! either non-blocking or with a millisecond deadline. This keeps the
//! request multiplexer testable against scripted peers and lets embedders
//! substitute their own socket handling.

mod unix;

use std::{io, os::fd::OwnedFd, time::Duration};

use bytes::Bytes;

pub use unix::UnixTransport;

use crate::messages::MessageHeader;

/// One decoded inbound message: header, raw payload and an optional
/// ancillary file descriptor. The descriptor is owned; if nothing consumes
/// it, dropping the frame closes it.
#[derive(Debug)]
pub struct MessageFrame {
  pub hdr: MessageHeader,
  pub payload: Bytes,
  pub fd: Option<OwnedFd>,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  #[error("i/o: {0}")]
  Io(#[from] io::Error),
  #[error("header codec: {0}")]
  HeaderCodec(#[from] speedy::Error),
  #[error("connection closed by peer")]
  Closed,
  #[error("frame payload of {len} bytes exceeds the maximum message length")]
  Oversize { len: usize },
  #[error("transport does not support file descriptor passing")]
  FdNotSupported,
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Connection to the bus daemon, as consumed by the client context.
pub trait Transport {
  /// Sends one framed message. `fd` transfers ownership of an ancillary
  /// descriptor where the transport supports it.
  fn send(
    &mut self,
    hdr: MessageHeader,
    payload: &[u8],
    fd: Option<OwnedFd>,
  ) -> TransportResult<()>;

  /// Waits up to `timeout` for the next inbound frame. `None` means wait
  /// indefinitely; a zero duration polls without blocking. Returns
  /// `Ok(None)` when the deadline passes with no complete frame.
  fn recv(&mut self, timeout: Option<Duration>) -> TransportResult<Option<MessageFrame>>;

  /// Whether the owner has attached this transport to its own event loop.
  /// The synchronous bridge uses this to know if it must detach and drain
  /// deferred work itself when the outermost call unwinds.
  fn registered(&self) -> bool;

  fn register(&mut self);

  fn unregister(&mut self);
}
