use std::{
  io::{ErrorKind, Read, Write},
  os::fd::OwnedFd,
  path::Path,
  time::{Duration, Instant},
};

use bytes::{Buf, BytesMut};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use mio::{net::UnixStream, Events, Interest, Poll, Token};
use speedy::{Endianness, Readable, Writable};

use super::{MessageFrame, Transport, TransportError, TransportResult};
use crate::messages::{MessageHeader, MAX_MSGLEN};

const SOCKET_TOKEN: Token = Token(0);
// header + u32 payload length
const FRAME_HDR_LEN: usize = MessageHeader::WIRE_LEN + 4;
const READ_CHUNK: usize = 4096;

/// Stream socket transport: a fixed little-endian header, a payload length
/// and the raw payload bytes per message.
///
/// Ancillary file descriptor passing is not implemented here; sending a
/// frame with a descriptor is rejected and inbound frames never carry one.
pub struct UnixTransport {
  stream: UnixStream,
  poll: Poll,
  events: Events,
  rx: BytesMut,
  eof: bool,
  registered: bool,
}

impl UnixTransport {
  /// Connects to the daemon socket at `path`.
  pub fn connect<P: AsRef<Path>>(path: P) -> TransportResult<Self> {
    Self::new(UnixStream::connect(path)?)
  }

  /// Wraps an already connected stream, e.g. one half of a socket pair.
  pub fn from_std(stream: std::os::unix::net::UnixStream) -> TransportResult<Self> {
    stream.set_nonblocking(true)?;
    Self::new(UnixStream::from_std(stream))
  }

  fn new(mut stream: UnixStream) -> TransportResult<Self> {
    let poll = Poll::new()?;
    poll.registry().register(
      &mut stream,
      SOCKET_TOKEN,
      Interest::READABLE | Interest::WRITABLE,
    )?;
    Ok(Self {
      stream,
      poll,
      events: Events::with_capacity(4),
      rx: BytesMut::with_capacity(READ_CHUNK),
      eof: false,
      registered: false,
    })
  }

  /// Reads until the socket would block. Returns whether the peer has
  /// closed its end.
  fn fill_rx(&mut self) -> TransportResult<()> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
      match self.stream.read(&mut chunk) {
        Ok(0) => {
          self.eof = true;
          return Ok(());
        }
        Ok(n) => self.rx.extend_from_slice(&chunk[..n]),
        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
        Err(e) if e.kind() == ErrorKind::Interrupted => {}
        Err(e) => return Err(e.into()),
      }
    }
  }

  fn take_frame(&mut self) -> TransportResult<Option<MessageFrame>> {
    if self.rx.len() < FRAME_HDR_LEN {
      return Ok(None);
    }
    let hdr = MessageHeader::read_from_buffer_with_ctx(
      Endianness::LittleEndian,
      &self.rx[..MessageHeader::WIRE_LEN],
    )?;
    let len_at = MessageHeader::WIRE_LEN;
    let payload_len = u32::from_le_bytes([
      self.rx[len_at],
      self.rx[len_at + 1],
      self.rx[len_at + 2],
      self.rx[len_at + 3],
    ]) as usize;
    if payload_len > MAX_MSGLEN {
      return Err(TransportError::Oversize { len: payload_len });
    }
    if self.rx.len() < FRAME_HDR_LEN + payload_len {
      return Ok(None);
    }
    self.rx.advance(FRAME_HDR_LEN);
    let payload = self.rx.split_to(payload_len).freeze();
    trace!(
      "rx type={} seq={} peer={:#010x} len={}",
      hdr.msg_type,
      hdr.seq,
      hdr.peer,
      payload_len
    );
    Ok(Some(MessageFrame {
      hdr,
      payload,
      fd: None,
    }))
  }

  fn write_all(&mut self, mut data: &[u8]) -> TransportResult<()> {
    while !data.is_empty() {
      match self.stream.write(data) {
        Ok(0) => return Err(TransportError::Closed),
        Ok(n) => data = &data[n..],
        Err(e) if e.kind() == ErrorKind::WouldBlock => {
          self.poll.poll(&mut self.events, None)?;
        }
        Err(e) if e.kind() == ErrorKind::Interrupted => {}
        Err(e) => return Err(e.into()),
      }
    }
    Ok(())
  }
}

impl Transport for UnixTransport {
  fn send(
    &mut self,
    hdr: MessageHeader,
    payload: &[u8],
    fd: Option<OwnedFd>,
  ) -> TransportResult<()> {
    if fd.is_some() {
      return Err(TransportError::FdNotSupported);
    }
    if payload.len() > MAX_MSGLEN {
      return Err(TransportError::Oversize {
        len: payload.len(),
      });
    }
    let mut out = Vec::with_capacity(FRAME_HDR_LEN + payload.len());
    out.extend_from_slice(&hdr.write_to_vec_with_ctx(Endianness::LittleEndian)?);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    trace!(
      "tx type={} seq={} peer={:#010x} len={}",
      hdr.msg_type,
      hdr.seq,
      hdr.peer,
      payload.len()
    );
    self.write_all(&out)
  }

  fn recv(&mut self, timeout: Option<Duration>) -> TransportResult<Option<MessageFrame>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
      if let Some(frame) = self.take_frame()? {
        return Ok(Some(frame));
      }
      if self.eof {
        return Err(TransportError::Closed);
      }
      let wait = match deadline {
        Some(end) => {
          let left = end.saturating_duration_since(Instant::now());
          if left.is_zero() {
            // one last non-blocking read so a zero timeout still drains
            // data that is already queued on the socket
            self.fill_rx()?;
            return match self.take_frame()? {
              some @ Some(_) => Ok(some),
              None if self.eof => Err(TransportError::Closed),
              None => Ok(None),
            };
          }
          Some(left)
        }
        None => None,
      };
      self.poll.poll(&mut self.events, wait)?;
      self.fill_rx()?;
    }
  }

  fn registered(&self) -> bool {
    self.registered
  }

  fn register(&mut self) {
    self.registered = true;
  }

  fn unregister(&mut self) {
    self.registered = false;
  }
}
