//! TLV attribute trees carried as message payloads.
//!
//! Every message payload is one root attribute, normally a [`Blob::Table`],
//! whose children are read positionally by the per-message-type parse (see
//! [`crate::messages::parse_message`]) or walked as alternating key/value
//! pairs by record consumers.
//!
//! Wire layout of one attribute: a 4-byte little-endian header packing the
//! type tag into the top byte and the payload length into the low 24 bits,
//! followed by the payload. Children of a container are each padded to a
//! 4-byte boundary.

use bytes::{BufMut, BytesMut};
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

const BLOB_HDR_LEN: usize = 4;
const BLOB_LEN_MASK: u32 = 0x00ff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
enum BlobTag {
  I8 = 1,
  I32 = 2,
  String = 3,
  Binary = 4,
  Table = 5,
  Array = 6,
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
  #[error("attribute truncated")]
  Truncated,
  #[error("unknown attribute tag {0}")]
  BadTag(u8),
  #[error("attribute tag {tag} cannot have payload length {len}")]
  BadLength { tag: u8, len: usize },
  #[error("string attribute is not valid UTF-8")]
  BadUtf8,
}

/// One attribute of a payload tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Blob {
  I8(i8),
  I32(i32),
  String(String),
  Binary(Vec<u8>),
  Table(Vec<Blob>),
  Array(Vec<Blob>),
}

impl Blob {
  pub fn u32(v: u32) -> Blob {
    Blob::I32(v as i32)
  }

  pub fn i32(v: i32) -> Blob {
    Blob::I32(v)
  }

  pub fn bool(v: bool) -> Blob {
    Blob::I8(v as i8)
  }

  pub fn string(s: impl Into<String>) -> Blob {
    Blob::String(s.into())
  }

  pub fn table(children: Vec<Blob>) -> Blob {
    Blob::Table(children)
  }

  pub fn as_i8(&self) -> Option<i8> {
    match self {
      Blob::I8(v) => Some(*v),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    self.as_i8().map(|v| v != 0)
  }

  pub fn as_i32(&self) -> Option<i32> {
    match self {
      Blob::I32(v) => Some(*v),
      _ => None,
    }
  }

  pub fn as_u32(&self) -> Option<u32> {
    self.as_i32().map(|v| v as u32)
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Blob::String(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Blob::Binary(b) => Some(b),
      _ => None,
    }
  }

  /// Children of a container attribute, `None` for scalars.
  pub fn children(&self) -> Option<&[Blob]> {
    match self {
      Blob::Table(c) | Blob::Array(c) => Some(c),
      _ => None,
    }
  }

  /// Walks a container as alternating `key, value` children, the record
  /// convention of lookup replies and event tables. Malformed pairs (a
  /// non-string in key position, a trailing odd child) are skipped.
  pub fn pairs(&self) -> impl Iterator<Item = (&str, &Blob)> {
    self
      .children()
      .unwrap_or(&[])
      .chunks_exact(2)
      .filter_map(|kv| kv[0].as_str().map(|k| (k, &kv[1])))
  }

  fn tag(&self) -> BlobTag {
    match self {
      Blob::I8(_) => BlobTag::I8,
      Blob::I32(_) => BlobTag::I32,
      Blob::String(_) => BlobTag::String,
      Blob::Binary(_) => BlobTag::Binary,
      Blob::Table(_) => BlobTag::Table,
      Blob::Array(_) => BlobTag::Array,
    }
  }

  /// Exact encoded size: header plus payload, children padded.
  pub fn encoded_len(&self) -> usize {
    let payload = match self {
      Blob::I8(_) => 1,
      Blob::I32(_) => 4,
      Blob::String(s) => s.len(),
      Blob::Binary(b) => b.len(),
      Blob::Table(c) | Blob::Array(c) => c.iter().map(|a| pad4(a.encoded_len())).sum(),
    };
    BLOB_HDR_LEN + payload
  }

  /// Encoded size rounded up to the 4-byte boundary the attribute would
  /// occupy inside a container. This is the size the maximum-message-length
  /// check is applied to.
  pub fn padded_len(&self) -> usize {
    pad4(self.encoded_len())
  }

  /// Appends the encoded attribute to `buf`.
  pub fn encode_into(&self, buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_u32_le(0); // header patched below
    match self {
      Blob::I8(v) => buf.put_i8(*v),
      Blob::I32(v) => buf.put_i32_le(*v),
      Blob::String(s) => buf.put_slice(s.as_bytes()),
      Blob::Binary(b) => buf.put_slice(b),
      Blob::Table(children) | Blob::Array(children) => {
        for child in children {
          child.encode_into(buf);
          while (buf.len() - start) % 4 != 0 {
            buf.put_u8(0);
          }
        }
      }
    }
    let len = (buf.len() - start - BLOB_HDR_LEN) as u32;
    let hdr = ((self.tag() as u32) << 24) | (len & BLOB_LEN_MASK);
    buf[start..start + BLOB_HDR_LEN].copy_from_slice(&hdr.to_le_bytes());
  }

  /// Encodes into a fresh buffer. Mostly for tests and small payloads; the
  /// context reuses its own outbound buffer instead.
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(self.encoded_len());
    self.encode_into(&mut buf);
    buf.to_vec()
  }

  /// Parses one root attribute from the front of `data`. Trailing padding
  /// bytes after the root are ignored.
  pub fn parse(data: &[u8]) -> Result<Blob, BlobError> {
    Self::parse_one(data).map(|(blob, _)| blob)
  }

  fn parse_one(data: &[u8]) -> Result<(Blob, usize), BlobError> {
    if data.len() < BLOB_HDR_LEN {
      return Err(BlobError::Truncated);
    }
    let hdr = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let raw_tag = (hdr >> 24) as u8;
    let len = (hdr & BLOB_LEN_MASK) as usize;
    let end = BLOB_HDR_LEN + len;
    if data.len() < end {
      return Err(BlobError::Truncated);
    }
    let tag = BlobTag::from_u8(raw_tag).ok_or(BlobError::BadTag(raw_tag))?;
    let payload = &data[BLOB_HDR_LEN..end];
    let blob = match tag {
      BlobTag::I8 => {
        if len != 1 {
          return Err(BlobError::BadLength { tag: raw_tag, len });
        }
        Blob::I8(payload[0] as i8)
      }
      BlobTag::I32 => {
        if len != 4 {
          return Err(BlobError::BadLength { tag: raw_tag, len });
        }
        Blob::I32(i32::from_le_bytes([
          payload[0], payload[1], payload[2], payload[3],
        ]))
      }
      BlobTag::String => Blob::String(
        String::from_utf8(payload.to_vec()).map_err(|_| BlobError::BadUtf8)?,
      ),
      BlobTag::Binary => Blob::Binary(payload.to_vec()),
      BlobTag::Table | BlobTag::Array => {
        let mut children = Vec::new();
        let mut off = 0;
        while off < len {
          let (child, used) = Self::parse_one(&payload[off..])?;
          children.push(child);
          off = pad4(off + used).min(len);
        }
        if tag == BlobTag::Table {
          Blob::Table(children)
        } else {
          Blob::Array(children)
        }
      }
    };
    Ok((blob, end))
  }
}

fn pad4(len: usize) -> usize {
  (len + 3) & !3
}
