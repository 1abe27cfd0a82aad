use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

/// Status codes exchanged on the wire and returned by the synchronous
/// operations. The daemon and the peers answer every request with one of
/// these; the client additionally produces [`Timeout`](StatusCode::Timeout),
/// [`NoData`](StatusCode::NoData) and
/// [`ConnectionFailed`](StatusCode::ConnectionFailed) locally.
///
/// The wire representation is a plain `i32`. Codes outside this enum are
/// preserved when they only pass through (completion handlers receive the
/// raw value) and collapse to [`UnknownError`](StatusCode::UnknownError)
/// when a typed code is required, see [`StatusCode::from_raw`].
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive, ToPrimitive, thiserror::Error,
)]
#[repr(i32)]
pub enum StatusCode {
  #[error("ok")]
  Ok = 0,
  #[error("invalid command")]
  InvalidCommand = 1,
  #[error("invalid argument")]
  InvalidArgument = 2,
  #[error("method not found")]
  MethodNotFound = 3,
  #[error("not found")]
  NotFound = 4,
  #[error("no data")]
  NoData = 5,
  #[error("permission denied")]
  PermissionDenied = 6,
  #[error("timed out")]
  Timeout = 7,
  #[error("not supported")]
  NotSupported = 8,
  #[error("unknown error")]
  UnknownError = 9,
  #[error("connection failed")]
  ConnectionFailed = 10,
}

impl StatusCode {
  /// Maps a wire status to the closed enum. Values no variant covers
  /// come back as [`UnknownError`](StatusCode::UnknownError).
  pub fn from_raw(raw: i32) -> Self {
    FromPrimitive::from_i32(raw).unwrap_or(StatusCode::UnknownError)
  }

  pub fn raw(self) -> i32 {
    self as i32
  }

  pub fn is_ok(self) -> bool {
    self == StatusCode::Ok
  }
}

#[cfg(test)]
mod tests {
  use test_case::test_case;

  use super::*;

  #[test_case(0, StatusCode::Ok)]
  #[test_case(2, StatusCode::InvalidArgument)]
  #[test_case(7, StatusCode::Timeout)]
  #[test_case(10, StatusCode::ConnectionFailed)]
  #[test_case(11, StatusCode::UnknownError ; "first value past the enum")]
  #[test_case(-1, StatusCode::UnknownError ; "negative")]
  fn from_raw_maps_wire_values(raw: i32, expected: StatusCode) {
    assert_eq!(StatusCode::from_raw(raw), expected);
  }

  #[test]
  fn raw_round_trips_for_known_codes() {
    for raw in 0..=10 {
      assert_eq!(StatusCode::from_raw(raw).raw(), raw);
    }
  }
}
