//! Error types and utilities.

/// The result type used by this library.
pub type Result<T> = ::std::result::Result<T, Error>;

/// A collection of possible errors.
///
/// Every variant maps to a stable numeric code (see [Error::code]) so that
/// bindings in other languages can rely on the values.
#[derive(Debug, Fail)]
pub enum Error {
  /// An unspecified internal failure.
  #[fail(display = "internal error")]
  Internal,
  /// The separate allocator is exhausted.
  #[fail(display = "separate allocator is out of memory")]
  AllocFailed,
  /// The supplied pointer is null.
  #[fail(display = "address must not be null")]
  Null,
  /// An argument is out of range or otherwise invalid.
  #[fail(display = "invalid argument: {}", _0)]
  InvalidArgument(&'static str),
  /// A once-only call was performed twice.
  #[fail(display = "already initialized")]
  AlreadyInitialized,
  /// The range intersects one that is already registered.
  #[fail(display = "range is already registered")]
  RangeRegistered,
  /// A link already exists for this (array, device) pair.
  #[fail(display = "link for this device already exists")]
  LinkExists,
  /// The pointer does not fall within any registered host array.
  #[fail(display = "pointer is not within a registered host array")]
  UnknownHostPointer,
  /// The device backend ran out of resources.
  #[fail(display = "device backend allocation failed")]
  DeviceAlloc,
  /// The OS refused to change page protection.
  #[fail(display = "changing page protection failed with: {}", _0)]
  ProtectionFailed(::errno::Errno),
  /// The array has no link for the specified device.
  #[fail(display = "array has no link for this device")]
  NoLink,
  /// A lifecycle requirement is not met.
  #[fail(display = "invalid engine state: {}", _0)]
  InvalidState(&'static str),
  /// The selected device API is not available in this build.
  #[fail(display = "device API is not supported by this build")]
  UnsupportedApi,
  /// A system call failed.
  #[fail(display = "system call failed with: {}", _0)]
  SystemCall(::errno::Errno),
}

impl Error {
  /// Returns the stable numeric code for this error.
  pub fn code(&self) -> i32 {
    match *self {
      Error::Internal => -1,
      Error::AllocFailed => -2,
      Error::Null => -3,
      Error::InvalidArgument(_) => -4,
      Error::AlreadyInitialized => -5,
      Error::RangeRegistered => -6,
      Error::LinkExists => -7,
      Error::UnknownHostPointer => -8,
      Error::DeviceAlloc => -9,
      Error::ProtectionFailed(_) => -10,
      Error::NoLink => -11,
      Error::InvalidState(_) => -12,
      Error::UnsupportedApi => -13,
      Error::SystemCall(_) => -1,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn error_codes_are_stable() {
    assert_eq!(Error::Internal.code(), -1);
    assert_eq!(Error::AllocFailed.code(), -2);
    assert_eq!(Error::Null.code(), -3);
    assert_eq!(Error::InvalidArgument("x").code(), -4);
    assert_eq!(Error::AlreadyInitialized.code(), -5);
    assert_eq!(Error::RangeRegistered.code(), -6);
    assert_eq!(Error::LinkExists.code(), -7);
    assert_eq!(Error::UnknownHostPointer.code(), -8);
    assert_eq!(Error::DeviceAlloc.code(), -9);
    assert_eq!(Error::NoLink.code(), -11);
    assert_eq!(Error::InvalidState("x").code(), -12);
    assert_eq!(Error::UnsupportedApi.code(), -13);
  }
}
