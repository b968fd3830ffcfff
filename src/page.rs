//! Page related functions.

use crate::os;
use std::sync::Once;

/// Returns the operating system's page size.
///
/// This function uses an internally cached page size, and can be called
/// repeatedly without incurring a significant performance penalty.
#[inline]
pub fn size() -> usize {
  static INIT: Once = Once::new();
  static mut PAGE_SIZE: usize = 0;

  unsafe {
    INIT.call_once(|| PAGE_SIZE = os::page_size());
    PAGE_SIZE
  }
}

/// Rounds an address down to its closest page boundary.
#[inline]
pub fn floor(address: usize) -> usize {
  address & !(size() - 1)
}

/// Rounds an address up to its closest page boundary.
#[inline]
pub fn ceil(address: usize) -> usize {
  match address.checked_add(size() - 1) {
    Some(offset) => offset & !(size() - 1),
    None => floor(address),
  }
}

/// Returns the index of the page containing the address.
#[inline]
pub fn index(address: usize) -> usize {
  address / size()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn page_size_is_reasonable() {
    let pz = size();

    assert!(pz > 0);
    assert!(pz.is_power_of_two());
    assert_eq!(pz, size());
  }

  #[test]
  fn page_rounding_works() {
    let pz = size();

    assert_eq!(floor(1), 0);
    assert_eq!(floor(pz), pz);
    assert_eq!(floor(pz + 1), pz);

    assert_eq!(ceil(0), 0);
    assert_eq!(ceil(1), pz);
    assert_eq!(ceil(pz), pz);
    assert_eq!(ceil(pz + 1), pz * 2);
  }

  #[test]
  fn page_index_works() {
    let pz = size();

    assert_eq!(index(0), 0);
    assert_eq!(index(pz - 1), 0);
    assert_eq!(index(pz), 1);
    assert_eq!(index(pz * 3 + 17), 3);
  }
}
