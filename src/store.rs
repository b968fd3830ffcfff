//! The region store: an ordered map over disjoint page-aligned ranges.
//!
//! A plain binary search tree keyed by the region ranges; the four-way range
//! comparison steers descent and any `Equal`/`Intersects` hit on insertion is
//! rejected, which is what keeps regions pairwise disjoint. Nodes live in the
//! separate allocator. Guarded by the global lock: lookups run under the
//! reader side (including on the signal stack), mutation under the writer
//! side.

use crate::range::{MemRange, RangeCmp};
use crate::region::Region;
use crate::salloc::Salloc;
use crate::subreg::Subreg;
use crate::{Error, Result};
use std::ptr::NonNull;

struct Node {
  region: NonNull<Region>,
  left: *mut Node,
  right: *mut Node,
}

pub struct RegionStore {
  root: *mut Node,
}

impl RegionStore {
  pub fn new() -> Self {
    RegionStore { root: std::ptr::null_mut() }
  }

  #[cfg(test)]
  pub fn is_empty(&self) -> bool {
    self.root.is_null()
  }

  /// Inserts a region; rejects any range that equals or intersects an
  /// existing one.
  pub fn insert(&mut self, salloc: &mut Salloc, region: NonNull<Region>) -> Result<()> {
    unsafe { Self::insert_at(&mut self.root, salloc, region) }
  }

  unsafe fn insert_at(
    slot: *mut *mut Node,
    salloc: &mut Salloc,
    region: NonNull<Region>,
  ) -> Result<()> {
    if (*slot).is_null() {
      let node = salloc.alloc_value(Node {
        region,
        left: std::ptr::null_mut(),
        right: std::ptr::null_mut(),
      })?;
      *slot = node.as_ptr();
      return Ok(());
    }

    let occupant = (**slot).region.as_ref().range();
    match region.as_ref().range().compare(&occupant) {
      RangeCmp::Before => Self::insert_at(&mut (**slot).left, salloc, region),
      RangeCmp::After => Self::insert_at(&mut (**slot).right, salloc, region),
      RangeCmp::Equal | RangeCmp::Intersects => {
        log::error!("an equal or intersecting region already exists");
        Err(Error::RangeRegistered)
      }
    }
  }

  /// Finds the region containing an address.
  pub fn find(&self, address: usize) -> Option<NonNull<Region>> {
    let mut node = self.root;
    unsafe {
      while !node.is_null() {
        match (*node).region.as_ref().range().position_of(address) {
          RangeCmp::Before => node = (*node).left,
          RangeCmp::After => node = (*node).right,
          _ => return Some((*node).region),
        }
      }
    }
    None
  }

  /// Finds any subregion intersecting the range; a range spanning several
  /// regions may hit either side of the tree, so both are searched on
  /// overlap.
  pub fn find_subreg_in_range(&self, range: &MemRange) -> Option<NonNull<Subreg>> {
    unsafe { Self::find_subreg_at(self.root, range) }
  }

  unsafe fn find_subreg_at(node: *mut Node, range: &MemRange) -> Option<NonNull<Subreg>> {
    if node.is_null() {
      return None;
    }
    let region = (*node).region.as_ref();
    match range.compare(&region.range()) {
      RangeCmp::Before => Self::find_subreg_at((*node).left, range),
      RangeCmp::After => Self::find_subreg_at((*node).right, range),
      RangeCmp::Equal => region.find_subreg_in_range(range),
      RangeCmp::Intersects => region
        .find_subreg_in_range(range)
        .or_else(|| Self::find_subreg_at((*node).left, range))
        .or_else(|| Self::find_subreg_at((*node).right, range)),
    }
  }

  /// Removes a region from the store. The region itself is not deallocated.
  pub fn remove(&mut self, salloc: &mut Salloc, region: NonNull<Region>) {
    unsafe { Self::remove_at(&mut self.root, salloc, region) }
  }

  unsafe fn remove_at(slot: *mut *mut Node, salloc: &mut Salloc, region: NonNull<Region>) {
    if (*slot).is_null() {
      log::error!("removal of a region that is not in the store");
      return;
    }

    let node = *slot;
    if (*node).region == region {
      if (*node).left.is_null() && (*node).right.is_null() {
        *slot = std::ptr::null_mut();
      } else if (*node).left.is_null() || (*node).right.is_null() {
        *slot = if (*node).left.is_null() { (*node).right } else { (*node).left };
      } else {
        // two children: splice the in-order successor into this position
        let successor_slot = Self::min_slot(&mut (*node).right);
        let successor = *successor_slot;
        *successor_slot = (*successor).right;
        (*successor).left = (*node).left;
        (*successor).right = (*node).right;
        *slot = successor;
      }
      salloc.free_value(NonNull::new_unchecked(node));
      return;
    }

    match region.as_ref().range().compare(&(*node).region.as_ref().range()) {
      RangeCmp::Before => Self::remove_at(&mut (*node).left, salloc, region),
      RangeCmp::After => Self::remove_at(&mut (*node).right, salloc, region),
      RangeCmp::Equal | RangeCmp::Intersects => {
        log::error!("store entry intersects the region being removed but is not it");
      }
    }
  }

  unsafe fn min_slot(slot: *mut *mut Node) -> *mut *mut Node {
    if (**slot).left.is_null() {
      slot
    } else {
      Self::min_slot(&mut (**slot).left)
    }
  }
}
