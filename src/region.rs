//! Page-aligned regions: the protection granularity of the engine.
//!
//! A region covers every page spanned by the subregions it hosts. Structure
//! (the subregion list) changes only under the global writer lock; the
//! protection status is atomic because the unprot worker flips it while
//! faulting threads hold the reader lock.

use crate::range::{MemRange, RangeCmp};
use crate::salloc::Salloc;
use crate::sem::Semaphore;
use crate::store::RegionStore;
use crate::subreg::Subreg;
use crate::{os, page, Error, Protection, Result, UsageMode};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One entry of a region's address-sorted subregion list.
pub struct SubregNode {
  subreg: NonNull<Subreg>,
  next: *mut SubregNode,
}

pub struct Region {
  range: MemRange,
  prot: AtomicUsize,
  subregs: *mut SubregNode,
  nsubregs: usize,
  /// Posted once per serviced unprotect request; faulting threads wait here.
  unprot_event: Semaphore,
}

impl Region {
  /// Allocates a region spanning the pages of `subreg`, registers it in the
  /// store and adopts the subregion.
  pub fn allocate(
    salloc: &mut Salloc,
    store: &mut RegionStore,
    subreg: NonNull<Subreg>,
  ) -> Result<NonNull<Region>> {
    let subrange = unsafe { subreg.as_ref().range() };
    let range = MemRange::new(
      page::floor(subrange.start()),
      page::ceil(subrange.end()) - page::floor(subrange.start()),
    );

    let region = Region {
      range,
      prot: AtomicUsize::new(Protection::READ_WRITE.bits()),
      subregs: std::ptr::null_mut(),
      nsubregs: 0,
      unprot_event: Semaphore::new(0)?,
    };
    let mut region = salloc.alloc_value(region)?;

    let node = match salloc.alloc_value(SubregNode { subreg, next: std::ptr::null_mut() }) {
      Ok(node) => node,
      Err(error) => {
        unsafe { salloc.free_value(region) };
        return Err(error);
      }
    };
    unsafe {
      region.as_mut().subregs = node.as_ptr();
      region.as_mut().nsubregs = 1;
    }

    if let Err(error) = store.insert(salloc, region) {
      unsafe {
        salloc.free_value(node);
        salloc.free_value(region);
      }
      return Err(error);
    }

    unsafe {
      let mut subreg = subreg;
      subreg.as_mut().set_region(region);
    }
    Ok(region)
  }

  pub fn range(&self) -> MemRange {
    self.range
  }

  pub fn protection(&self) -> Protection {
    Protection::from_bits_truncate(self.prot.load(Ordering::SeqCst))
  }

  pub fn is_protected(&self) -> bool {
    self.protection() != Protection::READ_WRITE
  }

  pub fn is_empty(&self) -> bool {
    self.nsubregs == 0
  }

  /// Installs a protection on the region's pages; a no-op when it matches
  /// the current one.
  pub fn apply_protection(&self, protection: Protection) -> Result<()> {
    if self.protection() == protection {
      return Ok(());
    }
    unsafe { os::set_protection(self.range.as_ptr(), self.range.len(), protection)? };
    self.prot.store(protection.bits(), Ordering::SeqCst);
    Ok(())
  }

  /// Removes all protection.
  pub fn unprotect(&self) -> Result<()> {
    self.apply_protection(Protection::READ_WRITE)
  }

  /// Applies the post-kernel protection derived from the recorded usage of
  /// all subregions: any read-write kernel forces full protection, read-only
  /// kernels leave the pages readable.
  pub fn protect_after_kernel(&self) -> Result<()> {
    let mut any_read_only = false;

    for subreg in self.subregs() {
      match unsafe { subreg.as_ref() }.current_usage() {
        Some(UsageMode::ReadWrite) => return self.apply_protection(Protection::NONE),
        Some(UsageMode::ReadOnly) => any_read_only = true,
        None => {}
      }
    }
    if any_read_only {
      self.apply_protection(Protection::READ)
    } else {
      Ok(())
    }
  }

  /// Blocks the calling (faulting) thread until an unprotect request for
  /// this region has been serviced.
  pub fn wait_unprotect(&self) {
    self.unprot_event.wait();
  }

  /// Releases one thread blocked in [Region::wait_unprotect].
  pub fn post_unprotect(&self) {
    self.unprot_event.post();
  }

  /// Inserts a subregion into the sorted list; rejects overlap.
  pub fn add_subreg(&mut self, salloc: &mut Salloc, subreg: NonNull<Subreg>) -> Result<()> {
    let range = unsafe { subreg.as_ref().range() };
    if !self.range.contains_range(&range) {
      log::error!("subregion is not completely inside its region");
      return Err(Error::Internal);
    }

    // find the insertion slot, keeping the list address sorted
    let mut cursor = &mut self.subregs as *mut *mut SubregNode;
    unsafe {
      while !(*cursor).is_null() {
        match range.compare(&(**cursor).subreg.as_ref().range()) {
          RangeCmp::Before => break,
          RangeCmp::Equal | RangeCmp::Intersects => {
            log::error!("subregion intersects an existing subregion of the region");
            return Err(Error::RangeRegistered);
          }
          RangeCmp::After => cursor = &mut (**cursor).next as *mut *mut SubregNode,
        }
      }

      let node = salloc.alloc_value(SubregNode { subreg, next: *cursor })?;
      *cursor = node.as_ptr();
    }

    self.nsubregs += 1;
    unsafe {
      let mut subreg = subreg;
      subreg.as_mut().set_region(NonNull::new_unchecked(self as *mut Region));
    }
    Ok(())
  }

  /// Unlinks a subregion from the list; absence is ignored.
  pub fn remove_subreg(&mut self, salloc: &mut Salloc, subreg: NonNull<Subreg>) {
    let mut cursor = &mut self.subregs as *mut *mut SubregNode;
    unsafe {
      while !(*cursor).is_null() {
        if (**cursor).subreg == subreg {
          let node = *cursor;
          *cursor = (*node).next;
          salloc.free_value(NonNull::new_unchecked(node));
          self.nsubregs -= 1;
          return;
        }
        cursor = &mut (**cursor).next as *mut *mut SubregNode;
      }
    }
  }

  /// Finds the subregion containing an address.
  pub fn find_subreg(&self, address: usize) -> Option<NonNull<Subreg>> {
    if !self.range.contains(address) {
      return None;
    }
    self
      .subregs()
      .find(|subreg| unsafe { subreg.as_ref() }.range().contains(address))
  }

  /// Finds any subregion intersecting the given range.
  pub fn find_subreg_in_range(&self, range: &MemRange) -> Option<NonNull<Subreg>> {
    self.subregs().find(|subreg| {
      let cmp = range.compare(&unsafe { subreg.as_ref() }.range());
      cmp == RangeCmp::Intersects || cmp == RangeCmp::Equal
    })
  }

  /// Iterates over the subregions in address order.
  pub fn subregs(&self) -> Subregs<'_> {
    Subregs { node: self.subregs, _region: std::marker::PhantomData }
  }
}

/// Iterator over a region's subregions.
pub struct Subregs<'a> {
  node: *mut SubregNode,
  _region: std::marker::PhantomData<&'a Region>,
}

impl Iterator for Subregs<'_> {
  type Item = NonNull<Subreg>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.node.is_null() {
      return None;
    }
    unsafe {
      let node = &*self.node;
      self.node = node.next;
      Some(node.subreg)
    }
  }
}
