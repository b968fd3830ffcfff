//! Host arrays: application buffers registered with the engine.
//!
//! An array is split at page boundaries into up to three subregions (the
//! unaligned head, the whole-page middle, the unaligned tail), each living
//! in its own page-aligned region.

use crate::backend::Devices;
use crate::link::Link;
use crate::range::MemRange;
use crate::salloc::Salloc;
use crate::stat::Stats;
use crate::store::RegionStore;
use crate::subreg::Subreg;
use crate::{page, Error, Result, UsageMode};
use std::mem;
use std::ptr::NonNull;

/// A host range splits into at most this many subregions.
pub const MAX_SUBREGS: usize = 3;

pub struct HostArray {
  range: MemRange,
  links: *mut Option<NonNull<Link>>,
  ndevs: usize,
  subregs: [Option<NonNull<Subreg>>; MAX_SUBREGS],
  nsubregs: usize,
}

/// Result of a host-array lookup.
pub enum Find {
  /// No registered array covers the queried range.
  Missing,
  /// The array covering the range matches it exactly (always the case for
  /// pointer-only lookups).
  Exact(NonNull<HostArray>),
  /// An array overlaps the range without being equal to it.
  Intersects(NonNull<HostArray>),
}

/// Splits a range at page boundaries into 1–3 subranges: the part of the
/// first page when the start is unaligned, the whole-page middle, and the
/// part of the last page when the end is unaligned.
pub fn split_range(range: MemRange) -> ([MemRange; MAX_SUBREGS], usize) {
  let mut pieces = [MemRange::new(0, 0); MAX_SUBREGS];
  let mut count = 0;

  let first_boundary = page::ceil(range.start());
  let last_boundary = page::floor(range.end());

  let head_end = first_boundary.min(range.end());
  if head_end > range.start() {
    pieces[count] = MemRange::new(range.start(), head_end - range.start());
    count += 1;
  }
  if last_boundary > first_boundary {
    pieces[count] = MemRange::new(first_boundary, last_boundary - first_boundary);
    count += 1;
  }
  if last_boundary < range.end() && last_boundary >= head_end {
    pieces[count] = MemRange::new(last_boundary, range.end() - last_boundary);
    count += 1;
  }

  (pieces, count)
}

impl HostArray {
  /// Allocates an array together with its subregions (and their regions,
  /// where the pages are not yet covered). With `initial_dev` set the data
  /// is taken to reside on that device and the pages are protected at once.
  pub fn allocate(
    salloc: &mut Salloc,
    store: &mut RegionStore,
    range: MemRange,
    ndevs: usize,
    initial_dev: Option<usize>,
  ) -> Result<NonNull<HostArray>> {
    let links = salloc
      .alloc(ndevs * mem::size_of::<Option<NonNull<Link>>>())?
      .cast::<Option<NonNull<Link>>>();
    for dev in 0..ndevs {
      unsafe { links.as_ptr().add(dev).write(None) };
    }

    let array = HostArray {
      range,
      links: links.as_ptr(),
      ndevs,
      subregs: [None; MAX_SUBREGS],
      nsubregs: 0,
    };
    let mut array = match salloc.alloc_value(array) {
      Ok(array) => array,
      Err(error) => {
        salloc.free(links.cast());
        return Err(error);
      }
    };

    let (pieces, count) = split_range(range);
    for index in 0..count {
      match Subreg::allocate(salloc, store, pieces[index], initial_dev) {
        Ok(mut subreg) => unsafe {
          subreg.as_mut().set_host_array(array);
          array.as_mut().subregs[index] = Some(subreg);
          array.as_mut().nsubregs = index + 1;
        },
        Err(error) => {
          Self::free(salloc, store, array);
          return Err(error);
        }
      }
    }
    Ok(array)
  }

  /// Tears the array down: links, subregions (and emptied regions), storage.
  pub fn free(salloc: &mut Salloc, store: &mut RegionStore, array: NonNull<HostArray>) {
    unsafe {
      for dev in 0..array.as_ref().ndevs {
        if let Some(link) = array.as_ref().link_ptr(dev) {
          salloc.free_value(link);
        }
      }
      salloc.free(NonNull::new_unchecked(array.as_ref().links as *mut u8));

      for index in 0..array.as_ref().nsubregs {
        if let Some(subreg) = array.as_ref().subregs[index] {
          Subreg::free(salloc, store, subreg);
        }
      }
      salloc.free_value(array);
    }
  }

  /// Looks an array up by pointer (`nbytes == 0`) or by range.
  ///
  /// Range lookups also surface arrays that merely intersect the range so
  /// that `link` can reject partially overlapping registrations.
  pub fn find(store: &RegionStore, address: usize, nbytes: usize) -> Find {
    if nbytes == 0 {
      let region = match store.find(address) {
        Some(region) => region,
        None => return Find::Missing,
      };
      let subreg = match unsafe { region.as_ref() }.find_subreg(address) {
        Some(subreg) => subreg,
        None => return Find::Missing,
      };
      let array = unsafe { subreg.as_ref() }.host_array();
      return Find::Exact(NonNull::from(array));
    }

    let range = MemRange::new(address, nbytes);
    match store.find_subreg_in_range(&range) {
      None => Find::Missing,
      Some(subreg) => {
        let array = unsafe { subreg.as_ref() }.host_array();
        if array.range == range {
          Find::Exact(NonNull::from(array))
        } else {
          Find::Intersects(NonNull::from(array))
        }
      }
    }
  }

  pub fn range(&self) -> MemRange {
    self.range
  }

  pub fn subregs(&self) -> impl Iterator<Item = NonNull<Subreg>> + '_ {
    self.subregs[..self.nsubregs].iter().filter_map(|slot| *slot)
  }

  fn link_ptr(&self, dev: usize) -> Option<NonNull<Link>> {
    unsafe { *self.links.add(dev) }
  }

  pub fn link(&self, dev: usize) -> Option<&Link> {
    self.link_ptr(dev).map(|link| {
      let link = unsafe { &*link.as_ptr() };
      debug_assert_eq!(link.dev(), dev);
      debug_assert!(std::ptr::eq(link.host_array().as_ptr(), self));
      link
    })
  }

  pub fn set_link(&mut self, dev: usize, link: NonNull<Link>) {
    unsafe { *self.links.add(dev) = Some(link) };
  }

  /// Removes and frees the link for `dev`; absence is not an error.
  pub fn remove_link(&mut self, salloc: &mut Salloc, dev: usize) {
    unsafe {
      if let Some(link) = *self.links.add(dev) {
        salloc.free_value(link);
        *self.links.add(dev) = None;
      }
    }
  }

  pub fn has_links(&self) -> bool {
    (0..self.ndevs).any(|dev| self.link_ptr(dev).is_some())
  }

  /// Forces any pending device→host coherence for the array by touching the
  /// first byte of every subregion; protected pages trap and the fault
  /// pipeline completes before the read returns.
  pub fn touch(&self) {
    for subreg in self.subregs() {
      unsafe { std::ptr::read_volatile(subreg.as_ref().range().as_ptr()) };
    }
  }

  /// Prepares a kernel launch on `dev`: makes every subregion device-actual
  /// and records the declared usage.
  pub fn begin_kernel(
    &self,
    dev: usize,
    mode: UsageMode,
    devices: &Devices,
    stats: &Stats,
  ) -> Result<()> {
    if self.link(dev).is_none() {
      return Err(Error::NoLink);
    }
    for subreg in self.subregs() {
      let subreg = unsafe { subreg.as_ref() };
      subreg.sync_to_device(dev, devices, stats)?;
      subreg.record_usage(mode);
    }
    Ok(())
  }

  /// Completes a kernel on `dev`: updates actuality from the recorded usage
  /// and installs the matching region protection.
  pub fn end_kernel(&self, dev: usize) -> Result<()> {
    if self.link(dev).is_none() {
      return Err(Error::NoLink);
    }
    for subreg in self.subregs() {
      let subreg = unsafe { subreg.as_ref() };
      let mode = match subreg.current_usage() {
        Some(mode) => mode,
        None => {
          log::warn!("kernel end without a live kernel over the subregion");
          continue;
        }
      };
      if mode == UsageMode::ReadWrite {
        subreg.after_kernel(dev);
      }
      subreg.region().protect_after_kernel()?;
      subreg.end_usage();
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::page;

  fn range(start: usize, len: usize) -> MemRange {
    MemRange::new(start, len)
  }

  #[test]
  fn split_within_one_page_is_whole() {
    let pz = page::size();

    let (pieces, count) = split_range(range(pz + 16, 64));
    assert_eq!(count, 1);
    assert_eq!(pieces[0], range(pz + 16, 64));

    let (pieces, count) = split_range(range(pz, pz));
    assert_eq!(count, 1);
    assert_eq!(pieces[0], range(pz, pz));
  }

  #[test]
  fn split_aligned_multi_page_is_whole() {
    let pz = page::size();

    let (pieces, count) = split_range(range(pz, 3 * pz));
    assert_eq!(count, 1);
    assert_eq!(pieces[0], range(pz, 3 * pz));
  }

  #[test]
  fn split_unaligned_start_yields_head() {
    let pz = page::size();

    let (pieces, count) = split_range(range(pz + 16, 2 * pz - 16));
    assert_eq!(count, 2);
    assert_eq!(pieces[0], range(pz + 16, pz - 16));
    assert_eq!(pieces[1], range(2 * pz, pz));
  }

  #[test]
  fn split_unaligned_end_yields_tail() {
    let pz = page::size();

    let (pieces, count) = split_range(range(pz, pz + 16));
    assert_eq!(count, 2);
    assert_eq!(pieces[0], range(pz, pz));
    assert_eq!(pieces[1], range(2 * pz, 16));
  }

  #[test]
  fn split_unaligned_both_ends_yields_three() {
    let pz = page::size();

    let (pieces, count) = split_range(range(pz + 16, 3 * pz));
    assert_eq!(count, 3);
    assert_eq!(pieces[0], range(pz + 16, pz - 16));
    assert_eq!(pieces[1], range(2 * pz, 2 * pz));
    assert_eq!(pieces[2], range(4 * pz, 16));

    let total: usize = pieces[..count].iter().map(|piece| piece.len()).sum();
    assert_eq!(total, 3 * pz);
  }

  #[test]
  fn split_two_pages_unaligned_both_ends() {
    let pz = page::size();

    let (pieces, count) = split_range(range(pz + 16, pz));
    assert_eq!(count, 2);
    assert_eq!(pieces[0], range(pz + 16, pz - 16));
    assert_eq!(pieces[1], range(2 * pz, 16));
  }

  #[test]
  fn allocated_array_partitions_its_range() {
    let mut salloc = Salloc::new();
    let mut store = RegionStore::new();
    let pz = page::size();

    let span = range(0x100 * pz + 24, 3 * pz);
    let array = HostArray::allocate(&mut salloc, &mut store, span, 2, None).unwrap();
    let array_ref = unsafe { array.as_ref() };

    assert_eq!(array_ref.subregs().count(), 3);
    let mut cursor = span.start();
    for subreg in array_ref.subregs() {
      let subrange = unsafe { subreg.as_ref() }.range();
      assert_eq!(subrange.start(), cursor);
      cursor = subrange.end();
      assert!(unsafe { subreg.as_ref() }.is_actual_on_host());
    }
    assert_eq!(cursor, span.end());

    HostArray::free(&mut salloc, &mut store, array);
    assert!(store.is_empty());
  }

  #[test]
  fn each_subregion_lives_in_a_distinct_region() {
    let mut salloc = Salloc::new();
    let mut store = RegionStore::new();
    let pz = page::size();

    let span = range(0x200 * pz + 8, 3 * pz);
    let array = HostArray::allocate(&mut salloc, &mut store, span, 1, None).unwrap();

    let regions: Vec<_> = unsafe { array.as_ref() }
      .subregs()
      .map(|subreg| unsafe { subreg.as_ref() }.region() as *const _)
      .collect();
    assert_eq!(regions.len(), 3);
    assert!(regions[0] != regions[1] && regions[1] != regions[2]);

    HostArray::free(&mut salloc, &mut store, array);
  }

  #[test]
  fn lookup_distinguishes_exact_and_intersecting() {
    let mut salloc = Salloc::new();
    let mut store = RegionStore::new();
    let pz = page::size();

    let span = range(0x300 * pz, 2 * pz);
    let array = HostArray::allocate(&mut salloc, &mut store, span, 1, None).unwrap();

    assert!(matches!(
      HostArray::find(&store, span.start(), span.len()),
      Find::Exact(found) if found == array
    ));
    assert!(matches!(
      HostArray::find(&store, span.start(), 0),
      Find::Exact(found) if found == array
    ));
    assert!(matches!(
      HostArray::find(&store, span.start() + 16, span.len() - 32),
      Find::Intersects(found) if found == array
    ));
    assert!(matches!(
      HostArray::find(&store, span.end() + pz, pz),
      Find::Missing
    ));

    HostArray::free(&mut salloc, &mut store, array);
  }

  #[test]
  fn adjacent_arrays_share_a_boundary_region() {
    let mut salloc = Salloc::new();
    let mut store = RegionStore::new();
    let pz = page::size();

    // first array ends mid-page; the second begins right after it
    let first = HostArray::allocate(&mut salloc, &mut store, range(0x400 * pz, pz + 256), 1, None)
      .unwrap();
    let second = HostArray::allocate(
      &mut salloc,
      &mut store,
      range(0x400 * pz + pz + 256, 512),
      1,
      None,
    )
    .unwrap();

    let first_tail = unsafe { first.as_ref() }.subregs().last().unwrap();
    let second_head = unsafe { second.as_ref() }.subregs().next().unwrap();
    let shared = unsafe { first_tail.as_ref() }.region() as *const _;
    assert_eq!(shared, unsafe { second_head.as_ref() }.region() as *const _);
    assert_eq!(unsafe { first_tail.as_ref() }.region().subregs().count(), 2);

    HostArray::free(&mut salloc, &mut store, second);
    HostArray::free(&mut salloc, &mut store, first);
    assert!(store.is_empty());
  }

  #[test]
  fn link_slots_track_per_device_links() {
    let mut salloc = Salloc::new();
    let mut store = RegionStore::new();
    let pz = page::size();

    let mut array = HostArray::allocate(&mut salloc, &mut store, range(0x500 * pz, pz), 2, None)
      .unwrap();
    assert!(!unsafe { array.as_ref() }.has_links());

    let buf = crate::DevBuffer(0x1234 as *mut _);
    Link::allocate(&mut salloc, buf, 1, array).unwrap();
    assert!(unsafe { array.as_ref() }.has_links());
    assert!(unsafe { array.as_ref() }.link(0).is_none());
    assert_eq!(unsafe { array.as_ref() }.link(1).unwrap().buf(), buf);

    unsafe { array.as_mut() }.remove_link(&mut salloc, 1);
    assert!(!unsafe { array.as_ref() }.has_links());

    HostArray::free(&mut salloc, &mut store, array);
  }
}
