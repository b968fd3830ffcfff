//! Subregions: the intersection of a host array with a page-aligned region.
//!
//! Actuality fields are atomics rather than lock-protected state: the sync
//! worker updates them while faulting threads hold the global reader lock,
//! and `kernel_begin` reads them under that same reader lock.

use crate::backend::Devices;
use crate::host_array::HostArray;
use crate::range::MemRange;
use crate::region::Region;
use crate::salloc::Salloc;
use crate::stat::Stats;
use crate::store::RegionStore;
use crate::{Error, Protection, Result, UsageMode};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

/// Sentinel for "no device holds the primary copy".
pub const NO_DEVICE: usize = usize::MAX;

pub struct Subreg {
  range: MemRange,
  host_array: *mut HostArray,
  region: *mut Region,
  /// Whether the host holds a current copy.
  actual_host: AtomicBool,
  /// Bit `d` set iff device `d` holds a current copy.
  actual_mask: AtomicU64,
  /// One of the set mask bits, or [NO_DEVICE].
  actual_device: AtomicUsize,
  /// Recorded usage mode of the live kernel(s); 0 when none.
  usage: AtomicU8,
  /// Number of live kernels over this subregion.
  usage_count: AtomicUsize,
}

impl Subreg {
  /// Allocates a subregion and places it in the region covering its pages,
  /// creating that region when none exists yet.
  ///
  /// With `initial_dev` set the subregion starts device-actual and the
  /// covering region is fully protected.
  pub fn allocate(
    salloc: &mut Salloc,
    store: &mut RegionStore,
    range: MemRange,
    initial_dev: Option<usize>,
  ) -> Result<NonNull<Subreg>> {
    let subreg = Subreg {
      range,
      host_array: std::ptr::null_mut(),
      region: std::ptr::null_mut(),
      actual_host: AtomicBool::new(initial_dev.is_none()),
      actual_mask: AtomicU64::new(initial_dev.map_or(0, |dev| 1 << dev)),
      actual_device: AtomicUsize::new(initial_dev.unwrap_or(NO_DEVICE)),
      usage: AtomicU8::new(0),
      usage_count: AtomicUsize::new(0),
    };
    let subreg = salloc.alloc_value(subreg)?;

    let result = match store.find(range.start()) {
      Some(mut region) => unsafe { region.as_mut().add_subreg(salloc, subreg) },
      None => Region::allocate(salloc, store, subreg).map(|_| ()),
    };
    if let Err(error) = result {
      unsafe { salloc.free_value(subreg) };
      return Err(error);
    }

    if initial_dev.is_some() {
      let region = unsafe { subreg.as_ref().region() };
      if !region.is_protected() {
        if let Err(error) = region.apply_protection(Protection::NONE) {
          Self::free(salloc, store, subreg);
          return Err(error);
        }
      }
    }
    Ok(subreg)
  }

  /// Removes the subregion from its region (tearing the region down when it
  /// was the last one) and releases its storage.
  pub fn free(salloc: &mut Salloc, store: &mut RegionStore, subreg: NonNull<Subreg>) {
    unsafe {
      let mut region = NonNull::new_unchecked(subreg.as_ref().region);
      region.as_mut().remove_subreg(salloc, subreg);
      if region.as_ref().is_empty() {
        if region.as_ref().is_protected() {
          if let Err(error) = region.as_ref().unprotect() {
            log::error!("leaving dead region protected: {}", error);
          }
        }
        store.remove(salloc, region);
        salloc.free_value(region);
      }
      salloc.free_value(subreg);
    }
  }

  pub fn range(&self) -> MemRange {
    self.range
  }

  pub fn set_host_array(&mut self, host_array: NonNull<HostArray>) {
    self.host_array = host_array.as_ptr();
  }

  pub fn set_region(&mut self, region: NonNull<Region>) {
    self.region = region.as_ptr();
  }

  pub fn host_array(&self) -> &HostArray {
    unsafe { &*self.host_array }
  }

  pub fn region(&self) -> &Region {
    unsafe { &*self.region }
  }

  pub fn is_actual_on_host(&self) -> bool {
    self.actual_host.load(Ordering::SeqCst)
  }

  pub fn is_actual_on_device(&self, dev: usize) -> bool {
    self.actual_mask.load(Ordering::SeqCst) & (1 << dev) != 0
  }

  pub fn actual_device(&self) -> Option<usize> {
    match self.actual_device.load(Ordering::SeqCst) {
      NO_DEVICE => None,
      dev => Some(dev),
    }
  }

  /// Makes the device copy current, copying host bytes over when needed.
  ///
  /// The first byte is touched before the copy: if the pages are protected
  /// because another device holds the primary copy, the read traps and the
  /// fault pipeline restores the host bytes before they are pushed out.
  pub fn sync_to_device(&self, dev: usize, devices: &Devices, stats: &Stats) -> Result<()> {
    if self.is_actual_on_device(dev) {
      return Ok(());
    }

    unsafe { std::ptr::read_volatile(self.range.as_ptr()) };

    let link = self.host_array().link(dev).ok_or(Error::NoLink)?;
    let devoff = self.range.start() - self.host_array().range().start();
    devices.copy_to_device(
      stats,
      dev,
      link.buf(),
      devoff,
      self.range.as_ptr(),
      self.range.len(),
    )?;

    self.actual_device.store(dev, Ordering::SeqCst);
    self.actual_mask.fetch_or(1 << dev, Ordering::SeqCst);
    Ok(())
  }

  /// Makes the host copy current, pulling bytes from the primary device when
  /// needed. Device actuality is dropped once the host is current.
  pub fn sync_to_host(&self, devices: &Devices, stats: &Stats) -> Result<()> {
    if self.is_actual_on_host() {
      return Ok(());
    }

    let dev = match self.actual_device() {
      Some(dev) => dev,
      None => {
        log::error!("subregion is neither host nor device actual");
        return Err(Error::Internal);
      }
    };
    let link = self.host_array().link(dev).ok_or(Error::NoLink)?;
    let devoff = self.range.start() - self.host_array().range().start();
    devices.copy_to_host(
      stats,
      dev,
      link.buf(),
      devoff,
      self.range.as_ptr(),
      self.range.len(),
    )?;

    self.actual_host.store(true, Ordering::SeqCst);
    self.actual_device.store(NO_DEVICE, Ordering::SeqCst);
    self.actual_mask.store(0, Ordering::SeqCst);
    Ok(())
  }

  /// Records a live kernel over this subregion.
  pub fn record_usage(&self, mode: UsageMode) {
    self.usage.store(mode as u8, Ordering::SeqCst);
    self.usage_count.fetch_add(1, Ordering::SeqCst);
  }

  /// Returns the recorded usage mode, if a kernel is (or just was) live.
  pub fn current_usage(&self) -> Option<UsageMode> {
    match self.usage.load(Ordering::SeqCst) {
      0 => None,
      raw => Some(UsageMode::from_raw(raw)),
    }
  }

  /// Ends one live kernel; the usage mode is cleared with the last one.
  pub fn end_usage(&self) {
    let previous = self.usage_count.load(Ordering::SeqCst);
    if previous == 0 {
      log::warn!("kernel end without a matching kernel begin");
      return;
    }
    if self.usage_count.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.usage.store(0, Ordering::SeqCst);
    }
  }

  /// Applies post-kernel actuality: after a read-write kernel only the
  /// device copy is current.
  pub fn after_kernel(&self, dev: usize) {
    self.actual_host.store(false, Ordering::SeqCst);
    self.actual_mask.store(1 << dev, Ordering::SeqCst);
    self.actual_device.store(dev, Ordering::SeqCst);
  }

  /// Prepares the subregion for a host write into its (previously READ
  /// protected) region: device copies become stale. A subregion that is not
  /// host-actual is first copied back.
  pub fn promote_host_write(&self, devices: &Devices, stats: &Stats) -> Result<()> {
    if self.is_actual_on_host() {
      self.actual_mask.store(0, Ordering::SeqCst);
      self.actual_device.store(NO_DEVICE, Ordering::SeqCst);
      Ok(())
    } else {
      self.sync_to_host(devices, stats)
    }
  }
}
