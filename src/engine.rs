//! The coherence engine: one process-wide handle owning every piece of
//! bookkeeping.
//!
//! The original design kept this state in file-scope globals; here it is one
//! struct so that components receive references instead of reaching for
//! singletons. The single process-wide slot lives in [crate::api], because
//! the signal handlers must find the engine without captures.

use crate::backend::{DevBuffer, Devices};
use crate::host_array::{Find, HostArray};
use crate::link::Link;
use crate::os::ThreadList;
use crate::queue::OpQueue;
use crate::range::MemRange;
use crate::salloc::Salloc;
use crate::sem::Semaphore;
use crate::stat::{StatParameter, StatValue, Stats};
use crate::store::RegionStore;
use crate::stw::StopTheWorld;
use crate::sync::RwSync;
use crate::tsem::TsemSet;
use crate::workers::{self, Workers};
use crate::{
  os, Error, InitFlags, Placement, Result, UsageMode, ALL_DEVICES,
};
use std::cell::UnsafeCell;
use std::sync::Mutex;

pub struct Engine {
  /// The global bookkeeping lock; readers are `kernel_begin`, `translate`
  /// and the fault handler, writers are `link`, `unlink` and `kernel_end`.
  pub(crate) sync: RwSync,
  /// Metadata allocator; used from writer sections and worker startup only.
  pub(crate) salloc: Mutex<Salloc>,
  /// The region store, guarded by `sync`.
  store: UnsafeCell<RegionStore>,
  pub(crate) devices: Devices,
  flags: InitFlags,
  pub(crate) stats: Stats,
  pub(crate) unprot_queue: OpQueue,
  pub(crate) sync_queue: OpQueue,
  pub(crate) tsems: TsemSet,
  pub(crate) stw: StopTheWorld,
  pub(crate) init_sem: Semaphore,
  workers: Mutex<Option<Workers>>,
}

unsafe impl Send for Engine {}
unsafe impl Sync for Engine {}

impl Engine {
  pub fn new(
    queues: Vec<crate::backend::DevQueue>,
    flags: InitFlags,
    backend: Box<dyn crate::backend::DeviceBackend>,
    immune: ThreadList,
  ) -> Result<Box<Engine>> {
    let blocked_signal = if flags.contains(InitFlags::WRITER_SIG_BLOCK) {
      Some(os::gc_suspend_signal())
    } else {
      None
    };

    Ok(Box::new(Engine {
      sync: RwSync::new(blocked_signal),
      salloc: Mutex::new(Salloc::new()),
      store: UnsafeCell::new(RegionStore::new()),
      devices: Devices::new(backend, queues),
      flags,
      stats: Stats::new(flags.contains(InitFlags::STAT)),
      unprot_queue: OpQueue::new(),
      sync_queue: OpQueue::new(),
      tsems: TsemSet::new(),
      stw: StopTheWorld::new(immune),
      init_sem: Semaphore::new(0)?,
      workers: Mutex::new(None),
    }))
  }

  /// Starts the worker threads; part of init, after the engine is pinned.
  pub fn spawn_workers(&'static self) -> Result<()> {
    let workers = workers::spawn(self)?;
    *self.workers.lock().unwrap() = Some(workers);
    Ok(())
  }

  /// Shared view of the region store; callers hold the reader lock.
  pub(crate) unsafe fn store(&self) -> &RegionStore {
    &*self.store.get()
  }

  /// Exclusive view of the region store; callers hold the writer lock.
  unsafe fn store_mut(&self) -> &mut RegionStore {
    &mut *self.store.get()
  }

  pub fn device_count(&self) -> usize {
    self.devices.count()
  }

  /// Registers a host range and binds it to a device buffer.
  pub fn link(
    &self,
    address: usize,
    nbytes: usize,
    dev: usize,
    devbuf: DevBuffer,
    placement: Placement,
  ) -> Result<()> {
    let _guard = self.sync.write();
    let mut salloc = self.salloc.lock().unwrap();
    let store = unsafe { self.store_mut() };

    match HostArray::find(store, address, nbytes) {
      Find::Intersects(_) => Err(Error::RangeRegistered),
      Find::Exact(array) => {
        if unsafe { array.as_ref() }.link(dev).is_some() {
          return Err(Error::LinkExists);
        }
        if placement == Placement::OnDevice {
          return Err(Error::InvalidArgument(
            "on-device placement requires an unregistered range",
          ));
        }
        Link::allocate(&mut salloc, devbuf, dev, array)?;
        Ok(())
      }
      Find::Missing => {
        let initial_dev = match placement {
          Placement::OnDevice => Some(dev),
          Placement::OnHost => None,
        };
        let array = HostArray::allocate(
          &mut salloc,
          store,
          MemRange::new(address, nbytes),
          self.devices.count(),
          initial_dev,
        )?;
        if let Err(error) = Link::allocate(&mut salloc, devbuf, dev, array) {
          HostArray::free(&mut salloc, store, array);
          return Err(error);
        }
        Ok(())
      }
    }
  }

  /// Removes the link for `dev` (or all links); the array is dropped with
  /// its last link. Unless disabled, device state is flushed back first.
  pub fn unlink(&self, address: usize, dev: usize) -> Result<()> {
    if !self.flags.contains(InitFlags::UNLINK_NO_SYNC_BACK) {
      let _guard = self.sync.read();
      if let Find::Exact(array) = HostArray::find(unsafe { self.store() }, address, 0) {
        unsafe { array.as_ref() }.touch();
      }
    }

    let _guard = self.sync.write();
    let mut salloc = self.salloc.lock().unwrap();
    let store = unsafe { self.store_mut() };

    match HostArray::find(store, address, 0) {
      Find::Missing => Err(Error::UnknownHostPointer),
      Find::Exact(mut array) | Find::Intersects(mut array) => {
        unsafe {
          if dev == ALL_DEVICES {
            for dev in 0..self.devices.count() {
              array.as_mut().remove_link(&mut salloc, dev);
            }
          } else {
            array.as_mut().remove_link(&mut salloc, dev);
          }
          if !array.as_ref().has_links() {
            HostArray::free(&mut salloc, store, array);
          }
        }
        Ok(())
      }
    }
  }

  /// Returns the device buffer linked over `address` on `dev`, if any.
  pub fn translate(&self, address: usize, dev: usize) -> Result<Option<DevBuffer>> {
    let _guard = self.sync.read();

    match HostArray::find(unsafe { self.store() }, address, 0) {
      Find::Missing => Ok(None),
      Find::Exact(array) | Find::Intersects(array) => {
        Ok(unsafe { array.as_ref() }.link(dev).map(|link| link.buf()))
      }
    }
  }

  /// Makes the device copy of the covering array current before a kernel
  /// launch.
  pub fn kernel_begin(&self, address: usize, dev: usize, mode: UsageMode) -> Result<()> {
    let _guard = self.sync.read();

    match HostArray::find(unsafe { self.store() }, address, 0) {
      Find::Missing => Err(Error::UnknownHostPointer),
      Find::Exact(array) | Find::Intersects(array) => {
        unsafe { array.as_ref() }.begin_kernel(dev, mode, &self.devices, &self.stats)
      }
    }
  }

  /// Records kernel completion: actuality moves to the device after a
  /// read-write kernel and the covering regions are protected accordingly.
  pub fn kernel_end(&self, address: usize, dev: usize) -> Result<()> {
    let _guard = self.sync.write();

    match HostArray::find(unsafe { self.store() }, address, 0) {
      Find::Missing => Err(Error::UnknownHostPointer),
      Find::Exact(array) | Find::Intersects(array) => {
        unsafe { array.as_ref() }.end_kernel(dev)
      }
    }
  }

  /// Reads one statistics counter.
  pub fn stat(&self, parameter: StatParameter) -> StatValue {
    match parameter {
      StatParameter::Enabled => StatValue::Flag(self.stats.enabled()),
      StatParameter::DeviceCount => StatValue::Count(self.devices.count() as u64),
      StatParameter::CopyTime => StatValue::Seconds(self.stats.copy_time()),
      StatParameter::PageFaults => StatValue::Count(self.stats.page_faults()),
      StatParameter::PageFaultTime => StatValue::Seconds(self.stats.fault_time()),
    }
  }

  /// Drains and joins the worker threads. The engine cannot be used for
  /// coherence traffic afterwards.
  pub fn shutdown(&self) -> Result<()> {
    match self.workers.lock().unwrap().take() {
      Some(workers) => workers.shutdown(self),
      None => Ok(()),
    }
  }
}
