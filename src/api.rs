//! Public entry points: argument validation, lifecycle state and the
//! process-wide engine slot.

use crate::backend::{self, DevBuffer, DevQueue, DeviceBackend};
use crate::engine::Engine;
use crate::os::ThreadList;
use crate::stat::{StatParameter, StatValue};
use crate::{
  handler, os, page, stw, Error, InitFlags, Placement, PreInitPhase, Result, UsageMode,
};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

/// The engine installed by [init]; read by the signal handlers.
static ENGINE: AtomicPtr<Engine> = AtomicPtr::new(std::ptr::null_mut());

struct PreInit {
  before: Option<ThreadList>,
  immune: Option<ThreadList>,
}

/// Lifecycle state shared by `pre_init` and `init`; the mutex also
/// serializes concurrent `init` races.
static LIFECYCLE: Mutex<PreInit> = Mutex::new(PreInit { before: None, immune: None });

/// Returns the installed engine, if initialization has completed.
pub(crate) fn engine() -> Option<&'static Engine> {
  let engine = ENGINE.load(Ordering::Acquire);
  if engine.is_null() {
    None
  } else {
    Some(unsafe { &*engine })
  }
}

/// Brackets device-runtime initialization to learn which threads belong to
/// it: call with [PreInitPhase::Before] first, initialize the device
/// runtime, then call with [PreInitPhase::After]. The difference of the two
/// thread snapshots becomes the immune set that stop-the-world never
/// suspends.
pub fn pre_init(phase: PreInitPhase) -> Result<()> {
  let mut state = LIFECYCLE.lock().unwrap();

  match phase {
    PreInitPhase::Before => {
      if state.before.is_some() {
        return Err(Error::AlreadyInitialized);
      }
      let mut snapshot = ThreadList::new();
      os::enumerate_threads(&mut snapshot)?;
      state.before = Some(snapshot);
      Ok(())
    }
    PreInitPhase::After => {
      let before = match state.before.as_ref() {
        Some(before) => before,
        None => return Err(Error::InvalidState("pre-init has no before-snapshot")),
      };
      let mut now = ThreadList::new();
      os::enumerate_threads(&mut now)?;
      let mut immune = ThreadList::new();
      stw::thread_diff(before, &now, &mut immune);
      state.immune = Some(immune);
      Ok(())
    }
  }
}

/// Initializes the engine with the backend selected by the API flag.
///
/// `devs` carries one command queue per device; its length is the device
/// count. Must be called once per process.
pub fn init(devs: &[DevQueue], flags: InitFlags) -> Result<()> {
  let backend = backend::select(flags)?;
  init_with_backend(devs, flags, backend)
}

/// Initializes the engine with a caller-provided device backend.
pub fn init_with_backend(
  devs: &[DevQueue],
  flags: InitFlags,
  backend: Box<dyn DeviceBackend>,
) -> Result<()> {
  if devs.is_empty() {
    return Err(Error::InvalidArgument("at least one device is required"));
  }
  if devs.len() > 64 {
    return Err(Error::InvalidArgument("more devices than actuality mask bits"));
  }
  if !page::size().is_power_of_two() {
    return Err(Error::InvalidState("page size is not a power of two"));
  }

  let mut state = LIFECYCLE.lock().unwrap();
  if !ENGINE.load(Ordering::Acquire).is_null() {
    return Err(Error::AlreadyInitialized);
  }

  let immune = state.immune.take().unwrap_or_else(ThreadList::new);
  let engine = Engine::new(devs.to_vec(), flags, backend, immune)?;
  let engine: &'static Engine = Box::leak(engine);

  handler::install()?;
  #[cfg(target_os = "linux")]
  handler::install_suspend_handler()?;
  engine.spawn_workers()?;

  ENGINE.store(engine as *const Engine as *mut Engine, Ordering::Release);
  Ok(())
}

fn installed() -> Result<&'static Engine> {
  engine().ok_or(Error::InvalidState("engine is not initialized"))
}

/// Links `[hostptr, hostptr + nbytes)` with a device buffer on `dev`.
///
/// # Safety
///
/// The range must stay valid (and must not be unmapped or reprotected by the
/// application) until it is unlinked; the engine changes the protection of
/// the pages covering it.
pub unsafe fn link(
  hostptr: *mut u8,
  nbytes: usize,
  dev: usize,
  devbuf: DevBuffer,
  placement: Placement,
) -> Result<()> {
  if hostptr.is_null() || devbuf.0.is_null() {
    return Err(Error::Null);
  }
  if nbytes == 0 {
    return Err(Error::InvalidArgument("nbytes must not be zero"));
  }
  let engine = installed()?;
  if dev >= engine.device_count() {
    return Err(Error::InvalidArgument("device index out of range"));
  }
  engine.link(hostptr as usize, nbytes, dev, devbuf, placement)
}

/// Unlinks the array covering `hostptr` from `dev`, or from every device
/// with [crate::ALL_DEVICES]. The array disappears with its last link.
///
/// # Safety
///
/// `hostptr` must be a pointer previously linked (a null pointer is a
/// no-op, matching the registration-free case).
pub unsafe fn unlink(hostptr: *mut u8, dev: usize) -> Result<()> {
  if hostptr.is_null() {
    return Ok(());
  }
  let engine = installed()?;
  if dev != crate::ALL_DEVICES && dev >= engine.device_count() {
    return Err(Error::InvalidArgument("device index out of range"));
  }
  engine.unlink(hostptr as usize, dev)
}

/// Returns the device buffer linked over `hostptr` on `dev`, or `None`.
pub fn translate(hostptr: *const u8, dev: usize) -> Result<Option<DevBuffer>> {
  if hostptr.is_null() {
    return Err(Error::Null);
  }
  let engine = installed()?;
  if dev >= engine.device_count() {
    return Err(Error::InvalidArgument("device index out of range"));
  }
  engine.translate(hostptr as usize, dev)
}

/// Declares that a kernel is about to run over the array covering
/// `hostptr` on `dev`; the device copy is made current first.
///
/// # Safety
///
/// The linked host range must be valid; stale pages are read to push their
/// bytes to the device.
pub unsafe fn kernel_begin(hostptr: *const u8, dev: usize, mode: UsageMode) -> Result<()> {
  if hostptr.is_null() {
    return Err(Error::Null);
  }
  let engine = installed()?;
  if dev >= engine.device_count() {
    return Err(Error::InvalidArgument("device index out of range"));
  }
  engine.kernel_begin(hostptr as usize, dev, mode)
}

/// Declares that the kernel over the array covering `hostptr` on `dev` has
/// finished; host pages are protected according to the declared usage.
///
/// # Safety
///
/// The linked host range must be valid; its pages may be protected by this
/// call.
pub unsafe fn kernel_end(hostptr: *const u8, dev: usize) -> Result<()> {
  if hostptr.is_null() {
    return Err(Error::Null);
  }
  let engine = installed()?;
  if dev >= engine.device_count() {
    return Err(Error::InvalidArgument("device index out of range"));
  }
  engine.kernel_end(hostptr as usize, dev)
}

/// Reads one statistics counter.
pub fn stat(parameter: StatParameter) -> Result<StatValue> {
  Ok(installed()?.stat(parameter))
}

/// Stops the worker threads. Coherence traffic is undefined afterwards;
/// intended for orderly process teardown.
pub fn shutdown() -> Result<()> {
  installed()?.shutdown()
}
