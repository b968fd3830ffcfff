//! The memory-fault signal handler.
//!
//! Only the reader lock, the region lookup, a queue put and the wait on the
//! region's event happen on the signal stack; everything heavy runs on the
//! worker threads. Nothing here may allocate or log.

use crate::queue::{RegionOp, RegionRef};
use crate::{api, os, Error, Result};
use std::mem;
use std::os::raw::c_void;

/// `si_code` value for a SIGSEGV caused by invalid permissions on a mapped
/// object, per POSIX/<bits/siginfo.h>. Not exposed by the `libc` crate for
/// this platform.
#[cfg(any(target_os = "linux", target_os = "macos"))]
const SEGV_ACCERR: libc::c_int = 2;

/// The previously installed SIGSEGV action, honored for faults that are not
/// ours.
static mut OLD_SEGV: Option<libc::sigaction> = None;

#[cfg(target_os = "macos")]
static mut OLD_BUS: Option<libc::sigaction> = None;

/// Installs the fault handler, saving whatever was installed before.
///
/// macOS reports protection violations as SIGBUS, so both signals are
/// claimed there.
pub fn install() -> Result<()> {
  unsafe {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
    action.sa_sigaction = fault_handler as *const () as usize;
    libc::sigfillset(&mut action.sa_mask);
    libc::sigdelset(&mut action.sa_mask, libc::SIGABRT);
    libc::sigdelset(&mut action.sa_mask, libc::SIGSEGV);
    libc::sigdelset(&mut action.sa_mask, libc::SIGBUS);
    // faulting threads must remain suspendable while they wait on the
    // region event, or stop-the-world would never catch them
    #[cfg(target_os = "linux")]
    libc::sigdelset(&mut action.sa_mask, os::suspend_signal());

    let mut old: libc::sigaction = mem::zeroed();
    if libc::sigaction(libc::SIGSEGV, &action, &mut old) != 0 {
      return Err(Error::SystemCall(errno::errno()));
    }
    OLD_SEGV = Some(old);

    #[cfg(target_os = "macos")]
    {
      let mut old: libc::sigaction = mem::zeroed();
      if libc::sigaction(libc::SIGBUS, &action, &mut old) != 0 {
        return Err(Error::SystemCall(errno::errno()));
      }
      OLD_BUS = Some(old);
    }
  }
  Ok(())
}

/// Installs the handler for the stop-the-world suspension signal.
#[cfg(target_os = "linux")]
pub fn install_suspend_handler() -> Result<()> {
  unsafe {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    action.sa_sigaction = suspend_handler as *const () as usize;
    libc::sigemptyset(&mut action.sa_mask);

    if libc::sigaction(os::suspend_signal(), &action, std::ptr::null_mut()) != 0 {
      return Err(Error::SystemCall(errno::errno()));
    }
  }
  Ok(())
}

#[cfg(target_os = "linux")]
extern "C" fn suspend_handler(
  _signal: libc::c_int,
  _info: *mut libc::siginfo_t,
  _context: *mut c_void,
) {
  // a suspension that arrives after the world already resumed (the signal
  // was pending behind a mask) must not park, nobody would wake it
  if let Some(engine) = api::engine() {
    if engine.stw.is_stopping() {
      engine.tsems.park_current();
    }
  }
}

extern "C" fn fault_handler(
  signal: libc::c_int,
  info: *mut libc::siginfo_t,
  context: *mut c_void,
) {
  let address = fault_address(info);
  let code = unsafe { (*info).si_code };

  // only null-free access violations are candidates for coherence faults
  if address == 0 || code != SEGV_ACCERR {
    unsafe { call_old_handler(signal, info, context) };
    return;
  }
  let engine = match api::engine() {
    Some(engine) => engine,
    None => {
      unsafe { call_old_handler(signal, info, context) };
      return;
    }
  };

  let guard = engine.sync.read();
  let region = unsafe { engine.store() }.find(address);
  match region {
    None => {
      drop(guard);
      unsafe { call_old_handler(signal, info, context) };
    }
    Some(region) => {
      // a full queue means the request is dropped; the retried instruction
      // faults again and re-enters here
      if engine.unprot_queue.put(RegionOp::Unprotect(RegionRef::new(region))) {
        unsafe { region.as_ref() }.wait_unprotect();
      }
      drop(guard);
    }
  }
}

#[cfg(target_os = "linux")]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
  unsafe { (*info).si_addr() as usize }
}

#[cfg(target_os = "macos")]
fn fault_address(info: *mut libc::siginfo_t) -> usize {
  unsafe { (*info).si_addr as usize }
}

/// Delegates a fault to the handler that was installed before ours,
/// honoring `SIG_IGN` and `SIG_DFL` shapes.
unsafe fn call_old_handler(
  signal: libc::c_int,
  info: *mut libc::siginfo_t,
  context: *mut c_void,
) {
  #[cfg(target_os = "macos")]
  let old = if signal == libc::SIGBUS { OLD_BUS } else { OLD_SEGV };
  #[cfg(not(target_os = "macos"))]
  let old = OLD_SEGV;

  let old = match old {
    Some(old) => old,
    None => return,
  };

  if old.sa_sigaction == libc::SIG_IGN {
    return;
  }
  if old.sa_sigaction == libc::SIG_DFL {
    let message = b"memlink: unhandled memory fault\n";
    libc::write(2, message.as_ptr() as *const c_void, message.len());
    libc::abort();
  }

  if old.sa_flags & libc::SA_SIGINFO != 0 {
    let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void) =
      mem::transmute(old.sa_sigaction);
    handler(signal, info, context);
  } else {
    let handler: extern "C" fn(libc::c_int) = mem::transmute(old.sa_sigaction);
    handler(signal);
  }
}
