// mach suspension stops threads kernel-side, so nothing reaches the records
// on that platform
#![cfg_attr(target_os = "macos", allow(dead_code))]

//! Per-thread blocking semaphores for stop-the-world suspension.
//!
//! Each application thread that has ever been suspended owns a record in a
//! binary search tree keyed by its thread id. Records are created by the
//! unprot worker before it delivers the suspension signal; the suspension
//! handler only *finds* its record (reader side, signal stack) and parks on
//! the semaphore. Records are never removed while the engine lives, so a
//! found reference stays valid without holding the lock.

use crate::salloc::Salloc;
use crate::sem::Semaphore;
use crate::{os, Result};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

struct Tsem {
  thread: os::Thread,
  sem: Semaphore,
  blocked: AtomicBool,
  left: *mut Tsem,
  right: *mut Tsem,
}

pub struct TsemSet {
  lock: UnsafeCell<libc::pthread_rwlock_t>,
  root: UnsafeCell<*mut Tsem>,
}

unsafe impl Send for TsemSet {}
unsafe impl Sync for TsemSet {}

impl TsemSet {
  pub fn new() -> Self {
    TsemSet {
      lock: UnsafeCell::new(libc::PTHREAD_RWLOCK_INITIALIZER),
      root: UnsafeCell::new(std::ptr::null_mut()),
    }
  }

  fn read_lock(&self) {
    let result = unsafe { libc::pthread_rwlock_rdlock(self.lock.get()) };
    debug_assert_eq!(result, 0);
  }

  fn write_lock(&self) {
    let result = unsafe { libc::pthread_rwlock_wrlock(self.lock.get()) };
    debug_assert_eq!(result, 0);
  }

  fn unlock(&self) {
    let result = unsafe { libc::pthread_rwlock_unlock(self.lock.get()) };
    debug_assert_eq!(result, 0);
  }

  fn find(&self, thread: os::Thread) -> Option<NonNull<Tsem>> {
    self.read_lock();
    let mut node = unsafe { *self.root.get() };
    let found = loop {
      if node.is_null() {
        break None;
      }
      let current = unsafe { &*node };
      if thread == current.thread {
        break NonNull::new(node);
      }
      node = if thread < current.thread { current.left } else { current.right };
    };
    self.unlock();
    found
  }

  /// Ensures a record exists for `thread` before it is suspended.
  pub fn prepare(&self, salloc: &Mutex<Salloc>, thread: os::Thread) -> Result<()> {
    self.write_lock();
    let result = unsafe {
      let mut slot = self.root.get();
      while !(*slot).is_null() && (**slot).thread != thread {
        slot = if thread < (**slot).thread { &mut (**slot).left } else { &mut (**slot).right };
      }
      if !(*slot).is_null() {
        Ok(())
      } else {
        match Semaphore::new(0) {
          Err(error) => Err(error),
          Ok(sem) => {
            let node = Tsem {
              thread,
              sem,
              blocked: AtomicBool::new(false),
              left: std::ptr::null_mut(),
              right: std::ptr::null_mut(),
            };
            match salloc.lock().unwrap().alloc_value(node) {
              Ok(node) => {
                *slot = node.as_ptr();
                Ok(())
              }
              Err(error) => Err(error),
            }
          }
        }
      }
    };
    self.unlock();
    result
  }

  /// Whether the thread is currently parked on its record.
  pub fn is_blocked(&self, thread: os::Thread) -> bool {
    match self.find(thread) {
      Some(node) => unsafe { node.as_ref() }.blocked.load(Ordering::SeqCst),
      None => false,
    }
  }

  /// Parks the calling thread on its record. Called from the suspension
  /// signal handler; a missing record means the signal was not ours and the
  /// call is a no-op.
  pub fn park_current(&self) {
    if let Some(node) = self.find(os::self_thread()) {
      let node = unsafe { node.as_ref() };
      node.blocked.store(true, Ordering::SeqCst);
      node.sem.wait();
    }
  }

  /// Releases a parked thread; returns whether one was released.
  pub fn post(&self, thread: os::Thread) -> bool {
    match self.find(thread) {
      Some(node) => {
        let node = unsafe { node.as_ref() };
        if node.blocked.swap(false, Ordering::SeqCst) {
          node.sem.post();
          true
        } else {
          false
        }
      }
      None => false,
    }
  }
}
