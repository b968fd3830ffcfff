//! Counting semaphore.
//!
//! Darwin does not ship POSIX unnamed semaphores, so the macOS build uses
//! mach semaphores behind the same interface. `wait` is used on the signal
//! stack by the fault pipeline and retries on interruption.

use crate::{Error, Result};
use std::cell::UnsafeCell;

#[cfg(target_os = "linux")]
pub struct Semaphore {
  inner: UnsafeCell<libc::sem_t>,
}

#[cfg(target_os = "linux")]
unsafe impl Send for Semaphore {}
#[cfg(target_os = "linux")]
unsafe impl Sync for Semaphore {}

#[cfg(target_os = "linux")]
impl Semaphore {
  /// Creates a semaphore with the given initial value.
  pub fn new(value: u32) -> Result<Self> {
    let inner = UnsafeCell::new(unsafe { std::mem::zeroed() });

    if unsafe { libc::sem_init(inner.get(), 0, value) } != 0 {
      return Err(Error::SystemCall(errno::errno()));
    }
    Ok(Semaphore { inner })
  }

  /// Increments the semaphore, waking one waiter.
  pub fn post(&self) {
    let result = unsafe { libc::sem_post(self.inner.get()) };
    debug_assert_eq!(result, 0);
  }

  /// Decrements the semaphore, blocking until a token is available.
  ///
  /// Interruptions by signal delivery (the stop-the-world suspension signal
  /// in particular) are retried.
  pub fn wait(&self) {
    loop {
      if unsafe { libc::sem_wait(self.inner.get()) } == 0 {
        return;
      }
      if errno::errno().0 != libc::EINTR {
        return;
      }
    }
  }
}

#[cfg(target_os = "linux")]
impl Drop for Semaphore {
  fn drop(&mut self) {
    unsafe { libc::sem_destroy(self.inner.get()) };
  }
}

#[cfg(target_os = "macos")]
mod mach_sem {
  use mach::kern_return::kern_return_t;
  use mach::port::mach_port_t;

  pub const SYNC_POLICY_FIFO: libc::c_int = 0;
  pub const KERN_ABORTED: kern_return_t = 14;

  // the mach crate does not bind the semaphore family
  extern "C" {
    pub fn semaphore_create(
      task: mach_port_t,
      semaphore: *mut mach_port_t,
      policy: libc::c_int,
      value: libc::c_int,
    ) -> kern_return_t;
    pub fn semaphore_signal(semaphore: mach_port_t) -> kern_return_t;
    pub fn semaphore_wait(semaphore: mach_port_t) -> kern_return_t;
    pub fn semaphore_destroy(task: mach_port_t, semaphore: mach_port_t) -> kern_return_t;
  }
}

#[cfg(target_os = "macos")]
pub struct Semaphore {
  inner: UnsafeCell<mach::port::mach_port_t>,
}

#[cfg(target_os = "macos")]
unsafe impl Send for Semaphore {}
#[cfg(target_os = "macos")]
unsafe impl Sync for Semaphore {}

#[cfg(target_os = "macos")]
impl Semaphore {
  pub fn new(value: u32) -> Result<Self> {
    let mut port: mach::port::mach_port_t = 0;
    let result = unsafe {
      mach_sem::semaphore_create(
        mach::traps::mach_task_self(),
        &mut port,
        mach_sem::SYNC_POLICY_FIFO,
        value as libc::c_int,
      )
    };

    if result != mach::kern_return::KERN_SUCCESS {
      return Err(Error::SystemCall(errno::errno()));
    }
    Ok(Semaphore { inner: UnsafeCell::new(port) })
  }

  pub fn post(&self) {
    unsafe { mach_sem::semaphore_signal(*self.inner.get()) };
  }

  pub fn wait(&self) {
    loop {
      let result = unsafe { mach_sem::semaphore_wait(*self.inner.get()) };
      if result != mach_sem::KERN_ABORTED {
        return;
      }
    }
  }
}

#[cfg(target_os = "macos")]
impl Drop for Semaphore {
  fn drop(&mut self) {
    unsafe {
      mach_sem::semaphore_destroy(mach::traps::mach_task_self(), *self.inner.get())
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn posted_tokens_are_consumed() {
    let sem = Semaphore::new(2).unwrap();

    sem.wait();
    sem.wait();
    sem.post();
    sem.wait();
  }

  #[test]
  fn post_wakes_another_thread() {
    let sem = Arc::new(Semaphore::new(0).unwrap());
    let waiter = {
      let sem = Arc::clone(&sem);
      std::thread::spawn(move || sem.wait())
    };

    sem.post();
    waiter.join().unwrap();
  }
}
