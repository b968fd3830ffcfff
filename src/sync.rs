//! The process-wide reader/writer lock over all coherence bookkeeping.
//!
//! Readers: `kernel_begin`, `translate`, the pre-unlink flush pass and the
//! fault handler (on the signal stack, which is why this wraps a raw pthread
//! lock instead of `std::sync::RwLock` — a thread already holding the read
//! side re-enters it when a touch inside `kernel_begin` faults). Writers:
//! `link`, `unlink`, `kernel_end`.

use std::cell::UnsafeCell;

/// The global bookkeeping lock, with optional blocking of an external
/// runtime's world-stop signal across writer sections.
pub struct RwSync {
  lock: UnsafeCell<libc::pthread_rwlock_t>,
  blocked_signal: Option<libc::c_int>,
  saved_mask: UnsafeCell<libc::sigset_t>,
}

unsafe impl Send for RwSync {}
unsafe impl Sync for RwSync {}

impl RwSync {
  /// Creates the lock; `blocked_signal` is masked while the writer side is
  /// held.
  pub fn new(blocked_signal: Option<libc::c_int>) -> Self {
    let lock = UnsafeCell::new(libc::PTHREAD_RWLOCK_INITIALIZER);
    let saved_mask = UnsafeCell::new(unsafe { std::mem::zeroed() });
    RwSync { lock, blocked_signal, saved_mask }
  }

  /// Acquires the reader side. Usable on the signal stack.
  pub fn read(&self) -> ReadGuard<'_> {
    let result = unsafe { libc::pthread_rwlock_rdlock(self.lock.get()) };
    debug_assert_eq!(result, 0);
    ReadGuard { sync: self }
  }

  /// Acquires the writer side, masking the configured signal first.
  pub fn write(&self) -> WriteGuard<'_> {
    if let Some(signal) = self.blocked_signal {
      unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, self.saved_mask.get());
      }
    }
    let result = unsafe { libc::pthread_rwlock_wrlock(self.lock.get()) };
    debug_assert_eq!(result, 0);
    WriteGuard { sync: self }
  }

  fn unlock(&self) {
    let result = unsafe { libc::pthread_rwlock_unlock(self.lock.get()) };
    debug_assert_eq!(result, 0);
  }
}

/// Holds the reader side of the bookkeeping lock until dropped.
#[must_use]
pub struct ReadGuard<'a> {
  sync: &'a RwSync,
}

impl Drop for ReadGuard<'_> {
  fn drop(&mut self) {
    self.sync.unlock();
  }
}

/// Holds the writer side of the bookkeeping lock until dropped.
#[must_use]
pub struct WriteGuard<'a> {
  sync: &'a RwSync,
}

impl Drop for WriteGuard<'_> {
  fn drop(&mut self) {
    self.sync.unlock();
    if self.sync.blocked_signal.is_some() {
      unsafe {
        libc::pthread_sigmask(
          libc::SIG_SETMASK,
          self.sync.saved_mask.get(),
          std::ptr::null_mut(),
        );
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[test]
  fn readers_are_shared() {
    let sync = RwSync::new(None);

    let first = sync.read();
    let second = sync.read();
    drop(first);
    drop(second);
  }

  #[test]
  fn reader_reentry_does_not_deadlock() {
    let sync = RwSync::new(None);

    let outer = sync.read();
    let inner = sync.read();
    drop(inner);
    drop(outer);
  }

  #[test]
  fn writer_excludes_readers() {
    let sync = Arc::new(RwSync::new(None));
    let counter = Arc::new(AtomicUsize::new(0));

    let guard = sync.write();
    let reader = {
      let sync = Arc::clone(&sync);
      let counter = Arc::clone(&counter);
      std::thread::spawn(move || {
        let _guard = sync.read();
        counter.fetch_add(1, Ordering::SeqCst);
      })
    };

    std::thread::sleep(std::time::Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    drop(guard);
    reader.join().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[cfg(target_os = "linux")]
  #[test]
  fn writer_masks_the_configured_signal() {
    let signal = libc::SIGPWR;
    let sync = RwSync::new(Some(signal));

    let guard = sync.write();
    let mut current: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut current) };
    assert_eq!(unsafe { libc::sigismember(&current, signal) }, 1);

    drop(guard);
    unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut current) };
    assert_eq!(unsafe { libc::sigismember(&current, signal) }, 0);
  }
}
