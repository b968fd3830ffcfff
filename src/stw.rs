//! Stop-the-world: freezing every non-immune application thread across the
//! window in which a region is unprotected but not yet refilled.
//!
//! Driven exclusively by the unprot worker. Linux parks targets through a
//! directed real-time signal whose handler waits on the thread's semaphore;
//! macOS suspends the thread port directly.

use crate::os::{self, ThreadList};
use crate::salloc::Salloc;
use crate::tsem::TsemSet;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct StopTheWorld {
  immune: Mutex<ThreadList>,
  stopped: Mutex<ThreadList>,
  /// True between freeze and resume; the suspension handler refuses to park
  /// outside this window (a pending signal may outlive the stop).
  stopping: AtomicBool,
}

/// Collects the threads present in `after` but not in `before`.
pub fn thread_diff(before: &ThreadList, after: &ThreadList, out: &mut ThreadList) {
  out.clear();
  for thread in after.iter() {
    if !before.contains(thread) {
      out.push(thread);
    }
  }
}

impl StopTheWorld {
  /// Creates the coordinator with the initial immune set (the device
  /// runtime's own threads, recorded across `pre_init`).
  pub fn new(immune: ThreadList) -> Self {
    StopTheWorld {
      immune: Mutex::new(immune),
      stopped: Mutex::new(ThreadList::new()),
      stopping: AtomicBool::new(false),
    }
  }

  #[cfg_attr(target_os = "macos", allow(dead_code))]
  pub fn is_stopping(&self) -> bool {
    self.stopping.load(Ordering::SeqCst)
  }

  /// Marks a thread as never-to-be-suspended (the workers add themselves).
  pub fn add_immune(&self, thread: os::Thread) {
    let mut immune = self.immune.lock().unwrap();
    if !immune.contains(thread) && !immune.push(thread) {
      log::error!("immune thread set is full");
    }
  }

  /// Freezes every application thread except the caller, iterating until a
  /// full enumeration pass finds nothing new (threads spawned mid-pass are
  /// caught by the next one).
  pub fn freeze(&self, tsems: &TsemSet, salloc: &Mutex<Salloc>) -> Result<()> {
    let me = os::self_thread();
    let immune = self.immune.lock().unwrap();
    let mut stopped = self.stopped.lock().unwrap();
    let mut list = ThreadList::new();
    self.stopping.store(true, Ordering::SeqCst);

    loop {
      os::enumerate_threads(&mut list)?;
      let mut newly_stopped = 0;

      for thread in list.iter() {
        if thread == me || immune.contains(thread) || stopped.contains(thread) {
          continue;
        }
        if self.suspend_one(tsems, salloc, thread).is_err() {
          // the thread exited between enumeration and delivery
          continue;
        }
        if stopped.push(thread) {
          newly_stopped += 1;
        } else {
          log::error!("stopped thread set is full, a thread may fail to resume");
        }
      }

      if newly_stopped == 0 {
        return Ok(());
      }
    }
  }

  /// Resumes every thread stopped by the last [StopTheWorld::freeze].
  pub fn resume(&self, tsems: &TsemSet) {
    let mut stopped = self.stopped.lock().unwrap();
    self.stopping.store(false, Ordering::SeqCst);
    for thread in stopped.iter() {
      self.resume_one(tsems, thread);
    }
    stopped.clear();
  }

  #[cfg(target_os = "linux")]
  fn suspend_one(
    &self,
    tsems: &TsemSet,
    salloc: &Mutex<Salloc>,
    thread: os::Thread,
  ) -> Result<()> {
    if tsems.is_blocked(thread) {
      // already parked by an earlier pass that raced with thread reuse
      return Ok(());
    }
    tsems.prepare(salloc, thread)?;
    os::deliver_signal(thread, os::suspend_signal())
  }

  #[cfg(target_os = "linux")]
  fn resume_one(&self, tsems: &TsemSet, thread: os::Thread) {
    tsems.post(thread);
  }

  #[cfg(target_os = "macos")]
  fn suspend_one(
    &self,
    _tsems: &TsemSet,
    _salloc: &Mutex<Salloc>,
    thread: os::Thread,
  ) -> Result<()> {
    os::suspend_thread(thread)
  }

  #[cfg(target_os = "macos")]
  fn resume_one(&self, _tsems: &TsemSet, thread: os::Thread) {
    if let Err(error) = os::resume_thread(thread) {
      log::error!("resuming a stopped thread failed: {}", error);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn diff_yields_new_threads_only() {
    let mut before = ThreadList::new();
    let mut after = ThreadList::new();
    let mut result = ThreadList::new();

    before.push(10);
    before.push(20);
    after.push(20);
    after.push(30);
    after.push(40);

    thread_diff(&before, &after, &mut result);
    assert_eq!(result.iter().count(), 2);
    assert!(result.contains(30));
    assert!(result.contains(40));
    assert!(!result.contains(20));
  }

  #[test]
  fn immune_registration_deduplicates() {
    let stw = StopTheWorld::new(ThreadList::new());

    stw.add_immune(7);
    stw.add_immune(7);
    assert_eq!(stw.immune.lock().unwrap().iter().count(), 1);
  }
}
