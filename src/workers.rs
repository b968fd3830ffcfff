//! The unprot and sync worker threads.
//!
//! The unprot thread owns protection removal and the stop-the-world window;
//! the sync thread owns device→host copies. Splitting them keeps the world
//! frozen for exactly the span between the first unprotect of a fault group
//! and the completion of its last copy, while the unprot thread stays
//! responsive to further fault requests.

use crate::engine::Engine;
use crate::queue::RegionOp;
use crate::{os, Error, Protection, Result};
use std::thread::{self, JoinHandle};
use std::time::Instant;

pub struct Workers {
  unprot: JoinHandle<()>,
  sync: JoinHandle<()>,
}

/// Spawns both workers and waits for their init handshake; each registers
/// itself in the immune set before posting.
pub fn spawn(engine: &'static Engine) -> Result<Workers> {
  let unprot = thread::Builder::new()
    .name("memlink-unprot".into())
    .spawn(move || unprot_main(engine))
    .map_err(|_| Error::Internal)?;

  let sync = match thread::Builder::new()
    .name("memlink-sync".into())
    .spawn(move || sync_main(engine))
  {
    Ok(sync) => sync,
    Err(_) => {
      engine.unprot_queue.put(RegionOp::Quit);
      return Err(Error::Internal);
    }
  };

  engine.init_sem.wait();
  engine.init_sem.wait();
  Ok(Workers { unprot, sync })
}

impl Workers {
  /// Sends both workers their quit message and joins them.
  pub fn shutdown(self, engine: &Engine) -> Result<()> {
    engine.unprot_queue.put(RegionOp::Quit);
    engine.sync_queue.put(RegionOp::Quit);
    self.unprot.join().map_err(|_| Error::Internal)?;
    self.sync.join().map_err(|_| Error::Internal)?;
    Ok(())
  }
}

fn unprot_main(engine: &'static Engine) {
  engine.stw.add_immune(os::self_thread());
  engine.init_sem.post();

  // regions unprotected but not yet synced back; the world stays frozen
  // while this is nonzero
  let mut pending_regions = 0usize;
  let mut stall_start: Option<Instant> = None;

  loop {
    match engine.unprot_queue.get() {
      RegionOp::Quit => return,

      RegionOp::Unprotect(region_ref) => {
        engine.stats.count_page_fault();
        let region = unsafe { region_ref.as_ref() };

        match region.protection() {
          Protection::NONE => {
            if pending_regions == 0 {
              if engine.stats.enabled() {
                stall_start = Some(Instant::now());
              }
              if let Err(error) = engine.stw.freeze(&engine.tsems, &engine.salloc) {
                log::error!("stopping application threads failed: {}", error);
              }
            }
            if let Err(error) = region.unprotect() {
              log::error!("removing region protection failed: {}", error);
            }
            region.post_unprotect();

            pending_regions += 1;
            if !engine.sync_queue.put(RegionOp::SyncToHost(region_ref)) {
              log::error!("sync queue overflow, resuming without copy-back");
              pending_regions -= 1;
              if pending_regions == 0 {
                engine.stw.resume(&engine.tsems);
              }
            }
          }

          Protection::READ => {
            // a host write after a read-only kernel: the host image is
            // made the only current copy, no world stop required
            if let Err(error) = region.unprotect() {
              log::error!("removing region protection failed: {}", error);
            }
            for subreg in region.subregs() {
              let subreg = unsafe { subreg.as_ref() };
              if let Err(error) = subreg.promote_host_write(&engine.devices, &engine.stats) {
                log::error!("promoting a host write failed: {}", error);
              }
            }
            region.post_unprotect();
          }

          _ => {
            // another thread's fault already cleared the protection
            region.post_unprotect();
          }
        }
      }

      RegionOp::SyncedToHost(_) => {
        pending_regions = pending_regions.saturating_sub(1);
        if pending_regions == 0 {
          engine.stw.resume(&engine.tsems);
          if let Some(start) = stall_start.take() {
            engine.stats.add_fault_time(start.elapsed());
          }
        }
      }

      other => log::error!("unprot thread received an unexpected operation: {:?}", other),
    }
  }
}

fn sync_main(engine: &'static Engine) {
  engine.stw.add_immune(os::self_thread());
  engine.init_sem.post();

  loop {
    match engine.sync_queue.get() {
      RegionOp::Quit => return,

      RegionOp::SyncToHost(region_ref) => {
        let region = unsafe { region_ref.as_ref() };
        for subreg in region.subregs() {
          let subreg = unsafe { subreg.as_ref() };
          if let Err(error) = subreg.sync_to_host(&engine.devices, &engine.stats) {
            log::error!("copying a subregion back to the host failed: {}", error);
          }
        }
        if !engine.unprot_queue.put(RegionOp::SyncedToHost(region_ref)) {
          log::error!("unprot queue overflow, the world may stay frozen");
        }
      }

      other => log::error!("sync thread received an unexpected operation: {:?}", other),
    }
  }
}
